use super::helpers::{local_configs, upload};
use nexar_dgc::{DataType, DgcState, Layer, gradient_all_reduce};
use std::collections::HashSet;

fn bit(mask: &[u32], i: usize) -> bool {
    (mask[i / 32] >> (i % 32)) & 1 == 1
}

fn grads(n: usize) -> Vec<f32> {
    (0..n).map(|i| ((i * 613) % n) as f32 / n as f32 - 0.5).collect()
}

#[test]
fn test_unsent_gradients_accumulate() {
    let configs = local_configs(1, |c| {
        c.init_sparsity = 0.999;
        c.final_sparsity = 0.999;
    });
    let config = &configs[0];
    let n = 1000;
    let g = grads(n);
    let input = upload(config, "input", &g);
    let output = upload(config, "output", &vec![0.0f32; n]);
    let layers = [Layer::new("fc", n)];
    let mut state = DgcState::new();

    let mut masks = Vec::new();
    for _ in 0..2 {
        gradient_all_reduce(DataType::F32, &input, &output, &layers, config, &mut state).unwrap();
        config.stream().unwrap().synchronize().unwrap();
        let mask = state.selection_mask("fc").unwrap().unwrap();
        assert_eq!(mask.len(), n.div_ceil(32));

        // The mask marks exactly the indices that were sent.
        let sent: HashSet<usize> = state.compacted::<f32>().unwrap()[0]
            .indices
            .iter()
            .filter(|&&i| i != u32::MAX)
            .map(|&i| i as usize)
            .collect();
        let marked: HashSet<usize> = (0..n).filter(|&i| bit(&mask, i)).collect();
        assert_eq!(sent, marked);
        masks.push(mask);
    }

    let (v, a) = state.momentum_state::<f32>("fc").unwrap().unwrap();
    for i in 0..n {
        let (first, second) = (bit(&masks[0], i), bit(&masks[1], i));
        let (ev, ea) = match (first, second) {
            (_, true) => (0.0, 0.0),
            (true, false) => (g[i], g[i]),
            (false, false) => {
                let v = 0.9f32 * g[i] + g[i];
                (v, g[i] + v)
            }
        };
        assert_eq!((v[i], a[i]), (ev, ea), "element {i}");
    }
    assert!(state.momentum_state::<f32>("missing").unwrap().is_none());
}

#[test]
fn test_momentum_is_per_layer() {
    let configs = local_configs(1, |_| {});
    let config = &configs[0];
    let mut state = DgcState::new();
    let buf_a = upload(config, "a", &[1.0f32; 4]);
    let buf_b = upload(config, "b", &[2.0f32; 3]);

    // Small layers are sent in full, so each call clears its own layer.
    for (buf, layer) in [(&buf_a, Layer::new("a", 4)), (&buf_b, Layer::new("b", 3))] {
        gradient_all_reduce(DataType::F32, buf, buf, &[layer], config, &mut state).unwrap();
    }
    config.stream().unwrap().synchronize().unwrap();

    assert_eq!(state.offset_byte_counter(), 28);
    let (va, _) = state.momentum_state::<f32>("a").unwrap().unwrap();
    let (vb, _) = state.momentum_state::<f32>("b").unwrap().unwrap();
    assert_eq!((va.len(), vb.len()), (4, 3));
    assert!(va.iter().chain(&vb).all(|&x| x == 0.0));
    assert_eq!(buf_b.to_vec::<f32>().unwrap(), vec![2.0; 3]);
}
