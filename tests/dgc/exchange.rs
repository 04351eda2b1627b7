use super::helpers::{local_configs, run_ranks, total_elements, upload};
use nexar_dgc::{CompactedLayer, DataType, DgcConfig, DgcState, Layer, gradient_all_reduce};
use std::collections::HashSet;

#[derive(Clone, Copy, PartialEq)]
enum Exchange {
    MaskedAllReduce,
    DenseAllReduce,
    AllGather,
}

impl Exchange {
    fn apply(self, c: &mut DgcConfig) {
        c.use_allreduce = self != Exchange::AllGather;
        c.use_masked_allreduce = self == Exchange::MaskedAllReduce;
    }
}

fn small_layers() -> Vec<Layer> {
    vec![Layer::new("weight", 6), Layer::new("bias", 3)]
}

fn base() -> Vec<f64> {
    vec![1.0, -2.0, 0.5, 4.0, -0.25, 8.0, 3.0, 0.0, -1.0]
}

/// Every element of a layer no larger than the per-layer minimum is sent,
/// so the result is the exact average.
fn averages_small_layers(exchange: Exchange) {
    let configs = local_configs(4, |c| exchange.apply(c));
    let results = run_ranks(configs, |rank, config| {
        let grads: Vec<f64> = base().iter().map(|v| v * (rank + 1) as f64).collect();
        let input = upload(&config, "input", &grads);
        let output = upload(&config, "output", &[0.0f64; 9]);
        let mut state = DgcState::new();
        gradient_all_reduce(DataType::F64, &input, &output, &small_layers(), &config, &mut state)
            .unwrap();
        config.stream().unwrap().synchronize().unwrap();
        output.to_vec::<f64>().unwrap()
    });

    let expected: Vec<f64> = base().iter().map(|v| v * 2.5).collect();
    for (rank, out) in results.iter().enumerate() {
        assert_eq!(out, &expected, "rank {rank}");
    }
}

#[test]
fn test_allreduce_mode_averages() {
    averages_small_layers(Exchange::MaskedAllReduce);
}

#[test]
fn test_dense_allreduce_mode_averages() {
    averages_small_layers(Exchange::DenseAllReduce);
}

#[test]
fn test_allgather_mode_averages() {
    averages_small_layers(Exchange::AllGather);
}

fn spiky(rank: u32, n: usize) -> Vec<f32> {
    (0..n)
        .map(|i| {
            let noise = ((i * 31 + rank as usize * 17) % 997) as f32 / 1e4;
            if i % 500 == rank as usize * 7 { 50.0 + i as f32 } else { noise }
        })
        .collect()
}

/// Sum of every rank's compacted pairs, in rank order.
fn expected_merge(compacted: &[Vec<CompactedLayer<f32>>], layers: &[Layer]) -> Vec<f32> {
    let mut out = vec![0.0f32; total_elements(layers)];
    for rank in compacted {
        let mut offset = 0;
        for (layer, pairs) in layers.iter().zip(rank) {
            for (&v, &i) in pairs.values.iter().zip(&pairs.indices) {
                if i != u32::MAX {
                    out[offset + i as usize] += v;
                }
            }
            offset += layer.num_elements;
        }
    }
    out
}

/// Distinct valid indices per layer over every rank's compacted pairs.
fn selection_union(compacted: &[Vec<CompactedLayer<f32>>], num_layers: usize) -> Vec<usize> {
    (0..num_layers)
        .map(|l| {
            compacted
                .iter()
                .flat_map(|rank| rank[l].indices.iter().copied())
                .filter(|&i| i != u32::MAX)
                .collect::<HashSet<u32>>()
                .len()
        })
        .collect()
}

fn merges_sparse_layers(exchange: Exchange) {
    let tune = |c: &mut DgcConfig| {
        exchange.apply(c);
        c.init_sparsity = 0.99;
        c.final_sparsity = 0.99;
    };
    let layers = vec![Layer::new("conv", 4000), Layer::new("fc", 1000)];
    let results = run_ranks(local_configs(2, tune), |rank, config| {
        let grads = spiky(rank, 5000);
        let input = upload(&config, "input", &grads);
        let output = upload(&config, "output", &[0.0f32; 5000]);
        let mut state = DgcState::new();
        gradient_all_reduce(DataType::F32, &input, &output, &layers, &config, &mut state).unwrap();
        config.stream().unwrap().synchronize().unwrap();

        let counts = state.selected_counts().unwrap();
        for (count, target) in counts.iter().zip(state.targets().unwrap()) {
            assert!((10..=target).contains(count));
        }
        (
            output.to_vec::<f32>().unwrap(),
            state.compacted::<f32>().unwrap(),
            state.union_counts().unwrap(),
            state.targets().unwrap(),
        )
    });

    let compacted: Vec<_> = results.iter().map(|(_, c, _, _)| c.clone()).collect();
    let expected = expected_merge(&compacted, &layers);
    for (out, _, _, _) in &results {
        assert_eq!(out, &expected);
    }

    let union = selection_union(&compacted, layers.len());
    for (_, _, counts, targets) in &results {
        match exchange {
            Exchange::MaskedAllReduce => {
                let counts = counts.as_ref().unwrap();
                assert_eq!(counts, &union);
                for (count, target) in counts.iter().zip(targets) {
                    assert!(*count <= 2 * target);
                }
            }
            _ => assert!(counts.is_none()),
        }
    }
    // Values are pre-divided by the world size.
    let conv = &compacted[0][0];
    for (v, i) in conv.values.iter().zip(&conv.indices) {
        if *i != u32::MAX {
            assert_eq!(*v, spiky(0, 5000)[*i as usize] / 2.0);
        }
    }
}

#[test]
fn test_allreduce_mode_merges_selected_pairs() {
    merges_sparse_layers(Exchange::MaskedAllReduce);
}

#[test]
fn test_dense_allreduce_mode_merges_selected_pairs() {
    merges_sparse_layers(Exchange::DenseAllReduce);
}

#[test]
fn test_allgather_mode_merges_selected_pairs() {
    merges_sparse_layers(Exchange::AllGather);
}

/// Ranks pick disjoint positions, so the union is the sum of the picks and
/// every picked position comes back with its single contribution.
#[test]
fn test_union_of_disjoint_selections() {
    let tune = |c: &mut DgcConfig| {
        Exchange::MaskedAllReduce.apply(c);
        c.init_sparsity = 0.99;
        c.final_sparsity = 0.99;
    };
    let layers = [Layer::new("emb", 3000)];
    let results = run_ranks(local_configs(3, tune), |rank, config| {
        // Rank r spikes at its target count of positions congruent to r mod 3.
        let grads: Vec<f32> = (0..3000)
            .map(|i| if i < 90 && i % 3 == rank as usize { 300.0 } else { 1e-3 })
            .collect();
        let input = upload(&config, "input", &grads);
        let output = upload(&config, "output", &[0.0f32; 3000]);
        let mut state = DgcState::new();
        gradient_all_reduce(DataType::F32, &input, &output, &layers, &config, &mut state).unwrap();
        config.stream().unwrap().synchronize().unwrap();
        (output.to_vec::<f32>().unwrap(), state.union_counts().unwrap().unwrap())
    });

    for (out, union) in &results {
        assert_eq!(union, &vec![90]);
        for (i, &v) in out.iter().enumerate() {
            let expected = if i < 90 { 100.0 } else { 0.0 };
            assert_eq!(v, expected, "index {i}");
        }
    }
}
