use super::helpers::{local_configs, run_ranks, upload};
use nexar_dgc::{
    DataType, Device, DeviceStream, DgcError, DgcState, Layer, MAX_LAYER_ELEMENTS,
    gradient_all_reduce,
};
use std::collections::HashSet;

/// Distinct magnitudes in (0, 1], alternating sign.
fn spread(n: usize) -> Vec<f32> {
    (0..n)
        .map(|i| {
            let v = ((i * 7919) % n + 1) as f32 / n as f32;
            if i % 2 == 0 { v } else { -v }
        })
        .collect()
}

#[test]
fn test_large_layer_sends_exactly_target() {
    let configs = local_configs(1, |c| {
        c.init_sparsity = 0.999;
        c.final_sparsity = 0.999;
    });
    let config = &configs[0];
    let grads = spread(10_000);
    let input = upload(config, "input", &grads);
    let output = upload(config, "output", &vec![0.0f32; 10_000]);
    let layers = [Layer::new("conv1", 10_000)];
    let mut state = DgcState::new();

    gradient_all_reduce(DataType::F32, &input, &output, &layers, config, &mut state).unwrap();
    config.stream().unwrap().synchronize().unwrap();

    assert_eq!(state.targets().unwrap(), vec![10]);
    assert_eq!(state.selected_counts().unwrap(), vec![10]);

    let threshold = state.thresholds::<f32>().unwrap()[0];
    let compacted = &state.compacted::<f32>().unwrap()[0];
    let unique: HashSet<u32> = compacted.indices.iter().copied().collect();
    assert_eq!(unique.len(), 10);
    for (&v, &i) in compacted.values.iter().zip(&compacted.indices) {
        assert!((i as usize) < 10_000);
        assert_eq!(v, grads[i as usize]);
        assert!(v.abs() >= threshold);
    }

    let out = output.to_vec::<f32>().unwrap();
    let nonzero: Vec<usize> = (0..10_000).filter(|&i| out[i] != 0.0).collect();
    assert_eq!(nonzero.len(), 10);
    for i in nonzero {
        assert!(unique.contains(&(i as u32)));
        assert_eq!(out[i], grads[i]);
    }
}

#[test]
fn test_spikes_win_over_noise() {
    let configs = local_configs(1, |c| {
        c.init_sparsity = 0.999;
        c.final_sparsity = 0.999;
    });
    let config = &configs[0];
    let mut grads: Vec<f32> = spread(10_000).iter().map(|v| v * 0.01).collect();
    let spikes: Vec<usize> = (0..10).map(|k| 313 + k * 997).collect();
    for &i in &spikes {
        grads[i] = 100.0;
    }
    let input = upload(config, "input", &grads);
    let output = upload(config, "output", &vec![0.0f32; 10_000]);
    let layers = [Layer::new("fc", 10_000)];
    let mut state = DgcState::new();

    gradient_all_reduce(DataType::F32, &input, &output, &layers, config, &mut state).unwrap();
    config.stream().unwrap().synchronize().unwrap();

    assert_eq!(state.selected_counts().unwrap(), vec![10]);
    let mut sent: Vec<usize> = state.compacted::<f32>().unwrap()[0]
        .indices
        .iter()
        .map(|&i| i as usize)
        .collect();
    sent.sort();
    assert_eq!(sent, spikes);

    let out = output.to_vec::<f32>().unwrap();
    for (i, &v) in out.iter().enumerate() {
        let expected = if spikes.contains(&i) { 100.0 } else { 0.0 };
        assert_eq!(v, expected, "index {i}");
    }
}

#[test]
fn test_step_epoch_and_layer_offsets() {
    let configs = local_configs(1, |c| {
        c.batch_size_per_gpu = 100;
        c.num_examples_per_epoch = 1000;
    });
    let config = &configs[0];
    let mut state = DgcState::new();
    let both = [Layer::new("a", 6), Layer::new("b", 4)];
    let only_a = [Layer::new("a", 6)];

    let buf = upload(config, "grads", &[1.0f32; 10]);
    gradient_all_reduce(DataType::F32, &buf, &buf, &both, config, &mut state).unwrap();
    assert_eq!(state.offset_byte_counter(), 40);
    gradient_all_reduce(DataType::F32, &buf, &buf, &only_a, config, &mut state).unwrap();
    gradient_all_reduce(DataType::F32, &buf, &buf, &only_a, config, &mut state).unwrap();
    config.stream().unwrap().synchronize().unwrap();

    // Known layers keep their region.
    assert_eq!(state.offset_byte_counter(), 40);
    assert_eq!(state.step(), 3);
    assert!((state.epoch() - 0.3).abs() < 1e-12);
    assert_eq!(state.layer_steps("a"), Some(3));
    assert_eq!(state.layer_steps("b"), Some(1));
    assert_eq!(state.layer_steps("c"), None);
}

#[test]
fn test_sparsity_follows_schedule() {
    let configs = local_configs(1, |c| {
        c.warmup_epochs = 1.0;
        c.batch_size_per_gpu = 25;
        c.num_examples_per_epoch = 100;
    });
    let config = &configs[0];
    let mut state = DgcState::new();
    let layers = [Layer::new("fc", 4)];
    let buf = upload(config, "grads", &[0.5f32; 4]);

    let mut seen = Vec::new();
    for _ in 0..6 {
        gradient_all_reduce(DataType::F32, &buf, &buf, &layers, config, &mut state).unwrap();
        seen.push(state.last_sparsity().unwrap());
    }
    config.stream().unwrap().synchronize().unwrap();

    assert!((seen[0] - 0.75).abs() < 1e-12);
    assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    assert!((seen[4] - 0.999).abs() < 1e-12);
    assert_eq!(seen[4], seen[5]);
}

#[test]
fn test_state_is_bound_to_first_dtype() {
    let configs = local_configs(1, |_| {});
    let config = &configs[0];
    let mut state = DgcState::new();
    let layers = [Layer::new("w", 4)];

    let f32_buf = upload(config, "f32", &[1.0f32; 4]);
    gradient_all_reduce(DataType::F32, &f32_buf, &f32_buf, &layers, config, &mut state).unwrap();

    let f64_buf = upload(config, "f64", &[1.0f64; 4]);
    let err = gradient_all_reduce(DataType::F64, &f64_buf, &f64_buf, &layers, config, &mut state)
        .unwrap_err();
    assert!(matches!(
        err,
        DgcError::DTypeMismatch {
            expected: DataType::F32,
            actual: DataType::F64
        }
    ));
    assert_eq!(state.dtype(), Some(DataType::F32));
    config.stream().unwrap().synchronize().unwrap();
}

#[test]
fn test_rejects_layer_beyond_index_range() {
    let configs = local_configs(1, |_| {});
    let config = &configs[0];
    let mut state = DgcState::new();
    let buf = upload(config, "grads", &[0.0f32; 4]);
    let layers = [Layer::new("embedding", MAX_LAYER_ELEMENTS + 1)];

    let err =
        gradient_all_reduce(DataType::F32, &buf, &buf, &layers, config, &mut state).unwrap_err();
    assert!(matches!(err, DgcError::LayerTooLarge { .. }));
    assert_eq!(state.step(), 0);
    assert_eq!(state.offset_byte_counter(), 0);
}

#[test]
fn test_out_of_device_memory() {
    let mut configs = local_configs(1, |_| {});
    let mut config = configs
        .remove(0)
        .with_stream(DeviceStream::new(Device::with_capacity(8192)).unwrap());
    config.finish_configuration().unwrap();

    let mut state = DgcState::new();
    let buf = upload(&config, "grads", &vec![0.25f32; 1500]);
    let layers = [Layer::new("fc", 1500)];
    let err =
        gradient_all_reduce(DataType::F32, &buf, &buf, &layers, &config, &mut state).unwrap_err();
    assert!(matches!(err, DgcError::OutOfMemory { .. }));
    assert_eq!(state.step(), 0);
    assert!(state.tokens().is_consistent());
}

#[test]
fn test_empty_layer_is_all_padding() {
    let configs = local_configs(2, |_| {});
    let results = run_ranks(configs, |rank, config| {
        let mut state = DgcState::new();
        let layers = [Layer::new("empty", 0), Layer::new("bias", 2)];
        let buf = upload(&config, "grads", &[rank as f32 + 1.0, 2.0]);
        gradient_all_reduce(DataType::F32, &buf, &buf, &layers, &config, &mut state).unwrap();
        config.stream().unwrap().synchronize().unwrap();
        let compacted = state.compacted::<f32>().unwrap();
        (buf.to_vec::<f32>().unwrap(), compacted[0].indices.clone())
    });

    for (out, empty_indices) in results {
        assert_eq!(out, vec![1.5, 2.0]);
        assert_eq!(empty_indices, vec![u32::MAX; 10]);
    }
}
