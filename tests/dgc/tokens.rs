use super::helpers::{local_configs, upload};
use nexar_dgc::{DataType, DgcState, Layer, gradient_all_reduce};
use std::sync::mpsc;

#[test]
fn test_inflight_calls_use_distinct_tokens() {
    let configs = local_configs(1, |_| {});
    let config = &configs[0];
    let stream = config.stream().unwrap();
    let layers = [Layer::new("w", 8)];
    let buf = upload(config, "grads", &[1.0f32; 8]);
    let mut state = DgcState::new();

    // Hold the stream so neither call can complete.
    let (release, gate) = mpsc::channel::<()>();
    stream
        .enqueue("gate", move |_| {
            gate.recv().ok();
            Ok(())
        })
        .unwrap();

    gradient_all_reduce(DataType::F32, &buf, &buf, &layers, config, &mut state).unwrap();
    gradient_all_reduce(DataType::F32, &buf, &buf, &layers, config, &mut state).unwrap();
    assert_eq!(state.tokens().len(), 2);
    assert_eq!(state.tokens().busy_len(), 2);
    assert!(state.tokens().is_consistent());

    release.send(()).unwrap();
    stream.synchronize().unwrap();

    // Both tokens recycle; the next call reuses one instead of allocating.
    gradient_all_reduce(DataType::F32, &buf, &buf, &layers, config, &mut state).unwrap();
    stream.synchronize().unwrap();
    assert_eq!(state.tokens().len(), 2);
    assert_eq!(state.tokens().busy_len(), 1);
    assert_eq!(state.tokens().free_len(), 1);
    assert!(state.tokens().is_consistent());
}

#[test]
fn test_sequential_calls_share_one_token() {
    let configs = local_configs(1, |_| {});
    let config = &configs[0];
    let layers = [Layer::new("w", 8)];
    let buf = upload(config, "grads", &[1.0f32; 8]);
    let mut state = DgcState::new();

    for _ in 0..5 {
        gradient_all_reduce(DataType::F32, &buf, &buf, &layers, config, &mut state).unwrap();
        config.stream().unwrap().synchronize().unwrap();
    }
    assert_eq!(state.tokens().len(), 1);
}
