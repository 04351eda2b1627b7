use super::helpers::{local_configs, upload};
use nexar_dgc::{DataType, DgcError, DgcState, Layer, clip_gradient, gradient_all_reduce};

#[test]
fn test_local_clipping_before_compression() {
    let configs = local_configs(1, |c| {
        c.local_gradient_clipping = true;
        c.clipping_threshold = 2.5;
    });
    let config = &configs[0];
    let input = upload(config, "input", &[3.0f32, 4.0, 0.3, 0.4]);
    let output = upload(config, "output", &[0.0f32; 4]);
    let layers = [Layer::new("a", 2), Layer::new("b", 2)];
    let mut state = DgcState::new();

    gradient_all_reduce(DataType::F32, &input, &output, &layers, config, &mut state).unwrap();
    config.stream().unwrap().synchronize().unwrap();

    // Layer a has norm 5 and is halved; layer b is within the threshold.
    let expected = vec![1.5f32, 2.0, 0.3, 0.4];
    assert_eq!(input.to_vec::<f32>().unwrap(), expected);
    assert_eq!(output.to_vec::<f32>().unwrap(), expected);
}

#[test]
fn test_clip_gradient_f64() {
    let configs = local_configs(1, |c| c.clipping_threshold = 6.0);
    let config = &configs[0];
    let grads = upload(config, "grads", &[6.0f64, 8.0, 0.0, 1.0, 1.0]);
    let layers = [Layer::new("w", 2), Layer::new("b", 3)];
    let mut state = DgcState::new();

    clip_gradient(DataType::F64, &grads, &layers, config, &mut state).unwrap();
    config.stream().unwrap().synchronize().unwrap();

    let out = grads.to_vec::<f64>().unwrap();
    assert!((out[0] - 3.6).abs() < 1e-12);
    assert!((out[1] - 4.8).abs() < 1e-12);
    assert_eq!(&out[2..], &[0.0, 1.0, 1.0]);
    assert_eq!(state.step(), 0);
    assert_eq!(state.tokens().len(), 1);
}

#[test]
fn test_clip_gradient_rejects_integers() {
    let configs = local_configs(1, |_| {});
    let config = &configs[0];
    let grads = upload(config, "grads", &[1i64, 2, 3]);
    let mut state = DgcState::new();
    let err = clip_gradient(DataType::I64, &grads, &[Layer::new("x", 3)], config, &mut state)
        .unwrap_err();
    assert!(matches!(err, DgcError::UnsupportedDType { dtype: DataType::I64, .. }));
}
