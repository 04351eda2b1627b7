use super::helpers::{local_configs, upload};
use nexar_dgc::{DataType, DgcConfig, DgcError, DgcState, Layer, gradient_all_reduce};

#[test]
fn test_set_requires_finishing_again() {
    let mut configs = local_configs(1, |_| {});
    let mut config = configs.remove(0);
    let buf = upload(&config, "grads", &[1.0f32; 4]);
    let layers = [Layer::new("w", 4)];
    let mut state = DgcState::new();

    config.set("final_sparsity", "0.99").unwrap();
    assert!(!config.is_configured());
    let err =
        gradient_all_reduce(DataType::F32, &buf, &buf, &layers, &config, &mut state).unwrap_err();
    assert!(matches!(err, DgcError::NotConfigured(_)));

    config.finish_configuration().unwrap();
    gradient_all_reduce(DataType::F32, &buf, &buf, &layers, &config, &mut state).unwrap();
    config.stream().unwrap().synchronize().unwrap();
    assert_eq!(state.step(), 1);
}

#[test]
fn test_set_errors() {
    let mut config = DgcConfig::default();
    assert!(matches!(
        config.set("sparsity", "0.9"),
        Err(DgcError::UnknownConfigKey(key)) if key == "sparsity"
    ));
    assert!(matches!(
        config.set("momentum", "fast"),
        Err(DgcError::InvalidConfigValue { .. })
    ));
    config.set("use_allReduce", "false").unwrap();
    assert!(!config.use_allreduce);
}

#[test]
fn test_finish_needs_stream_and_groups() {
    let mut config = DgcConfig::default();
    assert!(matches!(
        config.finish_configuration(),
        Err(DgcError::NotConfigured(_))
    ));
}

#[test]
fn test_finish_validates_schedule() {
    let mut configs = local_configs(1, |_| {});
    let mut config = configs.remove(0);
    config.set("init_sparsity", "0.9").unwrap();
    config.set("final_sparsity", "0.5").unwrap();
    assert!(matches!(
        config.finish_configuration(),
        Err(DgcError::InvalidConfigValue { key, .. }) if key == "final_sparsity"
    ));
    assert!(!config.is_configured());
}
