//! Resource lifecycle of a whole layer: setup, teardown, drop.

use dwconv_accel::{
    CompactWeights, DepthwiseConfig, DepthwiseError, DepthwiseLayer, Faults, InputShape,
    LayoutShape, LifecycleState, ReferenceBackend,
};

fn base_config() -> DepthwiseConfig {
    DepthwiseConfig::depthwise(3, 2, 3)
}

fn weights(config: &DepthwiseConfig) -> CompactWeights {
    CompactWeights::zeros(&LayoutShape::from_config(config))
}

#[test]
fn drop_releases_everything() {
    let mut backend = ReferenceBackend::new();
    {
        let config = base_config();
        let w = weights(&config);
        let mut l = DepthwiseLayer::setup(&mut backend, config, 2, w).unwrap();
        l.reshape(&[InputShape::new(2, 3, 6, 6), InputShape::new(1, 3, 5, 7)]).unwrap();
        assert_eq!(l.state(), LifecycleState::Ready);
        assert!(l.backend().live_descriptors() > 0);
    }
    let stats = backend.stats();
    assert_eq!(backend.live_descriptors(), 0);
    assert_eq!(stats.descriptors_destroyed, stats.descriptors_created);
    assert_eq!(stats.invalid_destroys, 0);
    assert_eq!(stats.allocated_bytes, 0);
}

#[test]
fn explicit_teardown_then_drop_releases_once() {
    let mut backend = ReferenceBackend::new();
    {
        let config = base_config();
        let w = weights(&config);
        let mut l = DepthwiseLayer::setup(&mut backend, config, 1, w).unwrap();
        l.reshape(&[InputShape::new(1, 3, 4, 4)]).unwrap();
        l.teardown();
        l.teardown();
        assert_eq!(l.state(), LifecycleState::TornDown);
    }
    let stats = backend.stats();
    assert_eq!(stats.descriptors_destroyed, stats.descriptors_created);
    assert_eq!(stats.invalid_destroys, 0);
    assert_eq!(stats.releases, 1);
}

#[test]
fn operations_after_teardown_are_rejected() {
    let mut backend = ReferenceBackend::new();
    let config = base_config();
    let w = weights(&config);
    let mut l = DepthwiseLayer::setup(&mut backend, config, 1, w).unwrap();
    let shape = InputShape::new(1, 3, 4, 4);
    l.reshape(&[shape]).unwrap();
    l.teardown();

    let mut out = vec![0.0; 6 * 16];
    assert!(matches!(l.forward(0, &[0.0; 48], &mut out), Err(DepthwiseError::TornDown)));
    assert!(matches!(l.backward(0, &[0.0; 48], &out, None), Err(DepthwiseError::TornDown)));
    assert!(matches!(l.reshape(&[shape]), Err(DepthwiseError::TornDown)));
    assert!(l.plans().is_empty());
}

#[test]
fn failed_setup_leaks_nothing() {
    // 3 streams + 3 handles + filter + 3 per-input + bias = 11 creations.
    for fail_after in 0..11 {
        let mut backend = ReferenceBackend::new()
            .with_faults(Faults { fail_create_after: Some(fail_after), ..Default::default() });
        let config = base_config();
        let w = weights(&config);
        let err = DepthwiseLayer::setup(&mut backend, config, 1, w).unwrap_err();
        assert!(matches!(err, DepthwiseError::ResourceCreation { .. }), "{err}");
        assert_eq!(backend.live_descriptors(), 0, "leak after {fail_after} creations");
        assert_eq!(backend.stats().invalid_destroys, 0);
    }
}

#[test]
fn invalid_config_creates_no_resources() {
    let mut backend = ReferenceBackend::new();
    let config = DepthwiseConfig { num_spatial_axes: 3, ..base_config() };
    let w = weights(&config);
    let err = DepthwiseLayer::setup(&mut backend, config, 1, w).unwrap_err();
    assert!(matches!(err, DepthwiseError::UnsupportedSpatialAxes { axes: 3 }));
    assert!(err.is_configuration());
    assert_eq!(backend.stats().descriptors_created, 0);

    let config = DepthwiseConfig { group_count: 2, ..base_config() };
    let w = weights(&config);
    let err = DepthwiseLayer::setup(&mut backend, config, 1, w).unwrap_err();
    assert!(matches!(err, DepthwiseError::ChannelsNotDivisible { channels: 3, groups: 2 }));
    assert_eq!(backend.stats().descriptors_created, 0);
}
