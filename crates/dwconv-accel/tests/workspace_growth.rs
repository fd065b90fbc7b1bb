//! Workspace sizing across reshapes: monotonic growth, allocation only on
//! growth, and the zero-scratch fallback with later recovery.

use dwconv_accel::{
    CapacityOutcome, CompactWeights, ConvOp, DepthwiseConfig, DepthwiseLayer, InputShape,
    LayoutShape, ReferenceBackend, STREAM_COUNT, required_bytes_per_stream,
};

fn config() -> DepthwiseConfig {
    DepthwiseConfig { has_bias: false, ..DepthwiseConfig::depthwise(4, 2, 3) }
}

fn weights(config: &DepthwiseConfig) -> CompactWeights {
    let layout = LayoutShape::from_config(config);
    CompactWeights::from_values((0..layout.compact_len()).map(|v| (v % 7) as f32 * 0.25).collect())
}

fn layer(backend: &mut ReferenceBackend) -> DepthwiseLayer<&mut ReferenceBackend> {
    let config = config();
    let w = weights(&config);
    DepthwiseLayer::setup(backend, config, 1, w).unwrap()
}

fn forward(layer: &mut DepthwiseLayer<&mut ReferenceBackend>, shape: InputShape) -> Vec<f32> {
    let input: Vec<f32> = (0..shape.count()).map(|v| ((v * 13) % 11) as f32 - 5.0).collect();
    let plan = &layer.plans()[0];
    let mut output = vec![0.0; plan.problem.output_len()];
    layer.forward(0, &input, &mut output).unwrap();
    output
}

#[test]
fn capacity_tracks_running_maximum() {
    let mut backend = ReferenceBackend::new();
    let mut l = layer(&mut backend);

    let mut running_max = 0;
    for batch in [2, 4, 1, 4, 8, 3] {
        let calls_before = l.backend().stats().allocation_calls;
        l.reshape(&[InputShape::new(batch, 4, 8, 8)]).unwrap();

        let required = required_bytes_per_stream(l.plans());
        let grew = required > running_max;
        running_max = running_max.max(required);

        assert_eq!(l.workspace_capacity(), running_max * STREAM_COUNT, "batch {batch}");
        let calls = l.backend().stats().allocation_calls - calls_before;
        assert_eq!(calls, usize::from(grew), "batch {batch}: allocation only on growth");
    }
    assert!(running_max > 0, "some plan should use scratch");
}

#[test]
fn slices_are_disjoint_and_sized_per_stream() {
    let mut backend = ReferenceBackend::new();
    let mut l = layer(&mut backend);
    let outcome = l.reshape(&[InputShape::new(2, 4, 8, 8)]).unwrap();

    let required = required_bytes_per_stream(l.plans());
    assert_eq!(outcome, CapacityOutcome::Grown { capacity: required * STREAM_COUNT });
    let expected: Vec<_> = (0..STREAM_COUNT).map(|k| k * required..(k + 1) * required).collect();
    assert_eq!(l.workspace_slices(), expected.as_slice());
}

#[test]
fn old_allocation_released_before_growing() {
    let mut backend = ReferenceBackend::new();
    let mut l = layer(&mut backend);
    l.reshape(&[InputShape::new(1, 4, 8, 8)]).unwrap();
    l.reshape(&[InputShape::new(8, 4, 8, 8)]).unwrap();

    let stats = l.backend().stats();
    assert_eq!(stats.releases, 1);
    assert_eq!(stats.allocated_bytes, l.workspace_capacity());
}

#[test]
fn failed_allocation_degrades_to_zero_scratch() {
    let shape = InputShape::new(2, 4, 8, 8);

    let mut healthy_backend = ReferenceBackend::new();
    let mut healthy = layer(&mut healthy_backend);
    healthy.reshape(&[shape]).unwrap();
    let expected = forward(&mut healthy, shape);

    let mut backend = ReferenceBackend::new();
    backend.faults_mut().failing_allocations = 1;
    let mut l = layer(&mut backend);
    let outcome = l.reshape(&[shape]).unwrap();

    assert!(matches!(outcome, CapacityOutcome::Degraded { .. }));
    assert!(l.is_degraded());
    assert_eq!(l.workspace_capacity(), 0);
    assert!(l.workspace_slices().is_empty());
    for op in ConvOp::ALL {
        let plan = l.plan_for(0, op).unwrap();
        assert!(plan.algorithm.is_zero_scratch(), "{op} kept {:?}", plan.algorithm);
        assert_eq!(plan.workspace_bytes, 0);
    }

    // Slower, never wrong.
    assert_eq!(forward(&mut l, shape), expected);
}

#[test]
fn recovers_after_fallback() {
    let shape = InputShape::new(2, 4, 8, 8);
    let mut backend = ReferenceBackend::new();
    backend.faults_mut().failing_allocations = 1;
    let mut l = layer(&mut backend);

    assert!(matches!(l.reshape(&[shape]).unwrap(), CapacityOutcome::Degraded { .. }));

    // Same shape again: plans are resolved afresh and the allocation retried.
    let outcome = l.reshape(&[shape]).unwrap();
    let required = required_bytes_per_stream(l.plans());
    assert!(required > 0);
    assert_eq!(outcome, CapacityOutcome::Grown { capacity: required * STREAM_COUNT });
    assert!(!l.is_degraded());
    assert_eq!(l.workspace_slices(), &[0..required, required..2 * required, 2 * required..3 * required]);
    assert!(!l.plans()[0].is_zero_scratch());
}

#[test]
fn growth_failure_releases_previous_allocation() {
    let mut backend = ReferenceBackend::new();
    let mut l = layer(&mut backend);
    l.reshape(&[InputShape::new(1, 4, 8, 8)]).unwrap();
    assert!(l.workspace_capacity() > 0);

    let capacity = l.workspace_capacity();
    l.backend_mut().set_memory_limit(capacity);
    l.reshape(&[InputShape::new(8, 4, 8, 8)]).unwrap();

    assert!(l.is_degraded());
    assert_eq!(l.workspace_capacity(), 0);
    assert_eq!(l.backend().stats().allocated_bytes, 0);
}

#[test]
fn zero_ceiling_needs_no_workspace() {
    let mut backend = ReferenceBackend::new();
    let config = DepthwiseConfig { workspace_limit_bytes: 0, ..config() };
    let w = weights(&config);
    let mut l = DepthwiseLayer::setup(&mut backend, config, 1, w).unwrap();

    assert_eq!(l.reshape(&[InputShape::new(2, 4, 8, 8)]).unwrap(), CapacityOutcome::Unchanged);
    assert_eq!(l.workspace_capacity(), 0);
    assert_eq!(l.backend().stats().allocation_calls, 0);
    for op in ConvOp::ALL {
        assert_eq!(l.plan_for(0, op).unwrap().workspace_bytes, 0);
    }
}
