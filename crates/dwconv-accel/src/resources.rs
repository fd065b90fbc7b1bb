//! Streams, handles and descriptors owned by one layer.
//!
//! Setup creates a fixed pool of [`STREAM_COUNT`] streams with one library
//! handle bound to each, the filter descriptor, an optional bias descriptor
//! and, per input, a tensor descriptor pair plus a convolution descriptor.
//! Teardown releases them in reverse dependency order exactly once.

use crate::backend::{ConvBackend, ConvDescriptors, DescriptorId, DescriptorKind};
use dwconv_common::{DepthwiseConfig, Result};
use tracing::{debug, info};

/// Streams in the pool: forward, weight-gradient and input-gradient work
/// each get their own during backward passes.
pub const STREAM_COUNT: usize = 3;

/// Stream used by each pass.
pub const FORWARD_STREAM: usize = 0;
pub const BACKWARD_FILTER_STREAM: usize = 1;
pub const BACKWARD_DATA_STREAM: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Ready,
    TornDown,
}

/// One stream with its bound handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHandle {
    pub stream: DescriptorId,
    pub handle: DescriptorId,
}

/// Tensor and convolution descriptors for one input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputDescriptors {
    pub input: DescriptorId,
    pub output: DescriptorId,
    pub conv: DescriptorId,
}

/// Every accelerator resource a layer holds.
#[derive(Debug)]
pub struct LayerResources {
    state: LifecycleState,
    streams: Vec<StreamHandle>,
    filter: Option<DescriptorId>,
    bias: Option<DescriptorId>,
    inputs: Vec<InputDescriptors>,
}

impl Default for LayerResources {
    fn default() -> Self {
        Self::new()
    }
}

impl LayerResources {
    pub fn new() -> Self {
        Self {
            state: LifecycleState::Uninitialized,
            streams: Vec::new(),
            filter: None,
            bias: None,
            inputs: Vec::new(),
        }
    }

    /// Create every resource for a layer with `num_inputs` inputs.
    ///
    /// Any creation failure is fatal; resources created before it are
    /// released before the error is returned.
    pub fn setup<B: ConvBackend + ?Sized>(
        backend: &mut B,
        config: &DepthwiseConfig,
        num_inputs: usize,
    ) -> Result<Self> {
        let mut res = Self::new();
        if let Err(e) = res.create_all(backend, config, num_inputs) {
            res.release_all(backend);
            return Err(e);
        }
        res.state = LifecycleState::Ready;
        info!(
            backend = backend.name(),
            streams = res.streams.len(),
            inputs = num_inputs,
            bias = res.bias.is_some(),
            "accelerator resources ready"
        );
        Ok(res)
    }

    fn create_all<B: ConvBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        config: &DepthwiseConfig,
        num_inputs: usize,
    ) -> Result<()> {
        for _ in 0..STREAM_COUNT {
            let stream = backend.create_descriptor(DescriptorKind::Stream)?;
            match backend.create_descriptor(DescriptorKind::Handle { stream }) {
                Ok(handle) => self.streams.push(StreamHandle { stream, handle }),
                Err(e) => {
                    backend.destroy_descriptor(stream);
                    return Err(e);
                }
            }
        }

        self.filter = Some(backend.create_descriptor(DescriptorKind::Filter {
            out_channels: config.num_output,
            in_per_group: config.channels_per_group(),
            kernel_h: config.kernel_height,
            kernel_w: config.kernel_width,
        })?);

        for _ in 0..num_inputs {
            self.add_input(backend)?;
        }

        if config.has_bias {
            self.bias = Some(backend.create_descriptor(DescriptorKind::Tensor)?);
        }
        Ok(())
    }

    fn add_input<B: ConvBackend + ?Sized>(&mut self, backend: &mut B) -> Result<()> {
        let input = backend.create_descriptor(DescriptorKind::Tensor)?;
        let output = match backend.create_descriptor(DescriptorKind::Tensor) {
            Ok(id) => id,
            Err(e) => {
                backend.destroy_descriptor(input);
                return Err(e);
            }
        };
        let conv = match backend.create_descriptor(DescriptorKind::Convolution) {
            Ok(id) => id,
            Err(e) => {
                backend.destroy_descriptor(output);
                backend.destroy_descriptor(input);
                return Err(e);
            }
        };
        self.inputs.push(InputDescriptors { input, output, conv });
        Ok(())
    }

    /// Release everything. A no-op unless the resources are ready, so a
    /// second call, or a call after a failed setup, releases nothing.
    pub fn teardown<B: ConvBackend + ?Sized>(&mut self, backend: &mut B) {
        if self.state != LifecycleState::Ready {
            debug!(state = ?self.state, "teardown skipped");
            return;
        }
        self.release_all(backend);
        self.state = LifecycleState::TornDown;
        info!(backend = backend.name(), "accelerator resources released");
    }

    fn release_all<B: ConvBackend + ?Sized>(&mut self, backend: &mut B) {
        if let Some(bias) = self.bias.take() {
            backend.destroy_descriptor(bias);
        }
        for d in self.inputs.drain(..).rev() {
            backend.destroy_descriptor(d.conv);
            backend.destroy_descriptor(d.output);
            backend.destroy_descriptor(d.input);
        }
        if let Some(filter) = self.filter.take() {
            backend.destroy_descriptor(filter);
        }
        for s in self.streams.drain(..).rev() {
            backend.destroy_descriptor(s.handle);
            backend.destroy_descriptor(s.stream);
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == LifecycleState::Ready
    }

    pub fn streams(&self) -> &[StreamHandle] {
        &self.streams
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn bias(&self) -> Option<DescriptorId> {
        self.bias
    }

    /// Handle bound to `stream`.
    pub fn handle(&self, stream: usize) -> Option<DescriptorId> {
        self.streams.get(stream).map(|s| s.handle)
    }

    /// Descriptors for input `index`, combined with the shared filter.
    pub fn conv_descriptors(&self, index: usize) -> Option<ConvDescriptors> {
        let d = self.inputs.get(index)?;
        Some(ConvDescriptors { input: d.input, output: d.output, filter: self.filter?, conv: d.conv })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::{Faults, ReferenceBackend};

    fn config(has_bias: bool) -> DepthwiseConfig {
        DepthwiseConfig { has_bias, ..DepthwiseConfig::depthwise(4, 2, 3) }
    }

    #[test]
    fn setup_creates_expected_resources() {
        let mut b = ReferenceBackend::new();
        let res = LayerResources::setup(&mut b, &config(true), 2).unwrap();
        // 3 streams + 3 handles + filter + 2 * 3 per-input + bias
        assert_eq!(b.live_descriptors(), 3 + 3 + 1 + 6 + 1);
        assert!(res.is_ready());
        assert_eq!(res.streams().len(), STREAM_COUNT);
        assert!(res.conv_descriptors(1).is_some());
        assert!(res.conv_descriptors(2).is_none());
    }

    #[test]
    fn no_bias_descriptor_without_bias() {
        let mut b = ReferenceBackend::new();
        let res = LayerResources::setup(&mut b, &config(false), 1).unwrap();
        assert!(res.bias().is_none());
        assert_eq!(b.live_descriptors(), 3 + 3 + 1 + 3);
    }

    #[test]
    fn failed_setup_releases_partial_resources() {
        for fail_after in 0..14 {
            let mut b = ReferenceBackend::new().with_faults(Faults {
                fail_create_after: Some(fail_after),
                ..Default::default()
            });
            let err = LayerResources::setup(&mut b, &config(true), 2);
            assert!(err.is_err(), "setup should fail after {fail_after} creations");
            assert_eq!(b.live_descriptors(), 0, "leak after {fail_after} creations");
            assert_eq!(b.stats().invalid_destroys, 0);
        }
    }

    #[test]
    fn teardown_twice_releases_once() {
        let mut b = ReferenceBackend::new();
        let mut res = LayerResources::setup(&mut b, &config(true), 1).unwrap();
        res.teardown(&mut b);
        res.teardown(&mut b);
        assert_eq!(res.state(), LifecycleState::TornDown);
        assert_eq!(b.live_descriptors(), 0);
        assert_eq!(b.stats().descriptors_destroyed, b.stats().descriptors_created);
        assert_eq!(b.stats().invalid_destroys, 0);
    }

    #[test]
    fn teardown_before_setup_is_noop() {
        let mut b = ReferenceBackend::new();
        let mut res = LayerResources::new();
        res.teardown(&mut b);
        assert_eq!(res.state(), LifecycleState::Uninitialized);
        assert_eq!(b.stats().descriptors_destroyed, 0);
    }
}
