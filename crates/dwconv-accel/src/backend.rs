//! Capability interface over the accelerator's grouped-convolution library.
//!
//! The layer drives the vendor library through exactly four operations:
//! descriptor creation/destruction, best-algorithm-under-ceiling queries,
//! scratch-size queries and execution with scratch. Device memory for the
//! shared workspace goes through [`DeviceAllocator`], kept separate because
//! allocation failure is recoverable while every other failure is not.

use dwconv_common::{ConvProblem, Result};
use std::fmt;

// ── Descriptors ─────────────────────────────────────────────────────

/// Opaque handle to a live accelerator resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescriptorId(pub u64);

impl fmt::Display for DescriptorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "desc#{}", self.0)
    }
}

/// What to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    /// An execution stream.
    Stream,
    /// A library handle bound to `stream`.
    Handle { stream: DescriptorId },
    /// Grouped filter, `out_channels × in_per_group × kernel_h × kernel_w`.
    Filter { out_channels: usize, in_per_group: usize, kernel_h: usize, kernel_w: usize },
    /// 4-D tensor layout; its dimensions are supplied per call.
    Tensor,
    /// Convolution geometry; padding and stride are supplied per call.
    Convolution,
}

impl DescriptorKind {
    /// Short resource name for errors and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::Handle { .. } => "library handle",
            Self::Filter { .. } => "filter descriptor",
            Self::Tensor => "tensor descriptor",
            Self::Convolution => "convolution descriptor",
        }
    }
}

/// Descriptors that together describe one input's convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvDescriptors {
    pub input: DescriptorId,
    pub output: DescriptorId,
    pub filter: DescriptorId,
    pub conv: DescriptorId,
}

// ── Operations and algorithms ───────────────────────────────────────

/// The three convolution passes that each get their own plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConvOp {
    Forward,
    BackwardFilter,
    BackwardData,
}

impl ConvOp {
    pub const ALL: [ConvOp; 3] = [Self::Forward, Self::BackwardFilter, Self::BackwardData];

    pub fn name(self) -> &'static str {
        match self {
            Self::Forward => "forward",
            Self::BackwardFilter => "backward-filter",
            Self::BackwardData => "backward-data",
        }
    }
}

impl fmt::Display for ConvOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForwardAlgo {
    ImplicitGemm,
    ImplicitPrecompGemm,
    Gemm,
    Direct,
    Fft,
    FftTiling,
    Winograd,
    WinogradNonfused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackwardFilterAlgo {
    Algo0,
    Algo1,
    Fft,
    Algo3,
    WinogradNonfused,
    FftTiling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackwardDataAlgo {
    Algo0,
    Algo1,
    Fft,
    FftTiling,
    Winograd,
    WinogradNonfused,
}

/// An algorithm choice for one [`ConvOp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Forward(ForwardAlgo),
    BackwardFilter(BackwardFilterAlgo),
    BackwardData(BackwardDataAlgo),
}

impl Algorithm {
    /// The baseline algorithm for `op`, guaranteed to need no scratch.
    pub fn zero_scratch(op: ConvOp) -> Self {
        match op {
            ConvOp::Forward => Self::Forward(ForwardAlgo::ImplicitGemm),
            ConvOp::BackwardFilter => Self::BackwardFilter(BackwardFilterAlgo::Algo0),
            ConvOp::BackwardData => Self::BackwardData(BackwardDataAlgo::Algo0),
        }
    }

    pub fn op(&self) -> ConvOp {
        match self {
            Self::Forward(_) => ConvOp::Forward,
            Self::BackwardFilter(_) => ConvOp::BackwardFilter,
            Self::BackwardData(_) => ConvOp::BackwardData,
        }
    }

    pub fn is_zero_scratch(&self) -> bool {
        *self == Self::zero_scratch(self.op())
    }
}

// ── Execution arguments ─────────────────────────────────────────────

/// Buffers for one execution.
///
/// Forward output and the input gradient are overwritten. Filter and bias
/// gradients accumulate into what is already there (`beta = 1`).
pub enum ExecArgs<'a> {
    Forward {
        input: &'a [f32],
        filter: &'a [f32],
        bias: Option<&'a [f32]>,
        output: &'a mut [f32],
    },
    BackwardFilter {
        input: &'a [f32],
        output_grad: &'a [f32],
        filter_grad: &'a mut [f32],
        bias_grad: Option<&'a mut [f32]>,
    },
    BackwardData {
        filter: &'a [f32],
        output_grad: &'a [f32],
        input_grad: &'a mut [f32],
    },
}

impl ExecArgs<'_> {
    pub fn op(&self) -> ConvOp {
        match self {
            Self::Forward { .. } => ConvOp::Forward,
            Self::BackwardFilter { .. } => ConvOp::BackwardFilter,
            Self::BackwardData { .. } => ConvOp::BackwardData,
        }
    }
}

// ── Traits ──────────────────────────────────────────────────────────

/// The grouped-convolution library as seen by the layer.
///
/// All calls are synchronous on the host.
pub trait ConvBackend {
    fn name(&self) -> &'static str;

    fn create_descriptor(&mut self, kind: DescriptorKind) -> Result<DescriptorId>;

    /// Release a descriptor. Releasing is infallible, as in the vendor API.
    fn destroy_descriptor(&mut self, id: DescriptorId);

    /// Best algorithm for `op` whose scratch requirement does not exceed
    /// `limit_bytes`, or `None` if there is no such algorithm.
    fn find_algorithm(
        &mut self,
        handle: DescriptorId,
        op: ConvOp,
        descs: &ConvDescriptors,
        problem: &ConvProblem,
        limit_bytes: usize,
    ) -> Result<Option<Algorithm>>;

    /// Exact scratch requirement of `algo` for `problem`.
    fn workspace_size(
        &mut self,
        handle: DescriptorId,
        descs: &ConvDescriptors,
        problem: &ConvProblem,
        algo: Algorithm,
    ) -> Result<usize>;

    /// Run `algo` on the handle's stream using `workspace` as scratch.
    fn execute(
        &mut self,
        handle: DescriptorId,
        descs: &ConvDescriptors,
        problem: &ConvProblem,
        algo: Algorithm,
        args: ExecArgs<'_>,
        workspace: &mut [u8],
    ) -> Result<()>;
}

/// Device allocation failed; the caller decides how to degrade.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("device allocation of {requested} bytes failed ({available} bytes available)")]
pub struct AllocError {
    pub requested: usize,
    pub available: usize,
}

/// Raw device memory for the shared workspace.
pub trait DeviceAllocator {
    type Buffer: AsMut<[u8]>;

    fn allocate(&mut self, bytes: usize) -> std::result::Result<Self::Buffer, AllocError>;

    fn release(&mut self, buffer: Self::Buffer);
}

// A layer may borrow its backend instead of owning it.
impl<T: ConvBackend + ?Sized> ConvBackend for &mut T {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn create_descriptor(&mut self, kind: DescriptorKind) -> Result<DescriptorId> {
        (**self).create_descriptor(kind)
    }

    fn destroy_descriptor(&mut self, id: DescriptorId) {
        (**self).destroy_descriptor(id)
    }

    fn find_algorithm(
        &mut self,
        handle: DescriptorId,
        op: ConvOp,
        descs: &ConvDescriptors,
        problem: &ConvProblem,
        limit_bytes: usize,
    ) -> Result<Option<Algorithm>> {
        (**self).find_algorithm(handle, op, descs, problem, limit_bytes)
    }

    fn workspace_size(
        &mut self,
        handle: DescriptorId,
        descs: &ConvDescriptors,
        problem: &ConvProblem,
        algo: Algorithm,
    ) -> Result<usize> {
        (**self).workspace_size(handle, descs, problem, algo)
    }

    fn execute(
        &mut self,
        handle: DescriptorId,
        descs: &ConvDescriptors,
        problem: &ConvProblem,
        algo: Algorithm,
        args: ExecArgs<'_>,
        workspace: &mut [u8],
    ) -> Result<()> {
        (**self).execute(handle, descs, problem, algo, args, workspace)
    }
}

impl<T: DeviceAllocator + ?Sized> DeviceAllocator for &mut T {
    type Buffer = T::Buffer;

    fn allocate(&mut self, bytes: usize) -> std::result::Result<Self::Buffer, AllocError> {
        (**self).allocate(bytes)
    }

    fn release(&mut self, buffer: Self::Buffer) {
        (**self).release(buffer)
    }
}
