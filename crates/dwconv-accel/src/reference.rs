//! Host emulation of the grouped-convolution library.
//!
//! [`ReferenceBackend`] implements [`ConvBackend`] and [`DeviceAllocator`]
//! in host memory. Every algorithm computes the same grouped convolution with
//! plain loops; what differs is the scratch each one claims to need, taken
//! from a small cost model, and execution fails if the supplied scratch is
//! smaller than that. Descriptor liveness is tracked so double releases and
//! use-after-release are observable, and [`Faults`] injects the failures the
//! layer must survive or report.
//!
//! # Layout
//!
//! * input:  `[batch, channels, height, width]`
//! * filter: `[num_output, channels / groups, kernel_h, kernel_w]`
//! * output: `[batch, num_output, height_out, width_out]`

use crate::backend::{
    AllocError, Algorithm, BackwardDataAlgo, BackwardFilterAlgo, ConvBackend, ConvDescriptors,
    ConvOp, DescriptorId, DescriptorKind, DeviceAllocator, ExecArgs, ForwardAlgo,
};
use dwconv_common::{ConvProblem, DepthwiseError, Result, check_len};
use std::collections::HashMap;
use tracing::{debug, warn};

const F32: usize = std::mem::size_of::<f32>();

// ── Fault injection ─────────────────────────────────────────────────

/// Failures to inject into the next calls.
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// Fail descriptor creation once this many creations have succeeded.
    pub fail_create_after: Option<usize>,
    /// Report no algorithm for these passes.
    pub refuse_algorithms: Vec<ConvOp>,
    /// Fail this many upcoming allocations regardless of the memory limit.
    pub failing_allocations: usize,
}

/// Call counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendStats {
    pub descriptors_created: usize,
    pub descriptors_destroyed: usize,
    /// Releases of ids that were not live.
    pub invalid_destroys: usize,
    pub algorithm_queries: usize,
    pub size_queries: usize,
    pub executions: usize,
    pub allocation_calls: usize,
    pub failed_allocations: usize,
    pub releases: usize,
    pub allocated_bytes: usize,
    pub peak_allocated_bytes: usize,
}

/// One recorded execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionRecord {
    pub handle: DescriptorId,
    pub algorithm: Algorithm,
    pub workspace_len: usize,
}

// ── Backend ─────────────────────────────────────────────────────────

/// Host buffer standing in for device memory.
#[derive(Debug)]
pub struct HostBuffer(Vec<u8>);

impl AsMut<[u8]> for HostBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

/// Host reference implementation of the grouped-convolution library.
#[derive(Debug)]
pub struct ReferenceBackend {
    next_id: u64,
    live: HashMap<DescriptorId, DescriptorKind>,
    memory_limit: usize,
    faults: Faults,
    stats: BackendStats,
    executions: Vec<ExecutionRecord>,
}

impl Default for ReferenceBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceBackend {
    /// Backend with unlimited memory and no faults.
    pub fn new() -> Self {
        Self {
            next_id: 1,
            live: HashMap::new(),
            memory_limit: usize::MAX,
            faults: Faults::default(),
            stats: BackendStats::default(),
            executions: Vec::new(),
        }
    }

    /// Cap the total bytes that may be allocated at once.
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = bytes;
        self
    }

    pub fn with_faults(mut self, faults: Faults) -> Self {
        self.faults = faults;
        self
    }

    /// Adjust injected faults between calls.
    pub fn faults_mut(&mut self) -> &mut Faults {
        &mut self.faults
    }

    pub fn set_memory_limit(&mut self, bytes: usize) {
        self.memory_limit = bytes;
    }

    pub fn stats(&self) -> &BackendStats {
        &self.stats
    }

    pub fn executions(&self) -> &[ExecutionRecord] {
        &self.executions
    }

    /// Number of descriptors currently alive.
    pub fn live_descriptors(&self) -> usize {
        self.live.len()
    }

    pub fn is_live(&self, id: DescriptorId) -> bool {
        self.live.contains_key(&id)
    }

    /// Scratch the cost model assigns to `algo`, or `None` if the algorithm
    /// does not support `problem`.
    pub fn scratch_cost(problem: &ConvProblem, algo: Algorithm) -> Option<usize> {
        let cpg = problem.channels_per_group();
        let kd = problem.kernel_dim();
        let out_px = problem.height_out * problem.width_out;
        let padded_px = (problem.height + 2 * problem.pad_h).next_power_of_two()
            * (problem.width + 2 * problem.pad_w).next_power_of_two();
        let unit_stride = problem.stride_h == 1 && problem.stride_w == 1;
        let winograd_ok = unit_stride && problem.kernel_h == 3 && problem.kernel_w == 3;
        let fft_planes =
            problem.batch * (problem.channels + problem.num_output) + problem.num_output * cpg;
        let im2col = F32 * cpg * kd * out_px;

        match algo {
            Algorithm::Forward(a) => match a {
                ForwardAlgo::ImplicitGemm => Some(0),
                ForwardAlgo::ImplicitPrecompGemm => Some(F32 * kd * out_px),
                ForwardAlgo::Gemm => Some(im2col),
                ForwardAlgo::Direct => None,
                ForwardAlgo::Fft => unit_stride.then_some(2 * F32 * fft_planes * padded_px),
                ForwardAlgo::FftTiling => unit_stride.then_some(2 * F32 * fft_planes * 32 * 32),
                ForwardAlgo::Winograd => winograd_ok.then_some(0),
                ForwardAlgo::WinogradNonfused => {
                    winograd_ok.then_some(F32 * 16 * (problem.batch * problem.channels + problem.num_output * cpg))
                }
            },
            Algorithm::BackwardFilter(a) => match a {
                BackwardFilterAlgo::Algo0 => Some(0),
                BackwardFilterAlgo::Algo1 => Some(F32 * problem.num_output * cpg * kd),
                BackwardFilterAlgo::Algo3 => Some(im2col),
                BackwardFilterAlgo::Fft => unit_stride.then_some(2 * F32 * fft_planes * padded_px),
                BackwardFilterAlgo::FftTiling => {
                    unit_stride.then_some(2 * F32 * fft_planes * 32 * 32)
                }
                BackwardFilterAlgo::WinogradNonfused => {
                    winograd_ok.then_some(F32 * 16 * (problem.batch * problem.num_output + problem.num_output * cpg))
                }
            },
            Algorithm::BackwardData(a) => match a {
                BackwardDataAlgo::Algo0 => Some(0),
                BackwardDataAlgo::Algo1 => Some(im2col),
                BackwardDataAlgo::Fft => unit_stride.then_some(2 * F32 * fft_planes * padded_px),
                BackwardDataAlgo::FftTiling => unit_stride.then_some(2 * F32 * fft_planes * 32 * 32),
                BackwardDataAlgo::Winograd => winograd_ok.then_some(0),
                BackwardDataAlgo::WinogradNonfused => {
                    winograd_ok.then_some(F32 * 16 * (problem.batch * problem.num_output + problem.num_output * cpg))
                }
            },
        }
    }

    /// Candidates for `op`, fastest first.
    fn preference(op: ConvOp) -> &'static [Algorithm] {
        use Algorithm as A;
        match op {
            ConvOp::Forward => &[
                A::Forward(ForwardAlgo::Winograd),
                A::Forward(ForwardAlgo::WinogradNonfused),
                A::Forward(ForwardAlgo::FftTiling),
                A::Forward(ForwardAlgo::Fft),
                A::Forward(ForwardAlgo::ImplicitPrecompGemm),
                A::Forward(ForwardAlgo::Gemm),
                A::Forward(ForwardAlgo::Direct),
                A::Forward(ForwardAlgo::ImplicitGemm),
            ],
            ConvOp::BackwardFilter => &[
                A::BackwardFilter(BackwardFilterAlgo::WinogradNonfused),
                A::BackwardFilter(BackwardFilterAlgo::FftTiling),
                A::BackwardFilter(BackwardFilterAlgo::Fft),
                A::BackwardFilter(BackwardFilterAlgo::Algo1),
                A::BackwardFilter(BackwardFilterAlgo::Algo3),
                A::BackwardFilter(BackwardFilterAlgo::Algo0),
            ],
            ConvOp::BackwardData => &[
                A::BackwardData(BackwardDataAlgo::Winograd),
                A::BackwardData(BackwardDataAlgo::WinogradNonfused),
                A::BackwardData(BackwardDataAlgo::FftTiling),
                A::BackwardData(BackwardDataAlgo::Fft),
                A::BackwardData(BackwardDataAlgo::Algo1),
                A::BackwardData(BackwardDataAlgo::Algo0),
            ],
        }
    }

    fn expect_kind(&self, id: DescriptorId, what: &str, ok: impl Fn(&DescriptorKind) -> bool) -> Result<()> {
        match self.live.get(&id) {
            Some(kind) if ok(kind) => Ok(()),
            Some(kind) => Err(DepthwiseError::Backend(format!(
                "{id} is a {}, expected a {what}",
                kind.name()
            ))),
            None => Err(DepthwiseError::Backend(format!("{id} ({what}) is not live"))),
        }
    }

    fn check_descriptors(
        &self,
        handle: DescriptorId,
        descs: &ConvDescriptors,
        problem: &ConvProblem,
    ) -> Result<()> {
        self.expect_kind(handle, "library handle", |k| matches!(k, DescriptorKind::Handle { .. }))?;
        self.expect_kind(descs.input, "tensor descriptor", |k| *k == DescriptorKind::Tensor)?;
        self.expect_kind(descs.output, "tensor descriptor", |k| *k == DescriptorKind::Tensor)?;
        self.expect_kind(descs.conv, "convolution descriptor", |k| *k == DescriptorKind::Convolution)?;
        let expected = DescriptorKind::Filter {
            out_channels: problem.num_output,
            in_per_group: problem.channels_per_group(),
            kernel_h: problem.kernel_h,
            kernel_w: problem.kernel_w,
        };
        self.expect_kind(descs.filter, "matching filter descriptor", |k| *k == expected)
    }
}

impl ConvBackend for ReferenceBackend {
    fn name(&self) -> &'static str {
        "reference"
    }

    fn create_descriptor(&mut self, kind: DescriptorKind) -> Result<DescriptorId> {
        if let Some(limit) = self.faults.fail_create_after {
            if self.stats.descriptors_created >= limit {
                return Err(DepthwiseError::ResourceCreation {
                    resource: kind.name(),
                    reason: "injected failure".into(),
                });
            }
        }
        if let DescriptorKind::Handle { stream } = kind {
            self.expect_kind(stream, "stream", |k| *k == DescriptorKind::Stream)?;
        }
        let id = DescriptorId(self.next_id);
        self.next_id += 1;
        self.live.insert(id, kind);
        self.stats.descriptors_created += 1;
        debug!(%id, kind = kind.name(), "created descriptor");
        Ok(id)
    }

    fn destroy_descriptor(&mut self, id: DescriptorId) {
        match self.live.remove(&id) {
            Some(kind) => {
                self.stats.descriptors_destroyed += 1;
                debug!(%id, kind = kind.name(), "destroyed descriptor");
            }
            None => {
                self.stats.invalid_destroys += 1;
                warn!(%id, "destroying a descriptor that is not live");
            }
        }
    }

    fn find_algorithm(
        &mut self,
        handle: DescriptorId,
        op: ConvOp,
        descs: &ConvDescriptors,
        problem: &ConvProblem,
        limit_bytes: usize,
    ) -> Result<Option<Algorithm>> {
        self.check_descriptors(handle, descs, problem)?;
        self.stats.algorithm_queries += 1;
        if self.faults.refuse_algorithms.contains(&op) {
            return Ok(None);
        }
        Ok(Self::preference(op)
            .iter()
            .copied()
            .find(|&a| Self::scratch_cost(problem, a).is_some_and(|cost| cost <= limit_bytes)))
    }

    fn workspace_size(
        &mut self,
        handle: DescriptorId,
        descs: &ConvDescriptors,
        problem: &ConvProblem,
        algo: Algorithm,
    ) -> Result<usize> {
        self.check_descriptors(handle, descs, problem)?;
        self.stats.size_queries += 1;
        Self::scratch_cost(problem, algo).ok_or_else(|| {
            DepthwiseError::Backend(format!("{algo:?} does not support this problem"))
        })
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
        self.check_descriptors(handle, descs, problem)?;
        if algo.op() != args.op() {
            return Err(DepthwiseError::Backend(format!(
                "{algo:?} cannot run a {} pass",
                args.op()
            )));
        }
        let needed = Self::scratch_cost(problem, algo).ok_or_else(|| {
            DepthwiseError::Backend(format!("{algo:?} does not support this problem"))
        })?;
        if workspace.len() < needed {
            return Err(DepthwiseError::Backend(format!(
                "{algo:?} needs {needed} bytes of workspace, got {}",
                workspace.len()
            )));
        }

        match args {
            ExecArgs::Forward { input, filter, bias, output } => {
                grouped_forward(problem, input, filter, bias, output)?
            }
            ExecArgs::BackwardFilter { input, output_grad, filter_grad, bias_grad } => {
                grouped_backward_filter(problem, input, output_grad, filter_grad, bias_grad)?
            }
            ExecArgs::BackwardData { filter, output_grad, input_grad } => {
                grouped_backward_data(problem, filter, output_grad, input_grad)?
            }
        }

        self.stats.executions += 1;
        self.executions.push(ExecutionRecord { handle, algorithm: algo, workspace_len: workspace.len() });
        Ok(())
    }
}

impl DeviceAllocator for ReferenceBackend {
    type Buffer = HostBuffer;

    fn allocate(&mut self, bytes: usize) -> std::result::Result<HostBuffer, AllocError> {
        self.stats.allocation_calls += 1;
        let available = self.memory_limit.saturating_sub(self.stats.allocated_bytes);
        if self.faults.failing_allocations > 0 || bytes > available {
            self.faults.failing_allocations = self.faults.failing_allocations.saturating_sub(1);
            self.stats.failed_allocations += 1;
            return Err(AllocError { requested: bytes, available });
        }
        self.stats.allocated_bytes += bytes;
        self.stats.peak_allocated_bytes =
            self.stats.peak_allocated_bytes.max(self.stats.allocated_bytes);
        Ok(HostBuffer(vec![0; bytes]))
    }

    fn release(&mut self, buffer: HostBuffer) {
        self.stats.releases += 1;
        self.stats.allocated_bytes = self.stats.allocated_bytes.saturating_sub(buffer.0.len());
    }
}

// ── Grouped convolution math ────────────────────────────────────────

/// Visit every `(input index, output index, filter index)` triple that
/// contributes to the grouped convolution.
fn for_each_tap(p: &ConvProblem, mut f: impl FnMut(usize, usize, usize)) {
    let cpg = p.channels_per_group();
    let opg = p.outputs_per_group();
    for n in 0..p.batch {
        for o in 0..p.num_output {
            let g = o / opg;
            for oy in 0..p.height_out {
                for ox in 0..p.width_out {
                    let out_idx = ((n * p.num_output + o) * p.height_out + oy) * p.width_out + ox;
                    for cl in 0..cpg {
                        let c = g * cpg + cl;
                        for ky in 0..p.kernel_h {
                            let iy = oy * p.stride_h + ky;
                            if iy < p.pad_h || iy - p.pad_h >= p.height {
                                continue;
                            }
                            let iy = iy - p.pad_h;
                            for kx in 0..p.kernel_w {
                                let ix = ox * p.stride_w + kx;
                                if ix < p.pad_w || ix - p.pad_w >= p.width {
                                    continue;
                                }
                                let ix = ix - p.pad_w;
                                let in_idx = ((n * p.channels + c) * p.height + iy) * p.width + ix;
                                let w_idx = ((o * cpg + cl) * p.kernel_h + ky) * p.kernel_w + kx;
                                f(in_idx, out_idx, w_idx);
                            }
                        }
                    }
                }
            }
        }
    }
}

fn check_bias(p: &ConvProblem, bias: Option<&[f32]>) -> Result<()> {
    match bias {
        Some(b) => check_len("bias", p.num_output, b.len()),
        None => Ok(()),
    }
}

fn grouped_forward(
    p: &ConvProblem,
    input: &[f32],
    filter: &[f32],
    bias: Option<&[f32]>,
    output: &mut [f32],
) -> Result<()> {
    check_len("input", p.input_len(), input.len())?;
    check_len("filter", p.filter_len(), filter.len())?;
    check_len("output", p.output_len(), output.len())?;
    check_bias(p, bias)?;

    output.fill(0.0);
    for_each_tap(p, |i, o, w| output[o] += input[i] * filter[w]);

    if let Some(b) = bias {
        let plane = p.height_out * p.width_out;
        for (idx, chunk) in output.chunks_mut(plane).enumerate() {
            let bias_val = b[idx % p.num_output];
            for v in chunk {
                *v += bias_val;
            }
        }
    }
    Ok(())
}

fn grouped_backward_filter(
    p: &ConvProblem,
    input: &[f32],
    output_grad: &[f32],
    filter_grad: &mut [f32],
    bias_grad: Option<&mut [f32]>,
) -> Result<()> {
    check_len("input", p.input_len(), input.len())?;
    check_len("output gradient", p.output_len(), output_grad.len())?;
    check_len("filter gradient", p.filter_len(), filter_grad.len())?;
    if let Some(bg) = bias_grad.as_deref() {
        check_len("bias gradient", p.num_output, bg.len())?;
    }

    for_each_tap(p, |i, o, w| filter_grad[w] += output_grad[o] * input[i]);

    if let Some(bg) = bias_grad {
        let plane = p.height_out * p.width_out;
        for (idx, chunk) in output_grad.chunks(plane).enumerate() {
            bg[idx % p.num_output] += chunk.iter().sum::<f32>();
        }
    }
    Ok(())
}

fn grouped_backward_data(
    p: &ConvProblem,
    filter: &[f32],
    output_grad: &[f32],
    input_grad: &mut [f32],
) -> Result<()> {
    check_len("filter", p.filter_len(), filter.len())?;
    check_len("output gradient", p.output_len(), output_grad.len())?;
    check_len("input gradient", p.input_len(), input_grad.len())?;

    input_grad.fill(0.0);
    for_each_tap(p, |i, o, w| input_grad[i] += output_grad[o] * filter[w]);
    Ok(())
}
