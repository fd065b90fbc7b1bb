//! The accelerated depthwise layer.
//!
//! [`DepthwiseLayer`] ties the pieces together: it owns the backend, the
//! layer's descriptors, the expanded weights, one execution plan per input
//! and the shared workspace.
//!
//! ```text
//! setup ──▶ reshape ──▶ forward / backward ──▶ … ──▶ teardown
//!             │  ▲
//!             └──┘ on every shape change
//! ```

use crate::backend::{ConvBackend, ConvOp, DeviceAllocator, ExecArgs};
use crate::layout::{self, CompactWeights, ExpandedWeights, LayoutShape};
use crate::params::LayerParams;
use crate::plan::{ExecutionPlan, OpPlan, PlanResolver, required_bytes_per_stream};
use crate::resources::{
    BACKWARD_DATA_STREAM, BACKWARD_FILTER_STREAM, FORWARD_STREAM, LayerResources, LifecycleState,
    STREAM_COUNT,
};
use crate::workspace::{CapacityOutcome, Workspace};
use dwconv_common::{ConvProblem, DepthwiseConfig, DepthwiseError, InputShape, Result, check_len};
use std::ops::Range;
use tracing::{debug, info};

/// Depthwise convolution run on a grouped-convolution primitive.
pub struct DepthwiseLayer<B: ConvBackend + DeviceAllocator> {
    backend: B,
    config: DepthwiseConfig,
    layout: LayoutShape,
    resources: LayerResources,
    resolver: PlanResolver,
    weights: ExpandedWeights,
    bias: Option<CompactWeights>,
    plans: Vec<ExecutionPlan>,
    workspace: Workspace<B>,
}

impl<B: ConvBackend + DeviceAllocator> DepthwiseLayer<B> {
    /// Validate `config`, create every accelerator resource for
    /// `num_inputs` inputs and load `weights`. The bias, if any, starts at
    /// zero.
    pub fn setup(
        mut backend: B,
        config: DepthwiseConfig,
        num_inputs: usize,
        weights: CompactWeights,
    ) -> Result<Self> {
        config.validate()?;
        if num_inputs == 0 {
            return Err(DepthwiseError::InvalidConfig("layer needs at least one input".into()));
        }
        let layout = LayoutShape::from_config(&config);
        let expanded = layout::expand(&layout, &weights)?;
        let resources = LayerResources::setup(&mut backend, &config, num_inputs)?;
        let bias = config.has_bias.then(|| CompactWeights::from_values(vec![0.0; config.num_output]));

        info!(
            channels = config.channels,
            num_output = config.num_output,
            groups = config.group_count,
            workspace_limit = config.workspace_limit_bytes,
            "depthwise layer set up"
        );
        Ok(Self {
            backend,
            resolver: PlanResolver::new(config.workspace_limit_bytes),
            config,
            layout,
            resources,
            weights: expanded,
            bias,
            plans: Vec::new(),
            workspace: Workspace::new(STREAM_COUNT),
        })
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.resources.state() {
            LifecycleState::Ready => Ok(()),
            _ => Err(DepthwiseError::TornDown),
        }
    }

    /// Resolve plans for the given input shapes and size the workspace.
    ///
    /// Unchanged shapes skip resolution, unless the last reshape fell back
    /// to zero scratch, in which case the plans are resolved again so the
    /// layer can recover. On error the previous plans and workspace are
    /// kept.
    pub fn reshape(&mut self, shapes: &[InputShape]) -> Result<CapacityOutcome> {
        self.ensure_ready()?;
        check_len("input shapes", self.resources.num_inputs(), shapes.len())?;

        let problems = shapes
            .iter()
            .map(|s| ConvProblem::new(&self.config, s))
            .collect::<Result<Vec<_>>>()?;

        let unchanged = self.plans.len() == problems.len()
            && self.plans.iter().zip(&problems).all(|(p, q)| p.problem == *q);
        if unchanged && !self.workspace.is_degraded() {
            debug!("shapes unchanged; keeping execution plans");
            return Ok(CapacityOutcome::Unchanged);
        }

        let handle = self.resources.handle(FORWARD_STREAM).ok_or(DepthwiseError::TornDown)?;
        let mut plans = Vec::with_capacity(problems.len());
        for (index, problem) in problems.iter().enumerate() {
            let descs = self
                .resources
                .conv_descriptors(index)
                .ok_or(DepthwiseError::InputOutOfRange { index, count: self.resources.num_inputs() })?;
            plans.push(self.resolver.resolve(&mut self.backend, handle, &descs, problem)?);
        }

        let required = required_bytes_per_stream(&plans);
        let outcome = self.workspace.ensure_capacity(&mut self.backend, required, &mut plans);
        self.plans = plans;
        debug!(required, capacity = self.workspace.capacity(), ?outcome, "reshaped");
        Ok(outcome)
    }

    fn check_executable(&self, index: usize) -> Result<()> {
        self.ensure_ready()?;
        let count = self.resources.num_inputs();
        if index >= count {
            return Err(DepthwiseError::InputOutOfRange { index, count });
        }
        if index >= self.plans.len() {
            return Err(DepthwiseError::NotReshaped { index });
        }
        Ok(())
    }

    /// Forward pass for input `index` on the forward stream.
    pub fn forward(&mut self, index: usize, input: &[f32], output: &mut [f32]) -> Result<()> {
        self.check_executable(index)?;
        let descs = self
            .resources
            .conv_descriptors(index)
            .ok_or(DepthwiseError::InputOutOfRange { index, count: self.resources.num_inputs() })?;
        let handle = self.resources.handle(FORWARD_STREAM).ok_or(DepthwiseError::TornDown)?;
        let plan = &self.plans[index];
        let args = ExecArgs::Forward {
            input,
            filter: &self.weights.values,
            bias: self.bias.as_ref().map(|b| b.values.as_slice()),
            output,
        };
        self.backend.execute(
            handle,
            &descs,
            &plan.problem,
            plan.forward.algorithm,
            args,
            self.workspace.stream_slice(FORWARD_STREAM),
        )
    }

    /// Backward pass for input `index`.
    ///
    /// Weight and bias gradients accumulate into the layer's gradient stores
    /// on the weight-gradient stream. When `input_grad` is given it is
    /// overwritten with the gradient w.r.t. the input on the input-gradient
    /// stream.
    pub fn backward(
        &mut self,
        index: usize,
        input: &[f32],
        output_grad: &[f32],
        input_grad: Option<&mut [f32]>,
    ) -> Result<()> {
        self.check_executable(index)?;
        let descs = self
            .resources
            .conv_descriptors(index)
            .ok_or(DepthwiseError::InputOutOfRange { index, count: self.resources.num_inputs() })?;
        let plan = &self.plans[index];

        let handle = self.resources.handle(BACKWARD_FILTER_STREAM).ok_or(DepthwiseError::TornDown)?;
        let args = ExecArgs::BackwardFilter {
            input,
            output_grad,
            filter_grad: &mut self.weights.gradients,
            bias_grad: self.bias.as_mut().map(|b| b.gradients.as_mut_slice()),
        };
        self.backend.execute(
            handle,
            &descs,
            &plan.problem,
            plan.backward_filter.algorithm,
            args,
            self.workspace.stream_slice(BACKWARD_FILTER_STREAM),
        )?;

        if let Some(input_grad) = input_grad {
            let handle = self.resources.handle(BACKWARD_DATA_STREAM).ok_or(DepthwiseError::TornDown)?;
            let args = ExecArgs::BackwardData { filter: &self.weights.values, output_grad, input_grad };
            self.backend.execute(
                handle,
                &descs,
                &plan.problem,
                plan.backward_data.algorithm,
                args,
                self.workspace.stream_slice(BACKWARD_DATA_STREAM),
            )?;
        }
        Ok(())
    }

    /// Zero the weight and bias gradients.
    pub fn zero_gradients(&mut self) {
        self.weights.gradients.fill(0.0);
        if let Some(bias) = self.bias.as_mut() {
            bias.gradients.fill(0.0);
        }
    }

    /// Snapshot the parameters in compact form.
    pub fn export_params(&self, write_gradients: bool) -> Result<LayerParams> {
        self.ensure_ready()?;
        let compact = layout::collapse(&self.layout, &self.weights)?;
        Ok(LayerParams::export(&self.layout, &compact, self.bias.as_ref(), write_gradients))
    }

    /// Replace the parameters from a compact snapshot.
    pub fn import_params(&mut self, params: LayerParams) -> Result<()> {
        self.ensure_ready()?;
        params.validate(&self.layout, self.config.has_bias)?;
        let (weights, bias) = params.into_stores();
        self.weights = layout::expand(&self.layout, &weights)?;
        self.bias = bias;
        Ok(())
    }

    /// Release the workspace and every descriptor. Safe to call repeatedly.
    pub fn teardown(&mut self) {
        if !self.resources.is_ready() {
            return;
        }
        self.workspace.release(&mut self.backend);
        self.resources.teardown(&mut self.backend);
        self.plans.clear();
    }

    pub fn state(&self) -> LifecycleState {
        self.resources.state()
    }

    pub fn resources(&self) -> &LayerResources {
        &self.resources
    }

    pub fn config(&self) -> &DepthwiseConfig {
        &self.config
    }

    pub fn layout(&self) -> &LayoutShape {
        &self.layout
    }

    /// Weights in the grouped layout.
    pub fn expanded(&self) -> &ExpandedWeights {
        &self.weights
    }

    /// Validity mask over the expanded weights: 1.0 on real depthwise
    /// connections. Exposed for callers that do their own math; the layer
    /// does not apply it.
    pub fn mask(&self) -> &[f32] {
        &self.weights.mask
    }

    pub fn bias(&self) -> Option<&CompactWeights> {
        self.bias.as_ref()
    }

    pub fn plans(&self) -> &[ExecutionPlan] {
        &self.plans
    }

    /// Algorithm and scratch size chosen for `op` on input `index`.
    pub fn plan_for(&self, index: usize, op: ConvOp) -> Option<OpPlan> {
        self.plans.get(index).map(|p| *p.get(op))
    }

    pub fn workspace_capacity(&self) -> usize {
        self.workspace.capacity()
    }

    pub fn workspace_slices(&self) -> &[Range<usize>] {
        self.workspace.slices()
    }

    pub fn is_degraded(&self) -> bool {
        self.workspace.is_degraded()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }
}

impl<B: ConvBackend + DeviceAllocator> Drop for DepthwiseLayer<B> {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl<B: ConvBackend + DeviceAllocator> std::fmt::Debug for DepthwiseLayer<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DepthwiseLayer")
            .field("backend", &self.backend.name())
            .field("state", &self.resources.state())
            .field("layout", &self.layout)
            .field("plans", &self.plans.len())
            .field("workspace_capacity", &self.workspace.capacity())
            .finish()
    }
}
