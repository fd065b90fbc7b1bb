//! Per-shape algorithm selection.
//!
//! For every input the resolver asks the library for its best forward,
//! backward-filter and backward-data algorithm under a fixed scratch ceiling,
//! then for each algorithm's exact scratch requirement. The ceiling is a
//! static budget; there is no memory-pressure feedback.

use crate::backend::{Algorithm, ConvBackend, ConvDescriptors, ConvOp, DescriptorId};
use dwconv_common::{ConvProblem, DepthwiseError, Result};
use tracing::debug;

/// Algorithm and scratch requirement for one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpPlan {
    pub algorithm: Algorithm,
    pub workspace_bytes: usize,
}

impl OpPlan {
    pub fn zero_scratch(op: ConvOp) -> Self {
        Self { algorithm: Algorithm::zero_scratch(op), workspace_bytes: 0 }
    }
}

/// The three pass plans for one input shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub problem: ConvProblem,
    pub forward: OpPlan,
    pub backward_filter: OpPlan,
    pub backward_data: OpPlan,
}

impl ExecutionPlan {
    /// Plan that runs every pass on its zero-scratch baseline.
    pub fn zero_scratch(problem: ConvProblem) -> Self {
        Self {
            problem,
            forward: OpPlan::zero_scratch(ConvOp::Forward),
            backward_filter: OpPlan::zero_scratch(ConvOp::BackwardFilter),
            backward_data: OpPlan::zero_scratch(ConvOp::BackwardData),
        }
    }

    pub fn get(&self, op: ConvOp) -> &OpPlan {
        match op {
            ConvOp::Forward => &self.forward,
            ConvOp::BackwardFilter => &self.backward_filter,
            ConvOp::BackwardData => &self.backward_data,
        }
    }

    /// Largest scratch requirement among the three passes.
    pub fn max_workspace_bytes(&self) -> usize {
        self.forward
            .workspace_bytes
            .max(self.backward_filter.workspace_bytes)
            .max(self.backward_data.workspace_bytes)
    }

    /// Force every pass onto its zero-scratch baseline.
    pub fn degrade(&mut self) {
        self.forward = OpPlan::zero_scratch(ConvOp::Forward);
        self.backward_filter = OpPlan::zero_scratch(ConvOp::BackwardFilter);
        self.backward_data = OpPlan::zero_scratch(ConvOp::BackwardData);
    }

    pub fn is_zero_scratch(&self) -> bool {
        ConvOp::ALL.iter().all(|&op| {
            let p = self.get(op);
            p.algorithm.is_zero_scratch() && p.workspace_bytes == 0
        })
    }
}

/// Scratch bytes each stream needs to run any pass of any plan.
pub fn required_bytes_per_stream(plans: &[ExecutionPlan]) -> usize {
    plans.iter().map(ExecutionPlan::max_workspace_bytes).max().unwrap_or(0)
}

/// Queries the library for execution plans under a fixed ceiling.
#[derive(Debug, Clone, Copy)]
pub struct PlanResolver {
    workspace_limit_bytes: usize,
}

impl PlanResolver {
    pub fn new(workspace_limit_bytes: usize) -> Self {
        Self { workspace_limit_bytes }
    }

    pub fn workspace_limit_bytes(&self) -> usize {
        self.workspace_limit_bytes
    }

    /// Resolve the plan for one input.
    ///
    /// Finding no algorithm under the ceiling is fatal: the ceiling is
    /// incompatible with the shape and retrying would not change that.
    pub fn resolve<B: ConvBackend + ?Sized>(
        &self,
        backend: &mut B,
        handle: DescriptorId,
        descs: &ConvDescriptors,
        problem: &ConvProblem,
    ) -> Result<ExecutionPlan> {
        let forward = self.resolve_op(backend, handle, ConvOp::Forward, descs, problem)?;
        let backward_filter =
            self.resolve_op(backend, handle, ConvOp::BackwardFilter, descs, problem)?;
        let backward_data = self.resolve_op(backend, handle, ConvOp::BackwardData, descs, problem)?;
        Ok(ExecutionPlan { problem: *problem, forward, backward_filter, backward_data })
    }

    fn resolve_op<B: ConvBackend + ?Sized>(
        &self,
        backend: &mut B,
        handle: DescriptorId,
        op: ConvOp,
        descs: &ConvDescriptors,
        problem: &ConvProblem,
    ) -> Result<OpPlan> {
        let algorithm = backend
            .find_algorithm(handle, op, descs, problem, self.workspace_limit_bytes)?
            .ok_or(DepthwiseError::NoAlgorithm {
                op: op.name(),
                limit_bytes: self.workspace_limit_bytes,
            })?;
        if algorithm.op() != op {
            return Err(DepthwiseError::Backend(format!(
                "{} returned {algorithm:?} for a {op} query",
                backend.name()
            )));
        }
        let workspace_bytes = backend.workspace_size(handle, descs, problem, algorithm)?;
        debug!(%op, ?algorithm, workspace_bytes, "selected algorithm");
        Ok(OpPlan { algorithm, workspace_bytes })
    }
}
