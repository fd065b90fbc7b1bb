//! Depthwise 2D convolution on a grouped-convolution accelerator primitive
//!
//! Depthwise weights are stored compactly, one filter per output channel.
//! For the accelerated path they are expanded into the full grouped layout
//! the library expects, and collapsed back before anything leaves the layer.
//! Each input shape gets an execution plan chosen under a scratch ceiling,
//! and a single workspace shared by three streams backs every plan.

pub mod backend;
pub mod layer;
pub mod layout;
pub mod params;
pub mod plan;
pub mod reference;
pub mod resources;
pub mod workspace;

pub use backend::{
    AllocError, Algorithm, BackwardDataAlgo, BackwardFilterAlgo, ConvBackend, ConvDescriptors,
    ConvOp, DescriptorId, DescriptorKind, DeviceAllocator, ExecArgs, ForwardAlgo,
};
pub use layer::DepthwiseLayer;
pub use layout::{CompactWeights, ExpandedWeights, LayoutShape, collapse, expand};
pub use params::{LayerParams, ParamBlob};
pub use plan::{ExecutionPlan, OpPlan, PlanResolver, required_bytes_per_stream};
pub use reference::{BackendStats, Faults, ReferenceBackend};
pub use resources::{LayerResources, LifecycleState, STREAM_COUNT};
pub use workspace::{CapacityOutcome, Workspace};

pub use dwconv_common::{ConvProblem, DepthwiseConfig, DepthwiseError, InputShape, Result};
