//! Transcoding between compact depthwise weights and the grouped layout.
//!
//! The compact store holds one `kernel_h × kernel_w` filter per output
//! channel. The grouped primitive expects `O × (C/G) × kernel_h × kernel_w`,
//! i.e. a full per-group filter for every output channel. Only one of the
//! `C/G` slots per output channel is a real connection; the rest are zero and
//! the validity mask marks which is which.
//!
//! # Index mapping
//!
//! For output channel `i` and flattened kernel position `k`:
//!
//! * `j = (i / M) % (C/G)`
//! * expanded index `= (i * (C/G) + j) * kernel_dim + k`
//! * compact index `= i * kernel_dim + k`

use dwconv_common::{DepthwiseConfig, DepthwiseError, Result, check_len};
use serde::{Deserialize, Serialize};

// ── Shape ───────────────────────────────────────────────────────────

/// The shape parameters the mapping depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayoutShape {
    pub channels: usize,
    pub num_output: usize,
    pub multiplier: usize,
    pub groups: usize,
    pub kernel_h: usize,
    pub kernel_w: usize,
}

impl LayoutShape {
    pub fn from_config(config: &DepthwiseConfig) -> Self {
        Self {
            channels: config.channels,
            num_output: config.num_output,
            multiplier: config.channel_multiplier,
            groups: config.group_count,
            kernel_h: config.kernel_height,
            kernel_w: config.kernel_width,
        }
    }

    /// Reject shapes the index mapping cannot handle: zero groups or
    /// multiplier, or more groups than channels.
    pub fn validate(&self) -> Result<()> {
        if self.groups == 0 || self.multiplier == 0 {
            return Err(DepthwiseError::InvalidConfig(format!(
                "groups ({}) and multiplier ({}) must be > 0",
                self.groups, self.multiplier
            )));
        }
        if self.channels_per_group() == 0 {
            return Err(DepthwiseError::InvalidConfig(format!(
                "{} groups leave no channels out of {}",
                self.groups, self.channels
            )));
        }
        Ok(())
    }

    #[inline]
    pub fn channels_per_group(&self) -> usize {
        self.channels / self.groups
    }

    #[inline]
    pub fn kernel_dim(&self) -> usize {
        self.kernel_h * self.kernel_w
    }

    /// Elements in the compact store.
    pub fn compact_len(&self) -> usize {
        self.num_output * self.kernel_dim()
    }

    /// Elements in the expanded store and the mask.
    pub fn expanded_len(&self) -> usize {
        self.num_output * self.channels_per_group() * self.kernel_dim()
    }

    /// Compact blob shape `[O, 1, kh, kw]`.
    pub fn compact_dims(&self) -> [usize; 4] {
        [self.num_output, 1, self.kernel_h, self.kernel_w]
    }

    /// Expanded blob shape `[O, C/G, kh, kw]`.
    pub fn expanded_dims(&self) -> [usize; 4] {
        [self.num_output, self.channels_per_group(), self.kernel_h, self.kernel_w]
    }

    /// Slot within the group that output channel `i` really reads from.
    #[inline]
    pub fn group_offset(&self, i: usize) -> usize {
        (i / self.multiplier) % self.channels_per_group()
    }

    /// Start of output channel `i`'s real filter in the expanded store.
    #[inline]
    pub fn expanded_base(&self, i: usize) -> usize {
        (i * self.channels_per_group() + self.group_offset(i)) * self.kernel_dim()
    }

    #[inline]
    pub fn compact_base(&self, i: usize) -> usize {
        i * self.kernel_dim()
    }
}

// ── Stores ──────────────────────────────────────────────────────────

/// Compact weights: one filter per output channel, values and gradients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactWeights {
    pub values: Vec<f32>,
    pub gradients: Vec<f32>,
}

impl CompactWeights {
    pub fn zeros(shape: &LayoutShape) -> Self {
        let n = shape.compact_len();
        Self { values: vec![0.0; n], gradients: vec![0.0; n] }
    }

    /// Values with zeroed gradients.
    pub fn from_values(values: Vec<f32>) -> Self {
        let gradients = vec![0.0; values.len()];
        Self { values, gradients }
    }
}

/// Weights in the grouped layout plus the validity mask.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpandedWeights {
    pub values: Vec<f32>,
    pub gradients: Vec<f32>,
    pub mask: Vec<f32>,
}

impl ExpandedWeights {
    pub fn zeros(shape: &LayoutShape) -> Self {
        let n = shape.expanded_len();
        Self { values: vec![0.0; n], gradients: vec![0.0; n], mask: vec![0.0; n] }
    }
}

// ── Transcoding ─────────────────────────────────────────────────────

/// Scatter compact values/gradients into the grouped layout and build the
/// mask. Every expanded slot not owned by an output channel ends up zero.
pub fn expand_into(
    shape: &LayoutShape,
    compact_values: &[f32],
    compact_gradients: &[f32],
    values: &mut [f32],
    gradients: &mut [f32],
    mask: &mut [f32],
) -> Result<()> {
    shape.validate()?;
    check_len("compact values", shape.compact_len(), compact_values.len())?;
    check_len("compact gradients", shape.compact_len(), compact_gradients.len())?;
    check_len("expanded values", shape.expanded_len(), values.len())?;
    check_len("expanded gradients", shape.expanded_len(), gradients.len())?;
    check_len("mask", shape.expanded_len(), mask.len())?;

    values.fill(0.0);
    gradients.fill(0.0);
    mask.fill(0.0);

    let kd = shape.kernel_dim();
    for i in 0..shape.num_output {
        let src = shape.compact_base(i);
        let dst = shape.expanded_base(i);
        values[dst..dst + kd].copy_from_slice(&compact_values[src..src + kd]);
        gradients[dst..dst + kd].copy_from_slice(&compact_gradients[src..src + kd]);
        mask[dst..dst + kd].fill(1.0);
    }
    Ok(())
}

/// Gather the owned slots of the grouped layout back into compact form.
pub fn collapse_into(
    shape: &LayoutShape,
    values: &[f32],
    gradients: &[f32],
    compact_values: &mut [f32],
    compact_gradients: &mut [f32],
) -> Result<()> {
    shape.validate()?;
    check_len("expanded values", shape.expanded_len(), values.len())?;
    check_len("expanded gradients", shape.expanded_len(), gradients.len())?;
    check_len("compact values", shape.compact_len(), compact_values.len())?;
    check_len("compact gradients", shape.compact_len(), compact_gradients.len())?;

    let kd = shape.kernel_dim();
    for i in 0..shape.num_output {
        let src = shape.expanded_base(i);
        let dst = shape.compact_base(i);
        compact_values[dst..dst + kd].copy_from_slice(&values[src..src + kd]);
        compact_gradients[dst..dst + kd].copy_from_slice(&gradients[src..src + kd]);
    }
    Ok(())
}

/// Allocating form of [`expand_into`].
pub fn expand(shape: &LayoutShape, compact: &CompactWeights) -> Result<ExpandedWeights> {
    shape.validate()?;
    let mut out = ExpandedWeights::zeros(shape);
    expand_into(
        shape,
        &compact.values,
        &compact.gradients,
        &mut out.values,
        &mut out.gradients,
        &mut out.mask,
    )?;
    Ok(out)
}

/// Allocating form of [`collapse_into`].
pub fn collapse(shape: &LayoutShape, expanded: &ExpandedWeights) -> Result<CompactWeights> {
    let mut out = CompactWeights::zeros(shape);
    collapse_into(
        shape,
        &expanded.values,
        &expanded.gradients,
        &mut out.values,
        &mut out.gradients,
    )?;
    Ok(out)
}
