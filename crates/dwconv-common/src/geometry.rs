//! Convolution geometry consumed from the owning network.
//!
//! Input blobs are NCHW and contiguous. [`ConvProblem`] is the fully
//! resolved description of one grouped convolution: it is what the
//! accelerator is asked to plan and execute.

use crate::config::DepthwiseConfig;
use crate::error::{DepthwiseError, Result};
use serde::{Deserialize, Serialize};

/// Shape of one input blob, `[num, channels, height, width]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputShape {
    pub num: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl InputShape {
    pub fn new(num: usize, channels: usize, height: usize, width: usize) -> Self {
        Self { num, channels, height, width }
    }

    /// Element count of the blob.
    pub fn count(&self) -> usize {
        self.num * self.channels * self.height * self.width
    }
}

/// Output extent along one spatial axis.
///
/// Returns 0 when the kernel does not fit in the padded input.
pub fn output_dim(input: usize, kernel: usize, pad: usize, stride: usize) -> usize {
    let padded = input + 2 * pad;
    if padded < kernel { 0 } else { (padded - kernel) / stride + 1 }
}

/// One grouped convolution: input, filter and output geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConvProblem {
    pub batch: usize,
    pub channels: usize,
    pub num_output: usize,
    pub groups: usize,
    pub height: usize,
    pub width: usize,
    pub height_out: usize,
    pub width_out: usize,
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub pad_h: usize,
    pub pad_w: usize,
    pub stride_h: usize,
    pub stride_w: usize,
}

impl ConvProblem {
    /// Resolve the problem for `shape` under `config`.
    ///
    /// The configuration must already be validated.
    pub fn new(config: &DepthwiseConfig, shape: &InputShape) -> Result<Self> {
        if shape.channels != config.channels {
            return Err(DepthwiseError::InvalidShape(format!(
                "input has {} channels, layer expects {}",
                shape.channels, config.channels
            )));
        }
        if shape.num == 0 || shape.height == 0 || shape.width == 0 {
            return Err(DepthwiseError::InvalidShape(format!("empty input shape {shape:?}")));
        }
        let height_out =
            output_dim(shape.height, config.kernel_height, config.pad_height, config.stride_height);
        let width_out =
            output_dim(shape.width, config.kernel_width, config.pad_width, config.stride_width);
        if height_out == 0 || width_out == 0 {
            return Err(DepthwiseError::InvalidShape(format!(
                "kernel {}x{} does not fit padded input {}x{}",
                config.kernel_height, config.kernel_width, shape.height, shape.width
            )));
        }
        Ok(Self {
            batch: shape.num,
            channels: config.channels,
            num_output: config.num_output,
            groups: config.group_count,
            height: shape.height,
            width: shape.width,
            height_out,
            width_out,
            kernel_h: config.kernel_height,
            kernel_w: config.kernel_width,
            pad_h: config.pad_height,
            pad_w: config.pad_width,
            stride_h: config.stride_height,
            stride_w: config.stride_width,
        })
    }

    #[inline]
    pub fn channels_per_group(&self) -> usize {
        self.channels / self.groups
    }

    #[inline]
    pub fn outputs_per_group(&self) -> usize {
        self.num_output / self.groups
    }

    #[inline]
    pub fn kernel_dim(&self) -> usize {
        self.kernel_h * self.kernel_w
    }

    /// Elements in the input blob.
    pub fn input_len(&self) -> usize {
        self.batch * self.channels * self.height * self.width
    }

    /// Elements in the output blob.
    pub fn output_len(&self) -> usize {
        self.batch * self.num_output * self.height_out * self.width_out
    }

    /// Elements in the grouped filter, `O × C/G × kh × kw`.
    pub fn filter_len(&self) -> usize {
        self.num_output * self.channels_per_group() * self.kernel_dim()
    }
}
