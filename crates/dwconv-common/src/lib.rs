//! Common types for accelerated depthwise convolution
//!
//! This crate provides the configuration, error taxonomy and convolution
//! geometry shared by the dwconv crates.

pub mod config;
pub mod error;
pub mod geometry;

pub use config::{
    ConfigError, DEFAULT_WORKSPACE_LIMIT_BYTES, DepthwiseConfig, SUPPORTED_SPATIAL_AXES,
};
pub use error::{DepthwiseError, Result, check_len};
pub use geometry::{ConvProblem, InputShape, output_dim};
