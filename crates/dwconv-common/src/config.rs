//! Layer configuration for the accelerated depthwise convolution.
//!
//! Loads [`DepthwiseConfig`] from a TOML file with environment variable
//! overrides via `DWCONV_*` prefixed variables. The configuration is
//! immutable once a layer has been set up from it.

use crate::error::{DepthwiseError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default ceiling passed to every algorithm-selection query (8 MiB).
pub const DEFAULT_WORKSPACE_LIMIT_BYTES: usize = 8 * 1024 * 1024;

/// Number of spatial axes the accelerated path supports.
pub const SUPPORTED_SPATIAL_AXES: usize = 2;

/// Geometry and policy for one depthwise convolution layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DepthwiseConfig {
    /// Input channel count `C`.
    pub channels: usize,

    /// Output channel count `O`.
    pub num_output: usize,

    /// Output channels produced per owning input channel `M`.
    /// Override: `DWCONV_CHANNEL_MULTIPLIER`
    pub channel_multiplier: usize,

    /// Number of channel partitions `G` the grouped primitive sees.
    /// Override: `DWCONV_GROUP_COUNT`
    pub group_count: usize,

    pub kernel_height: usize,
    pub kernel_width: usize,
    pub pad_height: usize,
    pub pad_width: usize,
    pub stride_height: usize,
    pub stride_width: usize,

    /// Spatial axes of the input blobs; anything but 2 is rejected.
    pub num_spatial_axes: usize,

    /// Ceiling for every algorithm-selection query.
    /// Override: `DWCONV_WORKSPACE_LIMIT_BYTES`
    pub workspace_limit_bytes: usize,

    /// Whether a bias term (and its descriptor) is created.
    /// Override: `DWCONV_HAS_BIAS`
    pub has_bias: bool,
}

impl Default for DepthwiseConfig {
    fn default() -> Self {
        Self {
            channels: 1,
            num_output: 1,
            channel_multiplier: 1,
            group_count: 1,
            kernel_height: 3,
            kernel_width: 3,
            pad_height: 1,
            pad_width: 1,
            stride_height: 1,
            stride_width: 1,
            num_spatial_axes: SUPPORTED_SPATIAL_AXES,
            workspace_limit_bytes: DEFAULT_WORKSPACE_LIMIT_BYTES,
            has_bias: true,
        }
    }
}

/// Errors that can occur while loading a [`DepthwiseConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid environment override {key}={value}: {reason}")]
    EnvOverride { key: String, value: String, reason: String },
}

impl DepthwiseConfig {
    /// Depthwise layout: `channels * multiplier` outputs, one group per
    /// input channel's filter set, with "same" padding for odd kernels.
    pub fn depthwise(channels: usize, channel_multiplier: usize, kernel: usize) -> Self {
        Self {
            channels,
            num_output: channels * channel_multiplier,
            channel_multiplier,
            kernel_height: kernel,
            kernel_width: kernel,
            pad_height: kernel / 2,
            pad_width: kernel / 2,
            ..Self::default()
        }
    }

    /// Generate a TOML string for this configuration.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self).map_err(ConfigError::from)?)
    }

    /// Load configuration from a TOML file, falling back to defaults for
    /// missing fields, then apply environment variable overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::from)?;
        Self::from_toml(&contents)
    }

    /// Load from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let mut cfg: DepthwiseConfig = toml::from_str(toml_str).map_err(ConfigError::from)?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load only from environment variables, starting from defaults.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply `DWCONV_*` environment overrides on top of the current values.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(v) = env_usize("DWCONV_GROUP_COUNT")? {
            self.group_count = v;
        }
        if let Some(v) = env_usize("DWCONV_CHANNEL_MULTIPLIER")? {
            self.channel_multiplier = v;
        }
        if let Some(v) = env_usize("DWCONV_WORKSPACE_LIMIT_BYTES")? {
            self.workspace_limit_bytes = v;
        }
        if let Ok(raw) = std::env::var("DWCONV_HAS_BIAS") {
            self.has_bias = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(env_error("DWCONV_HAS_BIAS", &raw, "expected a boolean"));
                }
            };
        }
        Ok(())
    }

    /// Validate the configuration.
    ///
    /// Every failure here is a fatal configuration error: it describes a
    /// layer that cannot be built, not a transient condition.
    pub fn validate(&self) -> Result<()> {
        if self.num_spatial_axes != SUPPORTED_SPATIAL_AXES {
            return Err(DepthwiseError::UnsupportedSpatialAxes { axes: self.num_spatial_axes });
        }
        if self.channels == 0 {
            return Err(invalid("channels must be > 0"));
        }
        if self.num_output == 0 {
            return Err(invalid("num_output must be > 0"));
        }
        if self.channel_multiplier == 0 {
            return Err(invalid("channel_multiplier must be > 0"));
        }
        if self.group_count == 0 {
            return Err(invalid("group_count must be > 0"));
        }
        if !self.channels.is_multiple_of(self.group_count) {
            return Err(DepthwiseError::ChannelsNotDivisible {
                channels: self.channels,
                groups: self.group_count,
            });
        }
        if !self.num_output.is_multiple_of(self.group_count) {
            return Err(invalid(&format!(
                "num_output ({}) must be divisible by group_count ({})",
                self.num_output, self.group_count
            )));
        }
        if self.num_output != self.channels * self.channel_multiplier {
            return Err(invalid(&format!(
                "num_output ({}) must equal channels ({}) x channel_multiplier ({})",
                self.num_output, self.channels, self.channel_multiplier
            )));
        }
        if self.kernel_height == 0 || self.kernel_width == 0 {
            return Err(invalid("kernel dimensions must be > 0"));
        }
        if self.stride_height == 0 || self.stride_width == 0 {
            return Err(invalid("strides must be > 0"));
        }
        Ok(())
    }

    /// Input channels seen by each group of the grouped primitive (`C/G`).
    #[inline]
    pub fn channels_per_group(&self) -> usize {
        self.channels / self.group_count
    }

    /// Flattened spatial filter size (`kernel_h * kernel_w`).
    #[inline]
    pub fn kernel_dim(&self) -> usize {
        self.kernel_height * self.kernel_width
    }
}

fn invalid(reason: &str) -> DepthwiseError {
    DepthwiseError::InvalidConfig(reason.to_string())
}

fn env_error(key: &str, value: &str, reason: &str) -> DepthwiseError {
    ConfigError::EnvOverride {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

fn env_usize(key: &str) -> Result<Option<usize>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|e| env_error(key, &raw, &e.to_string())),
        Err(_) => Ok(None),
    }
}
