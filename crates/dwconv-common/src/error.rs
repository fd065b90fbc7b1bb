//! Error types for depthwise convolution setup, reshape and execution.

use crate::config::ConfigError;
use thiserror::Error;

/// Errors produced while configuring or driving the accelerated layer.
///
/// Every variant here is fatal for the operation that produced it. Workspace
/// allocation failure is deliberately absent: it is absorbed by the workspace
/// allocator's fallback and never reaches the caller.
#[derive(Debug, Error)]
pub enum DepthwiseError {
    #[error("input channels ({channels}) must be divisible by group count ({groups})")]
    ChannelsNotDivisible { channels: usize, groups: usize },

    #[error("only 2 spatial axes are supported, got {axes}")]
    UnsupportedSpatialAxes { axes: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid shape: {0}")]
    InvalidShape(String),

    #[error("failed to create {resource}: {reason}")]
    ResourceCreation { resource: &'static str, reason: String },

    #[error("no {op} algorithm fits within a workspace limit of {limit_bytes} bytes")]
    NoAlgorithm { op: &'static str, limit_bytes: usize },

    #[error("accelerator call failed: {0}")]
    Backend(String),

    #[error("buffer length mismatch for {name}: expected {expected}, got {actual}")]
    LengthMismatch { name: &'static str, expected: usize, actual: usize },

    #[error("input index {index} out of range ({count} inputs)")]
    InputOutOfRange { index: usize, count: usize },

    #[error("no execution plan for input {index}; reshape must run first")]
    NotReshaped { index: usize },

    #[error("layer has been torn down")]
    TornDown,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl DepthwiseError {
    /// Whether the error stems from an unsatisfiable configuration rather
    /// than a failed accelerator call.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::ChannelsNotDivisible { .. }
                | Self::UnsupportedSpatialAxes { .. }
                | Self::InvalidConfig(_)
                | Self::InvalidShape(_)
                | Self::NoAlgorithm { .. }
                | Self::Config(_)
        )
    }
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, DepthwiseError>;

/// Check that a buffer has the expected length.
pub fn check_len(name: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(DepthwiseError::LengthMismatch { name, expected, actual })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_len_accepts_exact_length() {
        assert!(check_len("weights", 9, 9).is_ok());
    }

    #[test]
    fn check_len_reports_both_lengths() {
        let err = check_len("mask", 72, 71).unwrap_err();
        assert_eq!(err.to_string(), "buffer length mismatch for mask: expected 72, got 71");
    }

    #[test]
    fn configuration_errors_are_classified() {
        assert!(DepthwiseError::ChannelsNotDivisible { channels: 6, groups: 4 }.is_configuration());
        assert!(DepthwiseError::NoAlgorithm { op: "forward", limit_bytes: 0 }.is_configuration());
        assert!(!DepthwiseError::Backend("stream lost".into()).is_configuration());
        assert!(!DepthwiseError::TornDown.is_configuration());
    }
}
