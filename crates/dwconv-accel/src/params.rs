//! Serializable parameter snapshots.
//!
//! Parameters leave and enter the layer in compact form only: one
//! `[num_output, 1, kernel_h, kernel_w]` weight blob and, with a bias term,
//! one `[num_output]` bias blob. The grouped layout never appears here.

use crate::layout::{CompactWeights, LayoutShape};
use dwconv_common::{DepthwiseError, Result, check_len};
use serde::{Deserialize, Serialize};

/// One parameter blob: values and, optionally, gradients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamBlob {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<Vec<f32>>,
}

impl ParamBlob {
    fn from_store(shape: Vec<usize>, store: &CompactWeights, write_diff: bool) -> Self {
        Self {
            shape,
            data: store.values.clone(),
            diff: write_diff.then(|| store.gradients.clone()),
        }
    }

    /// Element count implied by `shape`.
    pub fn count(&self) -> usize {
        self.shape.iter().product()
    }

    fn check(&self, name: &'static str, expected_shape: &[usize]) -> Result<()> {
        if self.shape != expected_shape {
            return Err(DepthwiseError::InvalidShape(format!(
                "{name} blob has shape {:?}, expected {expected_shape:?}",
                self.shape
            )));
        }
        check_len(name, self.count(), self.data.len())?;
        if let Some(diff) = &self.diff {
            check_len(name, self.count(), diff.len())?;
        }
        Ok(())
    }

    fn into_store(self) -> CompactWeights {
        match self.diff {
            Some(gradients) => CompactWeights { values: self.data, gradients },
            None => CompactWeights::from_values(self.data),
        }
    }
}

/// Every parameter of one layer, in compact form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerParams {
    pub weights: ParamBlob,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bias: Option<ParamBlob>,
}

impl LayerParams {
    /// Snapshot compact stores; gradients are included only on request.
    pub fn export(
        layout: &LayoutShape,
        weights: &CompactWeights,
        bias: Option<&CompactWeights>,
        write_gradients: bool,
    ) -> Self {
        Self {
            weights: ParamBlob::from_store(layout.compact_dims().to_vec(), weights, write_gradients),
            bias: bias.map(|b| ParamBlob::from_store(vec![layout.num_output], b, write_gradients)),
        }
    }

    /// Check the snapshot fits a layer with this layout and bias setting.
    pub fn validate(&self, layout: &LayoutShape, has_bias: bool) -> Result<()> {
        self.weights.check("weights", &layout.compact_dims())?;
        match (&self.bias, has_bias) {
            (Some(b), true) => b.check("bias", &[layout.num_output]),
            (None, false) => Ok(()),
            (None, true) => Err(DepthwiseError::InvalidShape("layer has a bias term but no bias blob was given".into())),
            (Some(_), false) => {
                Err(DepthwiseError::InvalidShape("bias blob given for a layer without a bias term".into()))
            }
        }
    }

    /// Split into compact stores; missing gradients become zeros.
    pub fn into_stores(self) -> (CompactWeights, Option<CompactWeights>) {
        (self.weights.into_store(), self.bias.map(ParamBlob::into_store))
    }
}
