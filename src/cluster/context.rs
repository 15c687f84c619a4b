//! Fit context: the preprocessing state captured at training time and replayed
//! when new rows are labelled.

use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use super::ClusterError;
use crate::table::FeatureTable;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitContext {
    pub columns: Vec<String>,
    /// Per-column mean of the finite training values, used to impute missing cells.
    pub means: Vec<f64>,
    pub seed: u64,
}

impl FitContext {
    /// Captures column order and imputation values from a training partition.
    pub fn setup(features: &FeatureTable, seed: u64) -> Result<Self, ClusterError> {
        if features.n_samples() == 0 {
            return Err(ClusterError::EmptyFeatures);
        }
        let means = features
            .values()
            .axis_iter(Axis(1))
            .map(|column| {
                let finite: Vec<f64> = column.iter().copied().filter(|v| v.is_finite()).collect();
                if finite.is_empty() {
                    0.0
                } else {
                    finite.iter().sum::<f64>() / finite.len() as f64
                }
            })
            .collect();

        Ok(Self {
            columns: features.columns().to_vec(),
            means,
            seed,
        })
    }

    /// Applies the captured preprocessing. Tables whose columns differ from the
    /// training columns are rejected.
    pub fn prepare(&self, features: &FeatureTable) -> Result<Array2<f64>, ClusterError> {
        if features.columns() != self.columns.as_slice() {
            return Err(ClusterError::SchemaMismatch {
                expected: self.columns.clone(),
                found: features.columns().to_vec(),
            });
        }

        let mut prepared = features.values().clone();
        for mut row in prepared.rows_mut() {
            for (value, mean) in row.iter_mut().zip(&self.means) {
                if value.is_nan() {
                    *value = *mean;
                }
            }
        }
        Ok(prepared)
    }
}

/// Serialized [`FitContext`] addressed by the xxh3 hash of its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextBlob {
    key: String,
    bytes: Vec<u8>,
}

impl ContextBlob {
    pub fn encode(context: &FitContext) -> Result<Self, ClusterError> {
        let bytes = serde_json::to_vec(context)?;
        Ok(Self {
            key: content_key(&bytes),
            bytes,
        })
    }

    /// Rebuilds a blob read back from storage. The key is checked on [`ContextBlob::restore`].
    #[must_use]
    pub fn from_parts(key: String, bytes: Vec<u8>) -> Self {
        Self { key, bytes }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn restore(&self) -> Result<FitContext, ClusterError> {
        let actual = content_key(&self.bytes);
        if actual != self.key {
            return Err(ClusterError::ContextIntegrity {
                expected: self.key.clone(),
                actual,
            });
        }
        Ok(serde_json::from_slice(&self.bytes)?)
    }
}

fn content_key(bytes: &[u8]) -> String {
    format!("{:016x}", xxh3_64(bytes))
}
