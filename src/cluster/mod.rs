//! Clustering backend: fit context, k-means experiment and quality metrics.
//!
//! The pipeline stages only talk to [`ClusterExperiment`]; the k-means
//! implementation in [`kmeans`] is the production backend and tests plug in
//! scripted experiments through the same trait.

pub mod context;
pub mod kmeans;
pub mod quality;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::table::{FeatureTable, TableError};

pub use context::{ContextBlob, FitContext};
pub use kmeans::{KMeansExperiment, KMeansSettings};

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("cannot fit {k} clusters on {samples} samples")]
    InvalidClusterCount { k: usize, samples: usize },
    #[error("feature table has no rows")]
    EmptyFeatures,
    #[error("feature schema mismatch: fitted on {expected:?}, got {found:?}")]
    SchemaMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error("model fit failed: {0}")]
    FitFailure(String),
    #[error("quality metric extraction failed: {0}")]
    MetricExtraction(String),
    #[error("context blob {expected} does not match its content hash {actual}")]
    ContextIntegrity { expected: String, actual: String },
    #[error("context blob could not be encoded or decoded")]
    ContextCodec(#[from] serde_json::Error),
    #[error(transparent)]
    Table(#[from] TableError),
}

/// Cluster quality metric understood by the selector and the reporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricName {
    Silhouette,
    CalinskiHarabasz,
    DaviesBouldin,
}

impl MetricName {
    pub const ALL: [MetricName; 3] = [
        MetricName::Silhouette,
        MetricName::CalinskiHarabasz,
        MetricName::DaviesBouldin,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MetricName::Silhouette => "silhouette",
            MetricName::CalinskiHarabasz => "calinski_harabasz",
            MetricName::DaviesBouldin => "davies_bouldin",
        }
    }

    /// Davies-Bouldin is the only metric where lower is better.
    #[must_use]
    pub fn higher_is_better(self) -> bool {
        !matches!(self, MetricName::DaviesBouldin)
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown quality metric: {0}")]
pub struct UnknownMetric(pub String);

impl FromStr for MetricName {
    type Err = UnknownMetric;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "silhouette" => Ok(MetricName::Silhouette),
            "calinski_harabasz" | "calinski" => Ok(MetricName::CalinskiHarabasz),
            "davies_bouldin" | "davies-bouldin" => Ok(MetricName::DaviesBouldin),
            other => Err(UnknownMetric(other.to_string())),
        }
    }
}

/// Metric values of one fitted model. Metrics that are undefined for the
/// labelling (for example a single populated cluster) are absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QualityMetrics(BTreeMap<MetricName, f64>);

impl QualityMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: MetricName, value: f64) {
        self.0.insert(name, value);
    }

    #[must_use]
    pub fn get(&self, name: MetricName) -> Option<f64> {
        self.0.get(&name).copied()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (MetricName, f64)> + '_ {
        self.0.iter().map(|(name, value)| (*name, *value))
    }
}

impl FromIterator<(MetricName, f64)> for QualityMetrics {
    fn from_iter<I: IntoIterator<Item = (MetricName, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A trained partitioning model: one centroid per cluster, nearest centroid wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedModel {
    pub algorithm: String,
    pub features: Vec<String>,
    pub centroids: Array2<f64>,
    pub inertia: f64,
    pub iterations: usize,
}

impl FittedModel {
    #[must_use]
    pub fn num_clusters(&self) -> usize {
        self.centroids.nrows()
    }

    /// Labels every row of an already prepared matrix.
    #[must_use]
    pub fn predict(&self, prepared: &Array2<f64>) -> Vec<usize> {
        prepared
            .rows()
            .into_iter()
            .map(|row| nearest_centroid(row, &self.centroids).0)
            .collect()
    }
}

/// Result of fitting one cluster count on one partition.
///
/// `metrics` carries its own error so that a metric failure does not throw away
/// an otherwise usable model.
#[derive(Debug)]
pub struct ExperimentRun {
    pub model: FittedModel,
    pub context: FitContext,
    pub labels: Vec<usize>,
    pub metrics: Result<QualityMetrics, ClusterError>,
}

/// Backend that fits a partitioning model for a fixed cluster count and labels
/// new rows with it.
pub trait ClusterExperiment: Send + Sync {
    fn fit(&self, features: &FeatureTable, k: usize) -> Result<ExperimentRun, ClusterError>;

    /// Labels `features` with a model fitted under `context`. Returns one label per row.
    fn assign(
        &self,
        context: &FitContext,
        model: &FittedModel,
        features: &FeatureTable,
    ) -> Result<Vec<usize>, ClusterError> {
        let prepared = context.prepare(features)?;
        Ok(model.predict(&prepared))
    }
}

pub(crate) fn squared_distance(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

pub(crate) fn nearest_centroid(point: ArrayView1<f64>, centroids: &Array2<f64>) -> (usize, f64) {
    let mut best = (0, f64::INFINITY);
    for (idx, centroid) in centroids.rows().into_iter().enumerate() {
        let dist = squared_distance(point, centroid);
        if dist < best.1 {
            best = (idx, dist);
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn metric_names_parse_case_insensitively() {
        assert_eq!("Silhouette".parse(), Ok(MetricName::Silhouette));
        assert_eq!("calinski".parse(), Ok(MetricName::CalinskiHarabasz));
        assert_eq!(" davies_bouldin ".parse(), Ok(MetricName::DaviesBouldin));
        assert_eq!(
            "inertia".parse::<MetricName>(),
            Err(UnknownMetric("inertia".into()))
        );
    }

    #[test]
    fn only_davies_bouldin_prefers_lower_values() {
        assert!(MetricName::Silhouette.higher_is_better());
        assert!(MetricName::CalinskiHarabasz.higher_is_better());
        assert!(!MetricName::DaviesBouldin.higher_is_better());
    }

    #[test]
    fn quality_metrics_serialize_by_metric_name() {
        let metrics: QualityMetrics = [(MetricName::Silhouette, 0.5), (MetricName::DaviesBouldin, 0.7)]
            .into_iter()
            .collect();
        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json, serde_json::json!({"silhouette": 0.5, "davies_bouldin": 0.7}));
    }

    #[test]
    fn predict_picks_nearest_centroid() {
        let model = FittedModel {
            algorithm: "kmeans".into(),
            features: vec!["x".into()],
            centroids: array![[0.0], [10.0]],
            inertia: 0.0,
            iterations: 1,
        };
        let labels = model.predict(&array![[1.0], [9.0], [4.9], [5.1]]);
        assert_eq!(labels, vec![0, 1, 0, 1]);
    }
}
