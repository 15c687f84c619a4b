//! Test doubles shared by the stage tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use ndarray::Array2;
use uuid::Uuid;

use super::RunContext;
use crate::cluster::{
    ClusterError, ClusterExperiment, ExperimentRun, FitContext, FittedModel, MetricName,
    QualityMetrics,
};
use crate::table::{Cell, FeatureTable, RecordTable};

/// Experiment whose metric values are scripted per k.
///
/// Centroids are the first k rows (cycled), so labelling through the default
/// `assign` stays deterministic.
#[derive(Debug, Default)]
pub(crate) struct ScriptedExperiment {
    scores: BTreeMap<usize, QualityMetrics>,
    failing: BTreeSet<usize>,
    metric_failure: bool,
    calls: Mutex<Vec<usize>>,
}

impl ScriptedExperiment {
    pub(crate) fn with_score(mut self, k: usize, metric: MetricName, value: f64) -> Self {
        self.scores.entry(k).or_default().insert(metric, value);
        self
    }

    pub(crate) fn failing_at(mut self, k: usize) -> Self {
        self.failing.insert(k);
        self
    }

    pub(crate) fn with_metric_failure(mut self) -> Self {
        self.metric_failure = true;
        self
    }

    pub(crate) fn calls(&self) -> Vec<usize> {
        let mut calls = self
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        calls.sort_unstable();
        calls
    }
}

impl ClusterExperiment for ScriptedExperiment {
    fn fit(&self, features: &FeatureTable, k: usize) -> Result<ExperimentRun, ClusterError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(k);
        if self.failing.contains(&k) {
            return Err(ClusterError::FitFailure(format!("scripted failure at k={k}")));
        }

        let context = FitContext::setup(features, 7)?;
        let prepared = context.prepare(features)?;
        let n = prepared.nrows();
        let centroids = Array2::from_shape_fn((k, prepared.ncols()), |(i, j)| prepared[[i % n, j]]);
        let model = FittedModel {
            algorithm: "scripted".to_string(),
            features: context.columns.clone(),
            centroids,
            inertia: 0.0,
            iterations: 1,
        };
        let labels = model.predict(&prepared);
        let metrics = if self.metric_failure {
            Err(ClusterError::MetricExtraction("scripted".into()))
        } else {
            Ok(self.scores.get(&k).cloned().unwrap_or_default())
        };

        Ok(ExperimentRun {
            model,
            context,
            labels,
            metrics,
        })
    }
}

/// `rows` distinct points on a line with two feature columns.
pub(crate) fn features_with_rows(rows: usize) -> FeatureTable {
    let values: Vec<Vec<f64>> = (0..rows)
        .map(|i| vec![i as f64, (i * i) as f64])
        .collect();
    FeatureTable::from_rows(vec!["sales".into(), "visits".into()], &values)
        .expect("valid feature rows")
}

pub(crate) fn records_with_rows(rows: usize) -> RecordTable {
    RecordTable::from_rows(
        vec!["STORE_NBR".into(), "sales".into()],
        (0..rows)
            .map(|i| vec![Cell::Int(i as i64 + 1), Cell::Float(i as f64)])
            .collect(),
    )
    .expect("valid record rows")
}

pub(crate) fn metrics_of(values: &[(MetricName, f64)]) -> QualityMetrics {
    values.iter().copied().collect()
}

pub(crate) fn run_context() -> RunContext {
    RunContext {
        run_id: Uuid::new_v4(),
        job: "test".to_string(),
        started_at: Utc::now(),
    }
}
