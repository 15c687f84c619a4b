/// クラスタ数選定ステージ。
use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::cluster::{ClusterExperiment, MetricName, QualityMetrics};
use crate::observability::metrics::Metrics;
use crate::table::{FeatureTable, PartitionedFeatures};
use crate::util::error::PipelineError;
use crate::util::parallel::map_partitions;
use crate::util::partial_success::{Degradation, DegradationKind, Stage};

use super::{ClusterCountMap, RunContext};

/// 選ばれたクラスタ数の根拠。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionBasis {
    /// `n < min_clusters` のため評価せず k=1
    TooFewSamples,
    /// `min(max_clusters, n-1) < min_clusters` のため評価せず k=1
    RangeCollapsed,
    /// 指定メトリクスの最良値
    Metric(MetricName),
    /// 使えるメトリクスがなく既定値にフォールバック
    Fallback,
}

/// パーティションごとの探索記録（制御には使わない観測用メタデータ）。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectionReport {
    pub sample_count: usize,
    pub candidates: BTreeMap<usize, QualityMetrics>,
    pub failed_candidates: Vec<usize>,
    pub chosen_k: usize,
    pub basis: SelectionBasis,
}

#[derive(Debug, Clone, Default)]
pub struct SelectionOutput {
    pub counts: ClusterCountMap,
    pub reports: BTreeMap<String, SelectionReport>,
    pub degradations: Vec<Degradation>,
}

pub trait SelectStage: Send + Sync {
    fn select(
        &self,
        run: &RunContext,
        features: &PartitionedFeatures,
    ) -> Result<SelectionOutput, PipelineError>;
}

/// 候補 k を順に学習し、メトリクスで最良の k を選ぶ SelectStage。
pub struct MetricSelectStage {
    experiment: Arc<dyn ClusterExperiment>,
    min_clusters: usize,
    max_clusters: usize,
    metrics: Vec<MetricName>,
    parallelism: usize,
    telemetry: Arc<Metrics>,
}

impl MetricSelectStage {
    pub fn new(
        experiment: Arc<dyn ClusterExperiment>,
        min_clusters: usize,
        max_clusters: usize,
        metrics: Vec<MetricName>,
        parallelism: usize,
        telemetry: Arc<Metrics>,
    ) -> Self {
        Self {
            experiment,
            min_clusters,
            max_clusters,
            metrics,
            parallelism,
            telemetry,
        }
    }

    fn select_partition(
        &self,
        partition: &str,
        features: &FeatureTable,
    ) -> (SelectionReport, Vec<Degradation>) {
        let n = features.n_samples();
        let mut degradations = Vec::new();

        if n < self.min_clusters {
            self.telemetry.degenerate_selections.inc();
            let error = PipelineError::InsufficientData {
                partition: partition.to_string(),
                required: self.min_clusters,
                available: n,
            };
            degradations.push(Degradation::new(
                Stage::Select,
                partition,
                DegradationKind::TooFewSamples,
                error.to_string(),
            ));
            return (degenerate_report(n, SelectionBasis::TooFewSamples), degradations);
        }

        let effective_max = self.max_clusters.min(n - 1);
        if effective_max < self.min_clusters {
            self.telemetry.degenerate_selections.inc();
            degradations.push(Degradation::new(
                Stage::Select,
                partition,
                DegradationKind::RangeCollapsed,
                format!(
                    "candidate range [{}, {effective_max}] is empty for {n} samples",
                    self.min_clusters
                ),
            ));
            return (degenerate_report(n, SelectionBasis::RangeCollapsed), degradations);
        }

        self.telemetry.partitions_evaluated.inc();
        let mut candidates = BTreeMap::new();
        let mut failed_candidates = Vec::new();
        for k in self.min_clusters..=effective_max {
            match self.experiment.fit(features, k) {
                Ok(run) => {
                    let scores = match run.metrics {
                        Ok(scores) => scores,
                        Err(source) => {
                            let error = PipelineError::MetricExtraction {
                                partition: partition.to_string(),
                                source,
                            };
                            degradations.push(Degradation::new(
                                Stage::Select,
                                partition,
                                DegradationKind::MetricExtractionFailed,
                                format!("k={k}: {error}"),
                            ));
                            QualityMetrics::new()
                        }
                    };
                    debug!(partition, k, metrics = ?scores, "candidate evaluated");
                    candidates.insert(k, scores);
                }
                Err(source) => {
                    self.telemetry.candidate_fit_failures.inc();
                    let error = PipelineError::FitFailure {
                        partition: partition.to_string(),
                        k,
                        source,
                    };
                    degradations.push(Degradation::new(
                        Stage::Select,
                        partition,
                        DegradationKind::CandidateFitFailed { k },
                        error.to_string(),
                    ));
                    failed_candidates.push(k);
                }
            }
        }

        let (chosen_k, basis) = match choose_k(&candidates, &self.metrics) {
            Some((k, metric)) => (k, SelectionBasis::Metric(metric)),
            None => {
                self.telemetry.metric_fallbacks.inc();
                let k = fallback_k(self.min_clusters, n);
                degradations.push(Degradation::new(
                    Stage::Select,
                    partition,
                    DegradationKind::MetricFallback,
                    format!("no usable metric among {} candidates, using k={k}", candidates.len()),
                ));
                (k, SelectionBasis::Fallback)
            }
        };

        (
            SelectionReport {
                sample_count: n,
                candidates,
                failed_candidates,
                chosen_k,
                basis,
            },
            degradations,
        )
    }
}

impl SelectStage for MetricSelectStage {
    fn select(
        &self,
        run: &RunContext,
        features: &PartitionedFeatures,
    ) -> Result<SelectionOutput, PipelineError> {
        info!(
            run_id = %run.run_id,
            job = %run.job,
            partitions = features.len(),
            min_clusters = self.min_clusters,
            max_clusters = self.max_clusters,
            "cluster-count selection started"
        );

        let mut output = SelectionOutput::default();
        let results = map_partitions(self.parallelism, features, |partition, table| {
            self.select_partition(partition, table)
        });
        for (partition, (report, degradations)) in results {
            info!(
                run_id = %run.run_id,
                partition = %partition,
                sample_count = report.sample_count,
                evaluated = report.candidates.len(),
                chosen_k = report.chosen_k,
                basis = ?report.basis,
                "cluster count selected"
            );
            output.counts.insert(partition.clone(), report.chosen_k);
            output.reports.insert(partition, report);
            output.degradations.extend(degradations);
        }

        info!(run_id = %run.run_id, partitions = output.counts.len(), "cluster-count selection finished");
        Ok(output)
    }
}

fn degenerate_report(sample_count: usize, basis: SelectionBasis) -> SelectionReport {
    SelectionReport {
        sample_count,
        candidates: BTreeMap::new(),
        failed_candidates: Vec::new(),
        chosen_k: 1,
        basis,
    }
}

/// メトリクス優先順位（silhouette → Calinski-Harabasz → Davies-Bouldin）に従って k を選ぶ。
///
/// 要求されていない、または一度も取得できなかったメトリクスは飛ばす。同値なら最小の k。
#[must_use]
pub fn choose_k(
    candidates: &BTreeMap<usize, QualityMetrics>,
    requested: &[MetricName],
) -> Option<(usize, MetricName)> {
    MetricName::ALL
        .into_iter()
        .filter(|metric| requested.contains(metric))
        .find_map(|metric| best_for(candidates, metric).map(|k| (k, metric)))
}

fn best_for(candidates: &BTreeMap<usize, QualityMetrics>, metric: MetricName) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    // 昇順に走査し、厳密に良い場合のみ更新するので同値は小さい k が残る
    for (&k, scores) in candidates {
        let Some(value) = scores.get(metric).filter(|v| v.is_finite()) else {
            continue;
        };
        let better = match best {
            None => true,
            Some((_, current)) if metric.higher_is_better() => value > current,
            Some((_, current)) => value < current,
        };
        if better {
            best = Some((k, value));
        }
    }
    best.map(|(k, _)| k)
}

/// 使えるメトリクスがないときの k。
#[must_use]
pub fn fallback_k(min_clusters: usize, sample_count: usize) -> usize {
    if sample_count > 1 {
        min_clusters.min(sample_count - 1)
    } else {
        1
    }
}
