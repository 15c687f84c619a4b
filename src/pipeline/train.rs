/// モデル学習ステージ。
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{info, warn};

use crate::cluster::{ClusterExperiment, ContextBlob, FittedModel, QualityMetrics};
use crate::observability::metrics::Metrics;
use crate::table::{FeatureTable, PartitionedFeatures};
use crate::util::error::PipelineError;
use crate::util::parallel::map_partitions;
use crate::util::partial_success::{Degradation, DegradationKind, Stage};

use super::{ClusterCountMap, RunContext};

/// 選定結果にパーティションが無い場合のクラスタ数。
pub const DEFAULT_CLUSTER_COUNT: usize = 2;
/// 学習に使える最小のクラスタ数。
pub const MIN_TRAINABLE_CLUSTERS: usize = 2;

/// パーティションごとの学習済みモデルとその付随情報。
#[derive(Debug, Clone)]
pub struct TrainedModel {
    pub model: FittedModel,
    pub context: ContextBlob,
    pub requested_k: Option<usize>,
    /// 学習したセントロイドの数
    pub num_clusters: usize,
    /// 学習データで1件以上のサンプルを持つクラスタの数。重複点が多いと `num_clusters` を下回る
    pub populated_clusters: usize,
    pub num_samples: usize,
    pub features: Vec<String>,
    pub metrics: QualityMetrics,
}

pub type TrainedModels = BTreeMap<String, TrainedModel>;

#[derive(Debug, Clone, Default)]
pub struct TrainingOutput {
    pub models: TrainedModels,
    pub degradations: Vec<Degradation>,
}

pub trait TrainStage: Send + Sync {
    fn train(
        &self,
        run: &RunContext,
        features: &PartitionedFeatures,
        counts: &ClusterCountMap,
    ) -> Result<TrainingOutput, PipelineError>;
}

/// 要求クラスタ数を学習可能な値に補正した結果。
///
/// `k` が `None` ならそのパーティションは学習しない。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountResolution {
    pub k: Option<usize>,
    pub adjustments: Vec<DegradationKind>,
}

/// 要求クラスタ数をサンプル数に合わせて補正する。
///
/// 1. 2 未満なら 2 に引き上げる
/// 2. `n <= k` なら `n > 2` のとき `min(2, n-1)`、そうでなければ 2 に下げる
/// 3. `n <= 2` なら学習しない
#[must_use]
pub fn resolve_cluster_count(requested: usize, sample_count: usize) -> CountResolution {
    let mut adjustments = Vec::new();
    let mut k = requested;

    if k < MIN_TRAINABLE_CLUSTERS {
        adjustments.push(DegradationKind::ClusterCountRaised {
            from: k,
            to: MIN_TRAINABLE_CLUSTERS,
        });
        k = MIN_TRAINABLE_CLUSTERS;
    }

    if sample_count <= k {
        let reduced = if sample_count > 2 {
            MIN_TRAINABLE_CLUSTERS.min(sample_count - 1)
        } else {
            MIN_TRAINABLE_CLUSTERS
        };
        if reduced != k {
            adjustments.push(DegradationKind::ClusterCountReduced {
                from: k,
                to: reduced,
            });
            k = reduced;
        }
    }

    if sample_count <= 2 {
        adjustments.push(DegradationKind::TrainingSkipped);
        return CountResolution {
            k: None,
            adjustments,
        };
    }

    CountResolution {
        k: Some(k),
        adjustments,
    }
}

/// `ClusterExperiment` でパーティションごとに最終モデルを学習する TrainStage。
pub struct ExperimentTrainStage {
    experiment: Arc<dyn ClusterExperiment>,
    parallelism: usize,
    telemetry: Arc<Metrics>,
}

impl ExperimentTrainStage {
    pub fn new(experiment: Arc<dyn ClusterExperiment>, parallelism: usize, telemetry: Arc<Metrics>) -> Self {
        Self {
            experiment,
            parallelism,
            telemetry,
        }
    }

    fn train_partition(
        &self,
        partition: &str,
        features: &FeatureTable,
        requested: Option<usize>,
    ) -> Result<(Option<TrainedModel>, Vec<Degradation>), PipelineError> {
        let n = features.n_samples();
        let requested_k = requested.unwrap_or_else(|| {
            warn!(partition, default = DEFAULT_CLUSTER_COUNT, "no selected cluster count, using default");
            DEFAULT_CLUSTER_COUNT
        });

        let resolution = resolve_cluster_count(requested_k, n);
        let mut degradations: Vec<Degradation> = resolution
            .adjustments
            .into_iter()
            .map(|kind| {
                Degradation::new(
                    Stage::Train,
                    partition,
                    kind,
                    format!("requested k={requested_k} with {n} samples"),
                )
            })
            .collect();

        let Some(k) = resolution.k else {
            self.telemetry.partitions_skipped.inc();
            return Ok((None, degradations));
        };

        let run = match self.experiment.fit(features, k) {
            Ok(run) => run,
            Err(source) => {
                let error = PipelineError::FitFailure {
                    partition: partition.to_string(),
                    k,
                    source,
                };
                self.telemetry.partitions_skipped.inc();
                degradations.push(Degradation::new(
                    Stage::Train,
                    partition,
                    DegradationKind::TrainingSkipped,
                    format!("{error}: {}", error_chain(&error)),
                ));
                return Ok((None, degradations));
            }
        };

        let metrics = match run.metrics {
            Ok(metrics) => metrics,
            Err(source) => {
                let error = PipelineError::MetricExtraction {
                    partition: partition.to_string(),
                    source,
                };
                degradations.push(Degradation::new(
                    Stage::Train,
                    partition,
                    DegradationKind::MetricExtractionFailed,
                    format!("{error}: {}", error_chain(&error)),
                ));
                QualityMetrics::new()
            }
        };

        let context = ContextBlob::encode(&run.context).map_err(|source| PipelineError::Cluster {
            partition: partition.to_string(),
            source,
        })?;

        let populated_clusters = run.labels.iter().collect::<BTreeSet<_>>().len();
        if populated_clusters < run.model.num_clusters() {
            warn!(
                partition,
                num_clusters = run.model.num_clusters(),
                populated_clusters,
                "some clusters received no training samples"
            );
        }

        self.telemetry.models_trained.inc();
        Ok((
            Some(TrainedModel {
                features: run.model.features.clone(),
                num_clusters: run.model.num_clusters(),
                populated_clusters,
                model: run.model,
                context,
                requested_k: requested,
                num_samples: n,
                metrics,
            }),
            degradations,
        ))
    }
}

impl TrainStage for ExperimentTrainStage {
    fn train(
        &self,
        run: &RunContext,
        features: &PartitionedFeatures,
        counts: &ClusterCountMap,
    ) -> Result<TrainingOutput, PipelineError> {
        info!(run_id = %run.run_id, partitions = features.len(), "model training started");

        let results = map_partitions(self.parallelism, features, |partition, table| {
            self.train_partition(partition, table, counts.get(partition).copied())
        });

        let mut output = TrainingOutput::default();
        for (partition, result) in results {
            let (model, degradations) = result?;
            output.degradations.extend(degradations);
            if let Some(model) = model {
                info!(
                    run_id = %run.run_id,
                    partition = %partition,
                    num_clusters = model.num_clusters,
                    populated_clusters = model.populated_clusters,
                    num_samples = model.num_samples,
                    context_key = model.context.key(),
                    "model trained"
                );
                output.models.insert(partition, model);
            }
        }

        info!(
            run_id = %run.run_id,
            models = output.models.len(),
            skipped = features.len() - output.models.len(),
            "model training finished"
        );
        Ok(output)
    }
}

fn error_chain(error: &dyn std::error::Error) -> String {
    let mut parts = Vec::new();
    let mut source = error.source();
    while let Some(cause) = source {
        parts.push(cause.to_string());
        source = cause.source();
    }
    parts.join(": ")
}
