//! Store-clustering pipeline: select → train → assign → report → persist.
//!
//! Every stage is a trait object wired by [`PipelineBuilder`]; the default
//! implementations talk to a [`ClusterExperiment`](crate::cluster::ClusterExperiment)
//! and the store sinks.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::JobConfig;
use crate::table::{PartitionedFeatures, PartitionedRecords};
use crate::util::error::PipelineError;
use crate::util::partial_success::{Degradation, PartialSuccess};

pub mod assign;
pub mod orchestrator;
pub mod persist;
pub mod report;
pub mod select;
pub mod train;

#[cfg(test)]
pub(crate) mod testing;

pub use orchestrator::{PipelineBuilder, PipelineOrchestrator};

use assign::AssignmentOutput;
use persist::PersistResult;
use report::QualityReport;
use select::SelectionOutput;
use train::TrainingOutput;

/// パーティション名 → 選ばれたクラスタ数。
pub type ClusterCountMap = BTreeMap<String, usize>;

/// 1回のラン（ジョブ実行）の識別情報。
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub job: String,
    pub started_at: DateTime<Utc>,
}

impl RunContext {
    pub fn new(job: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            job: job.into(),
            started_at: Utc::now(),
        }
    }
}

/// パイプラインへの入力：特徴量と元レコード（どちらもパーティション単位）。
#[derive(Debug, Clone, Default)]
pub struct JobInput {
    pub name: String,
    pub features: PartitionedFeatures,
    pub records: PartitionedRecords,
}

impl JobInput {
    /// ジョブ設定に従って入力を読み込む。
    ///
    /// 特徴量テーブルはパーティション列で分割し、ID列を除いた残りを数値特徴量とする。
    pub fn load(name: &str, job: &JobConfig) -> Result<Self, PipelineError> {
        let id_columns: Vec<&str> = job.id_columns.iter().map(String::as_str).collect();

        let feature_tables = job.features.build().read_partitions(&job.partition_column)?;
        let mut features = PartitionedFeatures::new();
        for (partition, table) in feature_tables {
            let reduced = table.to_features(&id_columns)?;
            debug!(
                job = name,
                partition = %partition,
                rows = reduced.n_samples(),
                features = reduced.n_features(),
                "features loaded"
            );
            features.insert(partition, reduced);
        }

        let records = job.records.build().read_partitions(&job.partition_column)?;
        info!(
            job = name,
            feature_partitions = features.len(),
            record_partitions = records.len(),
            "job input loaded"
        );

        Ok(Self {
            name: name.to_string(),
            features,
            records,
        })
    }
}

/// 各ステージの出力をまとめたもの。
#[derive(Debug, Clone, Default)]
pub struct RunArtifacts {
    pub selection: SelectionOutput,
    pub training: TrainingOutput,
    pub assignment: AssignmentOutput,
    pub report: QualityReport,
}

impl RunArtifacts {
    /// 全ステージのスキップ／調整の記録（ステージ順）。
    pub fn degradations(&self) -> impl Iterator<Item = &Degradation> {
        self.selection
            .degradations
            .iter()
            .chain(&self.training.degradations)
            .chain(&self.assignment.degradations)
            .chain(&self.report.degradations)
    }
}

/// ラン全体の結果。
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run: RunContext,
    pub finished_at: DateTime<Utc>,
    pub artifacts: RunArtifacts,
    pub partial_success: PartialSuccess,
    pub persisted: Option<PersistResult>,
}

impl RunOutcome {
    pub fn cluster_counts(&self) -> &ClusterCountMap {
        &self.artifacts.selection.counts
    }

    pub fn average_silhouette(&self) -> Option<f64> {
        self.artifacts.report.average_silhouette
    }

    /// ログや標準出力向けの要約。
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.run.run_id,
            job: self.run.job.clone(),
            started_at: self.run.started_at,
            finished_at: self.finished_at,
            cluster_counts: self.artifacts.selection.counts.clone(),
            models: self.artifacts.training.models.len(),
            records_labeled: self.artifacts.assignment.total_records,
            average_silhouette: self.artifacts.report.average_silhouette,
            completed: self.partial_success.completed.clone(),
            skipped: self.partial_success.skipped.clone(),
            degradations: self.partial_success.degradations.len(),
            assets_written: self
                .persisted
                .as_ref()
                .map(|result| result.assets_written.clone())
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub job: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cluster_counts: ClusterCountMap,
    pub models: usize,
    pub records_labeled: usize,
    pub average_silhouette: Option<f64>,
    pub completed: Vec<String>,
    pub skipped: Vec<String>,
    pub degradations: usize,
    pub assets_written: Vec<String>,
}
