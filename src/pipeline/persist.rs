/// 永続化ステージ。
use std::sync::Arc;

use tracing::{info, warn};

use crate::cluster::MetricName;
use crate::store::{ContextStore, TableWriter};
use crate::table::{Cell, PartitionedRecords, RecordTable};
use crate::util::error::PipelineError;

use super::select::SelectionBasis;
use super::{RunArtifacts, RunContext};

pub const MODELS_ASSET: &str = "models";
pub const CENTROIDS_ASSET: &str = "centroids";
pub const ASSIGNMENTS_ASSET: &str = "assignments";
pub const QUALITY_ASSET: &str = "quality";
pub const SELECTION_ASSET: &str = "selection";
pub const DEGRADATIONS_ASSET: &str = "degradations";

/// モデルが一つも無いときに空のメタデータを書くパーティション名。
const EMPTY_MODELS_PARTITION: &str = "default";

/// 永続化結果。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistResult {
    pub assets_written: Vec<String>,
    pub models_stored: usize,
    pub contexts_stored: usize,
    pub records_written: usize,
}

pub trait PersistStage: Send + Sync {
    fn persist(&self, run: &RunContext, artifacts: &RunArtifacts) -> Result<PersistResult, PipelineError>;
}

/// `TableWriter` と `ContextStore` に成果物を書き出す PersistStage。
pub struct SinkPersistStage {
    writer: Arc<dyn TableWriter>,
    contexts: Arc<dyn ContextStore>,
}

impl SinkPersistStage {
    pub fn new(writer: Arc<dyn TableWriter>, contexts: Arc<dyn ContextStore>) -> Self {
        Self { writer, contexts }
    }

    fn write(&self, asset: &str, partitions: &PartitionedRecords, result: &mut PersistResult) -> Result<(), PipelineError> {
        self.writer.write(asset, partitions)?;
        result.assets_written.push(asset.to_string());
        Ok(())
    }
}

impl PersistStage for SinkPersistStage {
    fn persist(&self, run: &RunContext, artifacts: &RunArtifacts) -> Result<PersistResult, PipelineError> {
        info!(
            run_id = %run.run_id,
            models = artifacts.training.models.len(),
            labeled = artifacts.assignment.labeled.len(),
            "persisting run artifacts"
        );
        let mut result = PersistResult::default();

        // コンテキストを先に保存し、メタデータが存在しないキーを指さないようにする
        for model in artifacts.training.models.values() {
            self.contexts.put(&model.context)?;
            result.contexts_stored += 1;
        }

        let mut models = model_rows(run, artifacts)?;
        result.models_stored = models.len();
        if models.is_empty() {
            warn!(run_id = %run.run_id, "no trained models, writing empty model metadata");
            models.insert(EMPTY_MODELS_PARTITION.to_string(), RecordTable::new(Vec::new()));
        }
        self.write(MODELS_ASSET, &models, &mut result)?;
        self.write(CENTROIDS_ASSET, &centroid_rows(artifacts)?, &mut result)?;

        if artifacts.assignment.labeled.is_empty() {
            warn!(run_id = %run.run_id, "no labeled records, skipping assignments asset");
        } else {
            self.write(ASSIGNMENTS_ASSET, &artifacts.assignment.labeled, &mut result)?;
            result.records_written = artifacts.assignment.total_records;
        }

        self.write(QUALITY_ASSET, &quality_rows(artifacts)?, &mut result)?;
        self.write(SELECTION_ASSET, &selection_rows(artifacts)?, &mut result)?;
        self.write(DEGRADATIONS_ASSET, &degradation_rows(artifacts)?, &mut result)?;

        info!(
            run_id = %run.run_id,
            assets = ?result.assets_written,
            models_stored = result.models_stored,
            records_written = result.records_written,
            "run artifacts persisted"
        );
        Ok(result)
    }
}

fn metric_columns() -> impl Iterator<Item = String> {
    MetricName::ALL.into_iter().map(|metric| metric.as_str().to_string())
}

fn model_rows(run: &RunContext, artifacts: &RunArtifacts) -> Result<PartitionedRecords, PipelineError> {
    let mut columns: Vec<String> = [
        "run_id",
        "trained_at",
        "algorithm",
        "requested_clusters",
        "num_clusters",
        "populated_clusters",
        "num_samples",
        "features",
        "context_key",
        "inertia",
        "iterations",
    ]
    .into_iter()
    .map(String::from)
    .collect();
    columns.extend(metric_columns());

    let mut partitions = PartitionedRecords::new();
    for (partition, model) in &artifacts.training.models {
        let mut row = vec![
            Cell::from(run.run_id.to_string()),
            Cell::from(run.started_at.to_rfc3339()),
            Cell::from(model.model.algorithm.as_str()),
            Cell::from(model.requested_k.map(|k| k as i64)),
            Cell::from(model.num_clusters as i64),
            Cell::from(model.populated_clusters as i64),
            Cell::from(model.num_samples as i64),
            Cell::from(model.features.join(",")),
            Cell::from(model.context.key()),
            Cell::from(model.model.inertia),
            Cell::from(model.model.iterations as i64),
        ];
        row.extend(MetricName::ALL.into_iter().map(|metric| Cell::from(model.metrics.get(metric))));
        partitions.insert(partition.clone(), RecordTable::from_rows(columns.clone(), vec![row])?);
    }
    Ok(partitions)
}

fn centroid_rows(artifacts: &RunArtifacts) -> Result<PartitionedRecords, PipelineError> {
    let mut partitions = PartitionedRecords::new();
    for (partition, model) in &artifacts.training.models {
        let mut columns = vec!["cluster".to_string()];
        columns.extend(model.features.iter().cloned());
        let rows = model
            .model
            .centroids
            .rows()
            .into_iter()
            .enumerate()
            .map(|(cluster, centroid)| {
                let mut row = vec![Cell::from(cluster as i64)];
                row.extend(centroid.iter().map(|value| Cell::from(*value)));
                row
            })
            .collect();
        partitions.insert(partition.clone(), RecordTable::from_rows(columns, rows)?);
    }
    Ok(partitions)
}

fn quality_rows(artifacts: &RunArtifacts) -> Result<PartitionedRecords, PipelineError> {
    let mut partitions = PartitionedRecords::new();
    for (partition, summary) in &artifacts.report.summaries {
        let mut columns: Vec<String> = vec!["num_clusters".into(), "populated_clusters".into(), "num_samples".into()];
        columns.extend(metric_columns());
        let mut row = vec![
            Cell::from(summary.num_clusters as i64),
            Cell::from(summary.populated_clusters as i64),
            Cell::from(summary.num_samples as i64),
            Cell::from(summary.silhouette),
            Cell::from(summary.calinski_harabasz),
            Cell::from(summary.davies_bouldin),
        ];
        for (cluster, count) in &summary.cluster_distribution {
            columns.push(format!("cluster_{cluster}_count"));
            row.push(Cell::from(*count as i64));
        }
        partitions.insert(partition.clone(), RecordTable::from_rows(columns, vec![row])?);
    }
    Ok(partitions)
}

fn selection_rows(artifacts: &RunArtifacts) -> Result<PartitionedRecords, PipelineError> {
    let mut columns: Vec<String> = ["k", "chosen", "failed", "basis"]
        .into_iter()
        .map(String::from)
        .collect();
    columns.extend(metric_columns());

    let mut partitions = PartitionedRecords::new();
    for (partition, report) in &artifacts.selection.reports {
        let basis = match report.basis {
            SelectionBasis::TooFewSamples => "too_few_samples".to_string(),
            SelectionBasis::RangeCollapsed => "range_collapsed".to_string(),
            SelectionBasis::Metric(metric) => metric.as_str().to_string(),
            SelectionBasis::Fallback => "fallback".to_string(),
        };
        let mut ks: Vec<usize> = report
            .candidates
            .keys()
            .copied()
            .chain(report.failed_candidates.iter().copied())
            .collect();
        if ks.is_empty() {
            ks.push(report.chosen_k);
        }
        ks.sort_unstable();

        let rows = ks
            .into_iter()
            .map(|k| {
                let scores = report.candidates.get(&k);
                let mut row = vec![
                    Cell::from(k as i64),
                    Cell::from(k == report.chosen_k),
                    Cell::from(report.failed_candidates.contains(&k)),
                    Cell::from(basis.as_str()),
                ];
                row.extend(
                    MetricName::ALL
                        .into_iter()
                        .map(|metric| Cell::from(scores.and_then(|s| s.get(metric)))),
                );
                row
            })
            .collect();
        partitions.insert(partition.clone(), RecordTable::from_rows(columns.clone(), rows)?);
    }
    Ok(partitions)
}

fn degradation_rows(artifacts: &RunArtifacts) -> Result<PartitionedRecords, PipelineError> {
    let columns: Vec<String> = ["stage", "type", "detail"].into_iter().map(String::from).collect();
    let mut partitions = PartitionedRecords::new();
    for degradation in artifacts.degradations() {
        let kind = serde_json::to_value(&degradation.kind)
            .ok()
            .and_then(|value| value.get("type").and_then(|t| t.as_str()).map(String::from))
            .unwrap_or_else(|| format!("{:?}", degradation.kind));
        partitions
            .entry(degradation.partition.clone())
            .or_insert_with(|| RecordTable::new(columns.clone()))
            .push_row(vec![
                Cell::from(degradation.stage.to_string()),
                Cell::from(kind),
                Cell::from(degradation.detail.as_str()),
            ])?;
    }
    Ok(partitions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::run_context;
    use crate::store::{MemoryContextStore, MemoryWriter};
    use crate::util::partial_success::{Degradation, DegradationKind, Stage};

    fn sinks() -> (Arc<MemoryWriter>, Arc<MemoryContextStore>, SinkPersistStage) {
        let writer = Arc::new(MemoryWriter::new("category"));
        let contexts = Arc::new(MemoryContextStore::new());
        let stage = SinkPersistStage::new(
            Arc::clone(&writer) as Arc<dyn TableWriter>,
            Arc::clone(&contexts) as Arc<dyn ContextStore>,
        );
        (writer, contexts, stage)
    }

    #[test]
    fn empty_run_writes_placeholder_models_and_skips_assignments() {
        let (writer, contexts, stage) = sinks();

        let result = stage.persist(&run_context(), &RunArtifacts::default()).unwrap();

        assert_eq!(result.models_stored, 0);
        assert!(contexts.is_empty());
        assert!(writer.asset(ASSIGNMENTS_ASSET).is_none());
        let models = writer.asset(MODELS_ASSET).unwrap();
        assert!(models.is_empty());
        assert_eq!(models.columns(), &["category".to_string()]);
        assert!(!result.assets_written.contains(&ASSIGNMENTS_ASSET.to_string()));
    }

    #[test]
    fn degradation_rows_use_kind_tag() {
        let mut artifacts = RunArtifacts::default();
        artifacts.training.degradations.push(Degradation::new(
            Stage::Train,
            "drinks",
            DegradationKind::TrainingSkipped,
            "1 sample",
        ));

        let rows = degradation_rows(&artifacts).unwrap();

        let drinks = &rows["drinks"];
        assert_eq!(drinks.rows()[0][0], Cell::Text("train".into()));
        assert_eq!(drinks.rows()[0][1], Cell::Text("training_skipped".into()));
    }
}
