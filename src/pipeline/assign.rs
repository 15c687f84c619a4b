/// クラスタ割り当てステージ。
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, info};

use crate::cluster::ClusterExperiment;
use crate::observability::metrics::Metrics;
use crate::table::{Cell, PartitionedFeatures, PartitionedRecords, RecordTable, TableError};
use crate::util::error::PipelineError;
use crate::util::partial_success::{Degradation, DegradationKind, Stage};

use super::RunContext;
use super::train::{TrainedModel, TrainedModels};

/// クラスタID → 件数。
pub type ClusterDistribution = BTreeMap<usize, usize>;

#[derive(Debug, Clone, Default)]
pub struct AssignmentOutput {
    /// 元レコードにクラスタ列を追加したもの
    pub labeled: PartitionedRecords,
    pub distributions: BTreeMap<String, ClusterDistribution>,
    pub total_records: usize,
    pub degradations: Vec<Degradation>,
}

pub trait AssignStage: Send + Sync {
    fn assign(
        &self,
        run: &RunContext,
        features: &PartitionedFeatures,
        models: &TrainedModels,
        records: &PartitionedRecords,
    ) -> Result<AssignmentOutput, PipelineError>;
}

/// 学習時のコンテキストを復元して元レコードにラベルを付ける AssignStage。
pub struct ContextAssignStage {
    experiment: Arc<dyn ClusterExperiment>,
    cluster_column: String,
    telemetry: Arc<Metrics>,
}

enum PartitionAssignment {
    Labeled(RecordTable, ClusterDistribution),
    Skipped(Degradation),
}

impl ContextAssignStage {
    pub fn new(experiment: Arc<dyn ClusterExperiment>, cluster_column: impl Into<String>, telemetry: Arc<Metrics>) -> Self {
        Self {
            experiment,
            cluster_column: cluster_column.into(),
            telemetry,
        }
    }

    fn assign_partition(
        &self,
        partition: &str,
        features: &PartitionedFeatures,
        model: &TrainedModel,
        records: &RecordTable,
    ) -> Result<PartitionAssignment, PipelineError> {
        let Some(table) = features.get(partition) else {
            return Ok(PartitionAssignment::Skipped(Degradation::new(
                Stage::Assign,
                partition,
                DegradationKind::MissingFeatures,
                "no reduced features for a trained model",
            )));
        };

        let cluster_error = |source| PipelineError::Cluster {
            partition: partition.to_string(),
            source,
        };
        let context = model.context.restore().map_err(cluster_error)?;
        let labels = self
            .experiment
            .assign(&context, &model.model, table)
            .map_err(cluster_error)?;

        if labels.len() != records.row_count() {
            let error = PipelineError::RowCountMismatch {
                partition: partition.to_string(),
                labels: labels.len(),
                records: records.row_count(),
            };
            return Ok(PartitionAssignment::Skipped(Degradation::new(
                Stage::Assign,
                partition,
                DegradationKind::RowCountMismatch {
                    labels: labels.len(),
                    records: records.row_count(),
                },
                error.to_string(),
            )));
        }

        let mut distribution = ClusterDistribution::new();
        for &label in &labels {
            *distribution.entry(label).or_default() += 1;
        }
        let cells = labels.into_iter().map(|label| Cell::Int(label as i64)).collect();
        let labeled = records
            .with_column(&self.cluster_column, cells)
            .map_err(|error| match error {
                TableError::DuplicateColumn(column) => PipelineError::SchemaMismatch {
                    partition: partition.to_string(),
                    detail: format!("records already contain the cluster column {column:?}"),
                },
                other => PipelineError::Table(other),
            })?;

        Ok(PartitionAssignment::Labeled(labeled, distribution))
    }
}

impl AssignStage for ContextAssignStage {
    fn assign(
        &self,
        run: &RunContext,
        features: &PartitionedFeatures,
        models: &TrainedModels,
        records: &PartitionedRecords,
    ) -> Result<AssignmentOutput, PipelineError> {
        info!(run_id = %run.run_id, models = models.len(), "cluster assignment started");

        // 元レコードが欠けているとラベルの無い行が黙って消えるので、書き込み前に中断する
        if let Some(partition) = models.keys().find(|p| !records.contains_key(*p)) {
            return Err(PipelineError::SchemaMismatch {
                partition: partition.clone(),
                detail: "original records missing for a trained model".to_string(),
            });
        }

        let mut output = AssignmentOutput::default();
        for (partition, model) in models {
            let records = &records[partition];
            match self.assign_partition(partition, features, model, records)? {
                PartitionAssignment::Labeled(labeled, distribution) => {
                    debug!(partition = %partition, distribution = ?distribution, "partition labeled");
                    output.total_records += labeled.row_count();
                    output.distributions.insert(partition.clone(), distribution);
                    output.labeled.insert(partition.clone(), labeled);
                }
                PartitionAssignment::Skipped(degradation) => {
                    self.telemetry.partitions_skipped.inc();
                    output.degradations.push(degradation);
                }
            }
        }

        let unmodeled: BTreeSet<&String> = features
            .keys()
            .chain(records.keys())
            .filter(|p| !models.contains_key(*p))
            .collect();
        for partition in unmodeled {
            output.degradations.push(Degradation::new(
                Stage::Assign,
                partition.as_str(),
                DegradationKind::MissingModel,
                "no trained model, records left unlabeled",
            ));
        }

        self.telemetry.records_labeled.inc_by(output.total_records as f64);
        info!(
            run_id = %run.run_id,
            partitions = output.labeled.len(),
            total_records = output.total_records,
            "cluster assignment finished"
        );
        Ok(output)
    }
}
