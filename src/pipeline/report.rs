/// 品質レポートステージ。
use std::collections::BTreeMap;

use serde::Serialize;
use tracing::info;

use crate::cluster::MetricName;
use crate::table::{PartitionedRecords, RecordTable};
use crate::util::error::PipelineError;
use crate::util::partial_success::{Degradation, DegradationKind, Stage};

use super::RunContext;
use super::assign::ClusterDistribution;
use super::train::{TrainedModel, TrainedModels};

/// パーティションごとの品質サマリー。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualitySummary {
    pub num_clusters: usize,
    pub populated_clusters: usize,
    pub num_samples: usize,
    pub silhouette: Option<f64>,
    pub calinski_harabasz: Option<f64>,
    pub davies_bouldin: Option<f64>,
    pub cluster_distribution: ClusterDistribution,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QualityReport {
    pub summaries: BTreeMap<String, QualitySummary>,
    /// silhouette が取れたパーティションだけの平均
    pub average_silhouette: Option<f64>,
    pub degradations: Vec<Degradation>,
}

pub trait ReportStage: Send + Sync {
    fn report(
        &self,
        run: &RunContext,
        models: &TrainedModels,
        labeled: &PartitionedRecords,
    ) -> Result<QualityReport, PipelineError>;
}

/// 学習時メトリクスと割り当て結果からサマリーを作る ReportStage。
pub struct QualityReportStage {
    cluster_column: String,
}

impl QualityReportStage {
    pub fn new(cluster_column: impl Into<String>) -> Self {
        Self {
            cluster_column: cluster_column.into(),
        }
    }

    fn summarize(
        &self,
        partition: &str,
        model: &TrainedModel,
        labeled: &RecordTable,
    ) -> Result<QualitySummary, PipelineError> {
        Ok(QualitySummary {
            num_clusters: model.num_clusters,
            populated_clusters: model.populated_clusters,
            num_samples: model.num_samples,
            silhouette: model.metrics.get(MetricName::Silhouette),
            calinski_harabasz: model.metrics.get(MetricName::CalinskiHarabasz),
            davies_bouldin: model.metrics.get(MetricName::DaviesBouldin),
            cluster_distribution: label_distribution(partition, labeled, &self.cluster_column)?,
        })
    }
}

impl ReportStage for QualityReportStage {
    fn report(
        &self,
        run: &RunContext,
        models: &TrainedModels,
        labeled: &PartitionedRecords,
    ) -> Result<QualityReport, PipelineError> {
        let mut report = QualityReport::default();
        for (partition, model) in models {
            let Some(table) = labeled.get(partition) else {
                report.degradations.push(Degradation::new(
                    Stage::Report,
                    partition.as_str(),
                    DegradationKind::MissingAssignments,
                    "trained model has no labeled records",
                ));
                continue;
            };
            let summary = self.summarize(partition, model, table)?;
            info!(
                run_id = %run.run_id,
                partition = %partition,
                num_clusters = summary.num_clusters,
                populated_clusters = summary.populated_clusters,
                silhouette = ?summary.silhouette,
                calinski_harabasz = ?summary.calinski_harabasz,
                davies_bouldin = ?summary.davies_bouldin,
                "partition quality"
            );
            report.summaries.insert(partition.clone(), summary);
        }

        report.average_silhouette =
            average_silhouette(report.summaries.values().map(|summary| summary.silhouette));
        info!(
            run_id = %run.run_id,
            partitions = report.summaries.len(),
            average_silhouette = ?report.average_silhouette,
            "quality report built"
        );
        Ok(report)
    }
}

/// 値のあるものだけの平均。ひとつも無ければ `None`。
pub fn average_silhouette(values: impl IntoIterator<Item = Option<f64>>) -> Option<f64> {
    let (sum, count) = values
        .into_iter()
        .flatten()
        .fold((0.0, 0usize), |(sum, count), value| (sum + value, count + 1));
    (count > 0).then(|| sum / count as f64)
}

/// ラベル列からクラスタごとの件数を数える。
pub fn label_distribution(
    partition: &str,
    labeled: &RecordTable,
    cluster_column: &str,
) -> Result<ClusterDistribution, PipelineError> {
    let mut distribution = ClusterDistribution::new();
    for (row, cell) in labeled.column(cluster_column)?.into_iter().enumerate() {
        let label = cell
            .as_i64()
            .and_then(|value| usize::try_from(value).ok())
            .ok_or_else(|| PipelineError::SchemaMismatch {
                partition: partition.to_string(),
                detail: format!("row {row} has no cluster label in {cluster_column:?}"),
            })?;
        *distribution.entry(label).or_default() += 1;
    }
    Ok(distribution)
}
