/// Prometheusメトリクス定義。
use prometheus::{
    Counter, Histogram, Registry, register_counter_with_registry,
    register_histogram_with_registry,
};
use std::sync::Arc;

/// メトリクスコレクター。
#[derive(Debug, Clone)]
pub struct Metrics {
    // カウンター
    pub partitions_evaluated: Counter,
    pub degenerate_selections: Counter,
    pub metric_fallbacks: Counter,
    pub candidate_fit_failures: Counter,
    pub models_trained: Counter,
    pub partitions_skipped: Counter,
    pub records_labeled: Counter,
    pub runs_completed: Counter,
    pub runs_failed: Counter,

    // ヒストグラム
    pub selection_duration: Histogram,
    pub training_duration: Histogram,
    pub assignment_duration: Histogram,
    pub report_duration: Histogram,
    pub persist_duration: Histogram,
    pub run_duration: Histogram,
}

impl Metrics {
    /// 新しいメトリクスコレクターを作成する。
    pub fn new(registry: Arc<Registry>) -> Result<Self, prometheus::Error> {
        Ok(Self {
            partitions_evaluated: register_counter_with_registry!(
                "clustering_partitions_evaluated_total",
                "Partitions whose cluster-count range was searched",
                registry
            )?,
            degenerate_selections: register_counter_with_registry!(
                "clustering_degenerate_selections_total",
                "Partitions assigned k=1 without evaluation",
                registry
            )?,
            metric_fallbacks: register_counter_with_registry!(
                "clustering_metric_fallbacks_total",
                "Partitions whose cluster count fell back because no metric was usable",
                registry
            )?,
            candidate_fit_failures: register_counter_with_registry!(
                "clustering_candidate_fit_failures_total",
                "Candidate cluster counts dropped because the fit failed",
                registry
            )?,
            models_trained: register_counter_with_registry!(
                "clustering_models_trained_total",
                "Partition models trained",
                registry
            )?,
            partitions_skipped: register_counter_with_registry!(
                "clustering_partitions_skipped_total",
                "Partitions dropped from a stage output",
                registry
            )?,
            records_labeled: register_counter_with_registry!(
                "clustering_records_labeled_total",
                "Original records that received a cluster label",
                registry
            )?,
            runs_completed: register_counter_with_registry!(
                "clustering_runs_completed_total",
                "Pipeline runs that finished",
                registry
            )?,
            runs_failed: register_counter_with_registry!(
                "clustering_runs_failed_total",
                "Pipeline runs aborted by a fatal error",
                registry
            )?,
            selection_duration: register_histogram_with_registry!(
                "clustering_selection_duration_seconds",
                "Duration of the cluster-count selection stage",
                registry
            )?,
            training_duration: register_histogram_with_registry!(
                "clustering_training_duration_seconds",
                "Duration of the model training stage",
                registry
            )?,
            assignment_duration: register_histogram_with_registry!(
                "clustering_assignment_duration_seconds",
                "Duration of the cluster assignment stage",
                registry
            )?,
            report_duration: register_histogram_with_registry!(
                "clustering_report_duration_seconds",
                "Duration of the quality report stage",
                registry
            )?,
            persist_duration: register_histogram_with_registry!(
                "clustering_persist_duration_seconds",
                "Duration of the persistence stage",
                registry
            )?,
            run_duration: register_histogram_with_registry!(
                "clustering_run_duration_seconds",
                "Duration of a whole pipeline run",
                registry
            )?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{Encoder, TextEncoder};

    #[test]
    fn registers_every_metric_once() {
        let registry = Arc::new(Registry::new());
        let metrics = Metrics::new(Arc::clone(&registry)).unwrap();
        metrics.models_trained.inc();
        metrics.selection_duration.observe(0.25);

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("clustering_models_trained_total 1"));
        assert!(text.contains("clustering_selection_duration_seconds_count 1"));
        assert!(text.contains("clustering_runs_failed_total 0"));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = Arc::new(Registry::new());
        Metrics::new(Arc::clone(&registry)).unwrap();
        assert!(Metrics::new(registry).is_err());
    }
}
