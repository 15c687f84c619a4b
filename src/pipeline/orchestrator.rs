//! Pipeline orchestrator and builder for the clustering pipeline.

use std::sync::Arc;

use chrono::Utc;
use prometheus::{Histogram, Registry};
use tracing::{error, info};

use crate::cluster::{ClusterExperiment, KMeansExperiment};
use crate::config::{JobConfig, PipelineConfig};
use crate::observability::metrics::Metrics;
use crate::store::{DirContextStore, TableWriter};
use crate::util::error::PipelineError;
use crate::util::partial_success::PartialSuccess;

use super::assign::{AssignStage, ContextAssignStage};
use super::persist::{PersistStage, SinkPersistStage};
use super::report::{QualityReportStage, ReportStage};
use super::select::{MetricSelectStage, SelectStage};
use super::train::{ExperimentTrainStage, TrainStage};
use super::{JobInput, RunArtifacts, RunContext, RunOutcome};

/// Directory under a job's output directory that holds fit contexts.
pub const CONTEXTS_DIR: &str = "contexts";

/// Core pipeline orchestrator that coordinates all stages.
pub struct PipelineOrchestrator {
    config: Arc<PipelineConfig>,
    stages: PipelineStages,
    metrics: Arc<Metrics>,
}

/// Container for all pipeline stages.
struct PipelineStages {
    select: Arc<dyn SelectStage>,
    train: Arc<dyn TrainStage>,
    assign: Arc<dyn AssignStage>,
    report: Arc<dyn ReportStage>,
    persist: Option<Arc<dyn PersistStage>>,
}

impl PipelineOrchestrator {
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Runs every stage for one job. Partition-level problems are recorded in
    /// the outcome; fatal errors abort the run before anything is persisted.
    pub fn execute(&self, job: &JobInput) -> Result<RunOutcome, PipelineError> {
        let run = RunContext::new(job.name.as_str());
        info!(
            run_id = %run.run_id,
            job = %run.job,
            partitions = job.features.len(),
            "pipeline run started"
        );

        let result = timed(&self.metrics.run_duration, || self.run_stages(&run, job));
        match result {
            Ok(outcome) => {
                self.metrics.runs_completed.inc();
                info!(
                    run_id = %run.run_id,
                    job = %run.job,
                    completed = outcome.partial_success.completed.len(),
                    skipped = outcome.partial_success.skipped.len(),
                    degradations = outcome.partial_success.degradations.len(),
                    is_complete = outcome.partial_success.is_complete(),
                    average_silhouette = ?outcome.average_silhouette(),
                    "pipeline run finished"
                );
                Ok(outcome)
            }
            Err(err) => {
                self.metrics.runs_failed.inc();
                error!(
                    run_id = %run.run_id,
                    job = %run.job,
                    error = %err,
                    kind = ?err.kind(),
                    "pipeline run aborted"
                );
                Err(err)
            }
        }
    }

    fn run_stages(&self, run: &RunContext, job: &JobInput) -> Result<RunOutcome, PipelineError> {
        let selection = timed(&self.metrics.selection_duration, || {
            self.stages.select.select(run, &job.features)
        })?;
        let training = timed(&self.metrics.training_duration, || {
            self.stages.train.train(run, &job.features, &selection.counts)
        })?;
        let assignment = timed(&self.metrics.assignment_duration, || {
            self.stages
                .assign
                .assign(run, &job.features, &training.models, &job.records)
        })?;
        let report = timed(&self.metrics.report_duration, || {
            self.stages
                .report
                .report(run, &training.models, &assignment.labeled)
        })?;

        let artifacts = RunArtifacts {
            selection,
            training,
            assignment,
            report,
        };

        let persisted = match &self.stages.persist {
            Some(stage) => Some(timed(&self.metrics.persist_duration, || {
                stage.persist(run, &artifacts)
            })?),
            None => None,
        };

        let partial_success = PartialSuccess::analyze(
            run.run_id,
            job.features.keys().chain(job.records.keys()),
            artifacts.report.summaries.keys(),
            artifacts.degradations().cloned().collect(),
        );

        Ok(RunOutcome {
            run: run.clone(),
            finished_at: Utc::now(),
            artifacts,
            partial_success,
            persisted,
        })
    }
}

fn timed<T>(histogram: &Histogram, f: impl FnOnce() -> T) -> T {
    let timer = histogram.start_timer();
    let out = f();
    timer.observe_duration();
    out
}

/// Builder pattern for constructing `PipelineOrchestrator`.
///
/// Stages that are not supplied fall back to the k-means backed defaults.
/// Persistence is only wired when a persist stage is given.
pub struct PipelineBuilder {
    config: Arc<PipelineConfig>,
    metrics: Option<Arc<Metrics>>,
    experiment: Option<Arc<dyn ClusterExperiment>>,
    select: Option<Arc<dyn SelectStage>>,
    train: Option<Arc<dyn TrainStage>>,
    assign: Option<Arc<dyn AssignStage>>,
    report: Option<Arc<dyn ReportStage>>,
    persist: Option<Arc<dyn PersistStage>>,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config: Arc::new(config),
            metrics: None,
            experiment: None,
            select: None,
            train: None,
            assign: None,
            report: None,
            persist: None,
        }
    }

    /// Wires persistence into the job's output directory.
    #[must_use]
    pub fn with_job_outputs(self, job: &JobConfig) -> Self {
        let writer: Arc<dyn TableWriter> = Arc::from(
            job.output_format
                .writer(job.output_dir.clone(), &job.partition_column),
        );
        let contexts = Arc::new(DirContextStore::new(job.output_dir.join(CONTEXTS_DIR)));
        self.with_persist_stage(Arc::new(SinkPersistStage::new(writer, contexts)))
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub fn with_experiment(mut self, experiment: Arc<dyn ClusterExperiment>) -> Self {
        self.experiment = Some(experiment);
        self
    }

    #[must_use]
    pub fn with_select_stage(mut self, stage: Arc<dyn SelectStage>) -> Self {
        self.select = Some(stage);
        self
    }

    #[must_use]
    pub fn with_train_stage(mut self, stage: Arc<dyn TrainStage>) -> Self {
        self.train = Some(stage);
        self
    }

    #[must_use]
    pub fn with_assign_stage(mut self, stage: Arc<dyn AssignStage>) -> Self {
        self.assign = Some(stage);
        self
    }

    #[must_use]
    pub fn with_report_stage(mut self, stage: Arc<dyn ReportStage>) -> Self {
        self.report = Some(stage);
        self
    }

    #[must_use]
    pub fn with_persist_stage(mut self, stage: Arc<dyn PersistStage>) -> Self {
        self.persist = Some(stage);
        self
    }

    pub fn build(self) -> Result<PipelineOrchestrator, PipelineError> {
        self.config.validate()?;

        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => Arc::new(Metrics::new(Arc::new(Registry::new()))?),
        };
        let config = self.config;
        let experiment = self
            .experiment
            .unwrap_or_else(|| Arc::new(KMeansExperiment::new(config.kmeans_settings())));

        let stages = PipelineStages {
            select: self.select.unwrap_or_else(|| {
                Arc::new(MetricSelectStage::new(
                    Arc::clone(&experiment),
                    config.min_clusters,
                    config.max_clusters,
                    config.metrics.clone(),
                    config.parallelism,
                    Arc::clone(&metrics),
                ))
            }),
            train: self.train.unwrap_or_else(|| {
                Arc::new(ExperimentTrainStage::new(
                    Arc::clone(&experiment),
                    config.parallelism,
                    Arc::clone(&metrics),
                ))
            }),
            assign: self.assign.unwrap_or_else(|| {
                Arc::new(ContextAssignStage::new(
                    Arc::clone(&experiment),
                    config.cluster_column.as_str(),
                    Arc::clone(&metrics),
                ))
            }),
            report: self
                .report
                .unwrap_or_else(|| Arc::new(QualityReportStage::new(config.cluster_column.as_str()))),
            persist: self.persist,
        };

        Ok(PipelineOrchestrator {
            config,
            stages,
            metrics,
        })
    }
}
