/// パイプラインのエラー分類。
use thiserror::Error;

use crate::cluster::ClusterError;
use crate::config::ConfigError;
use crate::store::StoreError;
use crate::table::TableError;

/// エラーの影響範囲。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// パーティション単位で処理を打ち切る（ラン全体は継続）
    PartitionScoped,
    /// ラン全体を中断する（データの欠落や誤ラベルにつながる）
    Fatal,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("partition {partition}: {required} rows required, {available} available")]
    InsufficientData {
        partition: String,
        required: usize,
        available: usize,
    },
    #[error("partition {partition}: schema mismatch: {detail}")]
    SchemaMismatch { partition: String, detail: String },
    #[error("partition {partition}: {labels} labels for {records} records")]
    RowCountMismatch {
        partition: String,
        labels: usize,
        records: usize,
    },
    #[error("partition {partition}: fit failed for k={k}")]
    FitFailure {
        partition: String,
        k: usize,
        #[source]
        source: ClusterError,
    },
    #[error("partition {partition}: metric extraction failed")]
    MetricExtraction {
        partition: String,
        #[source]
        source: ClusterError,
    },
    #[error("partition {partition}: {source}")]
    Cluster {
        partition: String,
        #[source]
        source: ClusterError,
    },
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("metrics registration failed")]
    Metrics(#[from] prometheus::Error),
}

impl PipelineError {
    /// エラーがパーティション単位か、ラン全体を止めるべきかを判定する。
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::InsufficientData { .. }
            | PipelineError::RowCountMismatch { .. }
            | PipelineError::FitFailure { .. }
            | PipelineError::MetricExtraction { .. } => ErrorKind::PartitionScoped,
            PipelineError::SchemaMismatch { .. }
            | PipelineError::Cluster { .. }
            | PipelineError::Table(_)
            | PipelineError::Store(_)
            | PipelineError::Config(_)
            | PipelineError::Metrics(_) => ErrorKind::Fatal,
        }
    }

    /// エラーが致命的かどうか。
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Fatal)
    }
}
