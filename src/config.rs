use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::cluster::{KMeansSettings, MetricName};
use crate::cluster::kmeans::ALGORITHM;
use crate::store::{OutputFormat, ReaderConfig};

#[cfg(test)]
use once_cell::sync::Lazy;
#[cfg(test)]
pub(crate) static ENV_MUTEX: Lazy<std::sync::Mutex<()>> = Lazy::new(|| std::sync::Mutex::new(()));

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("File error on {path}: {source}")]
    FileError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Parse error in {path}: {source}")]
    ParseError {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("Environment error: {0}")]
    EnvError(String),
    #[error("Unknown job: {0}")]
    UnknownJob(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Compact,
}

/// Command-line surface of the `clustering-pipeline` binary.
#[derive(Parser, Debug, Clone)]
#[command(name = "clustering-pipeline", version, about)]
pub struct Cli {
    /// YAML file with `job_params` and `jobs` sections
    #[arg(long, env = "CLUSTERING_CONFIG")]
    pub config: PathBuf,

    /// Job to run; repeat for several. Defaults to every job in the file.
    #[arg(long = "job")]
    pub jobs: Vec<String>,

    #[arg(long, env = "LOG_LEVEL", value_enum, default_value = "info")]
    pub log_level: LogLevel,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "json")]
    pub log_format: LogFormat,

    /// Write Prometheus text metrics here after the run
    #[arg(long, env = "CLUSTERING_METRICS_OUT")]
    pub metrics_out: Option<PathBuf>,
}

/// Options shared by every job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub min_clusters: usize,
    pub max_clusters: usize,
    /// Metrics the selector may use. Priority is fixed: silhouette, then
    /// Calinski-Harabasz, then Davies-Bouldin.
    #[serde(deserialize_with = "known_metrics")]
    pub metrics: Vec<MetricName>,
    pub algorithm: String,
    pub session_seed: u64,
    pub max_iterations: usize,
    pub n_init: usize,
    pub tolerance: f64,
    /// 1 keeps every stage sequential.
    pub parallelism: usize,
    pub cluster_column: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_clusters: 2,
            max_clusters: 10,
            metrics: MetricName::ALL.to_vec(),
            algorithm: ALGORITHM.to_string(),
            session_seed: 42,
            max_iterations: 300,
            n_init: 10,
            tolerance: 1e-4,
            parallelism: 1,
            cluster_column: "cluster".to_string(),
        }
    }
}

impl PipelineConfig {
    #[must_use]
    pub fn kmeans_settings(&self) -> KMeansSettings {
        KMeansSettings {
            seed: self.session_seed,
            max_iterations: self.max_iterations,
            n_init: self.n_init,
            tolerance: self.tolerance,
        }
    }

    /// Applies `CLUSTERING_*` environment overrides on top of file values.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        load_env_var("CLUSTERING_MIN_CLUSTERS", &mut self.min_clusters)?;
        load_env_var("CLUSTERING_MAX_CLUSTERS", &mut self.max_clusters)?;
        if let Ok(raw) = std::env::var("CLUSTERING_METRICS") {
            self.metrics = parse_metric_list(raw.split(','));
        }
        load_env_string("CLUSTERING_ALGORITHM", &mut self.algorithm);
        load_env_var("CLUSTERING_SESSION_SEED", &mut self.session_seed)?;
        load_env_var("CLUSTERING_MAX_ITERATIONS", &mut self.max_iterations)?;
        load_env_var("CLUSTERING_N_INIT", &mut self.n_init)?;
        load_env_var("CLUSTERING_TOLERANCE", &mut self.tolerance)?;
        load_env_var("CLUSTERING_PARALLELISM", &mut self.parallelism)?;
        load_env_string("CLUSTERING_CLUSTER_COLUMN", &mut self.cluster_column);
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_clusters < 2 {
            return Err(ConfigError::InvalidConfig(format!(
                "min_clusters must be at least 2, got {}",
                self.min_clusters
            )));
        }

        if self.max_clusters < self.min_clusters {
            return Err(ConfigError::InvalidConfig(format!(
                "max_clusters ({}) must be at least min_clusters ({})",
                self.max_clusters, self.min_clusters
            )));
        }

        if self.metrics.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "at least one recognised metric is required".to_string(),
            ));
        }

        if !self.algorithm.eq_ignore_ascii_case(ALGORITHM) {
            return Err(ConfigError::InvalidConfig(format!(
                "unsupported algorithm '{}'",
                self.algorithm
            )));
        }

        if self.max_iterations == 0 || self.n_init == 0 || self.parallelism == 0 {
            return Err(ConfigError::InvalidConfig(
                "max_iterations, n_init and parallelism must be greater than 0".to_string(),
            ));
        }

        if !(self.tolerance.is_finite() && self.tolerance >= 0.0) {
            return Err(ConfigError::InvalidConfig(format!(
                "tolerance must be a non-negative number, got {}",
                self.tolerance
            )));
        }

        if self.cluster_column.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "cluster_column must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

fn default_partition_column() -> String {
    "category".to_string()
}

/// IO wiring of one job (for example `internal` or `external`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    #[serde(default = "default_partition_column")]
    pub partition_column: String,
    /// Identifier columns carried in the feature source but not clustered on.
    #[serde(default)]
    pub id_columns: Vec<String>,
    /// Reduced, feature-engineered rows the models are fitted on.
    pub features: ReaderConfig,
    /// Original rows that receive the cluster label.
    pub records: ReaderConfig,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub output_format: OutputFormat,
}

impl JobConfig {
    fn resolve_against(&mut self, base: &Path) {
        self.features.resolve_against(base);
        self.records.resolve_against(base);
        if self.output_dir.is_relative() {
            self.output_dir = base.join(&self.output_dir);
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    job_params: PipelineConfig,
    #[serde(default)]
    jobs: BTreeMap<String, JobConfig>,
}

/// Fully loaded configuration: shared pipeline options plus named jobs.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub pipeline: PipelineConfig,
    pub jobs: BTreeMap<String, JobConfig>,
}

impl Config {
    /// Loads a YAML file, applies environment overrides and validates the result.
    /// Relative paths inside jobs are resolved against the file's directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::FileError {
            path: path.to_path_buf(),
            source,
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_yaml_str(&raw, base).map_err(|error| match error {
            ConfigError::ParseError { source, .. } => ConfigError::ParseError {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    pub fn from_yaml_str(raw: &str, base: &Path) -> Result<Self, ConfigError> {
        let file: ConfigFile =
            serde_yaml::from_str(raw).map_err(|source| ConfigError::ParseError {
                path: PathBuf::from("<inline>"),
                source,
            })?;

        let mut config = Self {
            pipeline: file.job_params,
            jobs: file.jobs,
        };
        config.post_process(base);
        config.pipeline.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn post_process(&mut self, base: &Path) {
        for job in self.jobs.values_mut() {
            job.resolve_against(base);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pipeline.validate()?;
        for (name, job) in &self.jobs {
            if job.partition_column.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(format!(
                    "job '{name}' has an empty partition_column"
                )));
            }
            if job.partition_column == self.pipeline.cluster_column {
                return Err(ConfigError::InvalidConfig(format!(
                    "job '{name}' uses '{}' both as partition and cluster column",
                    job.partition_column
                )));
            }
        }
        Ok(())
    }

    /// Jobs named on the command line, or every job when none were named.
    pub fn selected_jobs<'a>(
        &'a self,
        names: &[String],
    ) -> Result<Vec<(&'a str, &'a JobConfig)>, ConfigError> {
        if names.is_empty() {
            return Ok(self
                .jobs
                .iter()
                .map(|(name, job)| (name.as_str(), job))
                .collect());
        }
        names
            .iter()
            .map(|name| {
                self.jobs
                    .get_key_value(name)
                    .map(|(name, job)| (name.as_str(), job))
                    .ok_or_else(|| ConfigError::UnknownJob(name.clone()))
            })
            .collect()
    }
}

/// Drops names that are not recognised metrics, logging each one.
fn parse_metric_list<'a>(names: impl IntoIterator<Item = &'a str>) -> Vec<MetricName> {
    let mut metrics = Vec::new();
    for name in names {
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        match name.parse::<MetricName>() {
            Ok(metric) if !metrics.contains(&metric) => metrics.push(metric),
            Ok(_) => {}
            Err(error) => tracing::warn!(metric = name, %error, "ignoring unrecognised metric"),
        }
    }
    metrics
}

fn known_metrics<'de, D>(deserializer: D) -> Result<Vec<MetricName>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<String>::deserialize(deserializer)?;
    Ok(parse_metric_list(raw.iter().map(String::as_str)))
}

/// Helper function to load and parse an environment variable.
/// Returns Ok(()) if the variable doesn't exist (keeps default).
fn load_env_var<T>(name: &str, target: &mut T) -> Result<(), ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    if let Ok(value) = std::env::var(name) {
        *target = value
            .trim()
            .parse()
            .map_err(|e| ConfigError::EnvError(format!("Invalid {name}: {e}")))?;
    }
    Ok(())
}

/// Helper function to load a string environment variable.
fn load_env_string(name: &str, target: &mut String) {
    if let Ok(value) = std::env::var(name) {
        *target = value;
    }
}
