/// Tests for the shipped development configuration and the CLI surface.
use std::path::{Path, PathBuf};

use clap::Parser;
use clustering_pipeline::config::{Cli, LogFormat, LogLevel};
use clustering_pipeline::store::OutputFormat;
use clustering_pipeline::{Config, JobInput};

const CLUSTERING_VARS: [&str; 10] = [
    "CLUSTERING_MIN_CLUSTERS",
    "CLUSTERING_MAX_CLUSTERS",
    "CLUSTERING_METRICS",
    "CLUSTERING_ALGORITHM",
    "CLUSTERING_SESSION_SEED",
    "CLUSTERING_MAX_ITERATIONS",
    "CLUSTERING_N_INIT",
    "CLUSTERING_TOLERANCE",
    "CLUSTERING_PARALLELISM",
    "CLUSTERING_CLUSTER_COLUMN",
];

fn dev_config_path() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("config").join("dev.yaml")
}

fn load_dev_config() -> Config {
    let unset: Vec<(&str, Option<&str>)> = CLUSTERING_VARS.iter().map(|v| (*v, None)).collect();
    temp_env::with_vars(unset, || Config::load(&dev_config_path())).unwrap()
}

#[test]
fn dev_config_loads_both_jobs() {
    let config = load_dev_config();

    assert_eq!(config.pipeline.parallelism, 4);
    assert_eq!(config.jobs.keys().collect::<Vec<_>>(), vec!["external", "internal"]);

    let internal = &config.jobs["internal"];
    assert_eq!(internal.output_format, OutputFormat::Ndjson);
    assert!(internal.features.path().is_absolute());
    assert!(internal.features.path().ends_with("data/internal/features.ndjson"));
    assert_eq!(config.jobs["external"].output_format, OutputFormat::Json);
}

#[test]
fn dev_config_inputs_are_readable() {
    let config = load_dev_config();

    let internal = JobInput::load("internal", &config.jobs["internal"]).unwrap();
    assert_eq!(
        internal.features.keys().collect::<Vec<_>>(),
        vec!["drinks", "frozen", "snacks"]
    );
    assert_eq!(internal.features["snacks"].n_samples(), 15);
    assert_eq!(internal.features["snacks"].n_features(), 2);
    assert_eq!(internal.records["snacks"].row_count(), 15);

    let external = JobInput::load("external", &config.jobs["external"]).unwrap();
    assert_eq!(external.features["household"].n_samples(), 2);
}

#[test]
fn env_override_applies_to_file_config() {
    let mut vars: Vec<(&str, Option<&str>)> = CLUSTERING_VARS.iter().map(|v| (*v, None)).collect();
    vars.retain(|(name, _)| *name != "CLUSTERING_MAX_CLUSTERS");
    vars.push(("CLUSTERING_MAX_CLUSTERS", Some("4")));

    let config = temp_env::with_vars(vars, || Config::load(&dev_config_path())).unwrap();

    assert_eq!(config.pipeline.max_clusters, 4);
}

#[test]
fn cli_reads_defaults_and_environment() {
    let cli = temp_env::with_vars(
        [
            ("CLUSTERING_CONFIG", Some("/etc/clustering/prod.yaml")),
            ("LOG_LEVEL", None),
            ("LOG_FORMAT", None),
            ("CLUSTERING_METRICS_OUT", Some("/tmp/metrics.prom")),
        ],
        || Cli::try_parse_from(["clustering-pipeline"]),
    )
    .unwrap();

    assert_eq!(cli.config, PathBuf::from("/etc/clustering/prod.yaml"));
    assert!(cli.jobs.is_empty());
    assert_eq!(cli.log_level, LogLevel::Info);
    assert_eq!(cli.log_format, LogFormat::Json);
    assert_eq!(cli.metrics_out, Some(PathBuf::from("/tmp/metrics.prom")));
}

#[test]
fn cli_requires_a_config_path() {
    let result = temp_env::with_var_unset("CLUSTERING_CONFIG", || {
        Cli::try_parse_from(["clustering-pipeline", "--job", "internal"])
    });
    assert!(result.is_err());
}
