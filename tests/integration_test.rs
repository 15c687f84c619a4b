use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use clustering_pipeline::cluster::MetricName;
use clustering_pipeline::observability::Telemetry;
use clustering_pipeline::pipeline::select::SelectionBasis;
use clustering_pipeline::store::{ContextStore, DirContextStore, JsonReader, TableReader};
use clustering_pipeline::util::partial_success::DegradationKind;
use clustering_pipeline::{Config, JobInput, PipelineBuilder};
use prometheus::Registry;
use serde_json::{Value, json};

const CENTERS: [(f64, f64); 3] = [(0.0, 0.0), (10.0, 10.0), (20.0, 0.0)];
const OFFSETS: [(f64, f64); 5] = [(0.0, 0.0), (0.3, 0.1), (-0.2, 0.2), (0.1, -0.3), (-0.1, -0.1)];

fn write_json(path: &Path, rows: &[Value]) {
    fs::write(path, serde_json::to_vec_pretty(rows).unwrap()).unwrap();
}

/// Three tight blobs of five snack stores plus a single drinks store.
fn write_inputs(dir: &Path) {
    let mut features = Vec::new();
    let mut records = Vec::new();
    let mut store = 0;
    for (cx, cy) in CENTERS {
        for (dx, dy) in OFFSETS {
            store += 1;
            features.push(json!({
                "category": "snacks",
                "STORE_NBR": store,
                "units": cx + dx,
                "margin": cy + dy,
            }));
            records.push(json!({
                "category": "snacks",
                "STORE_NBR": store,
                "city": format!("city-{store}"),
                "sales": (cx + dx) * 100.0,
            }));
        }
    }
    features.push(json!({"category": "drinks", "STORE_NBR": 99, "units": 3.0, "margin": 1.0}));
    records.push(json!({"category": "drinks", "STORE_NBR": 99, "city": "solo", "sales": 300.0}));

    write_json(&dir.join("features.json"), &features);
    write_json(&dir.join("records.json"), &records);
}

fn config(dir: &Path) -> Config {
    let yaml = r"
job_params:
  min_clusters: 2
  max_clusters: 10
  metrics: [silhouette, calinski_harabasz, davies_bouldin]
  session_seed: 7
jobs:
  internal:
    partition_column: category
    id_columns: [STORE_NBR]
    features: {format: json, path: features.json}
    records: {format: json, path: records.json}
    output_dir: out
";
    Config::from_yaml_str(yaml, dir).unwrap()
}

#[test]
fn clusters_snacks_and_skips_single_store_partition() {
    let dir = tempfile::tempdir().unwrap();
    write_inputs(dir.path());
    let config = config(dir.path());
    let job = &config.jobs["internal"];
    let telemetry = Telemetry::with_registry(Arc::new(Registry::new())).unwrap();

    let input = JobInput::load("internal", job).unwrap();
    assert_eq!(input.features["snacks"].columns(), &["units".to_string(), "margin".to_string()]);

    let outcome = PipelineBuilder::new(config.pipeline.clone())
        .with_metrics(telemetry.metrics())
        .with_job_outputs(job)
        .build()
        .unwrap()
        .execute(&input)
        .unwrap();

    // selection
    let selection = &outcome.artifacts.selection;
    assert_eq!(selection.counts["snacks"], 3);
    assert_eq!(selection.reports["snacks"].basis, SelectionBasis::Metric(MetricName::Silhouette));
    assert_eq!(selection.reports["snacks"].candidates.len(), 9);
    assert_eq!(selection.counts["drinks"], 1);
    assert_eq!(selection.reports["drinks"].basis, SelectionBasis::TooFewSamples);

    // training and assignment
    assert_eq!(outcome.artifacts.training.models.len(), 1);
    let labeled = &outcome.artifacts.assignment.labeled["snacks"];
    assert_eq!(labeled.row_count(), 15);
    let labels: Vec<i64> = labeled
        .column("cluster")
        .unwrap()
        .iter()
        .map(|cell| cell.as_i64().unwrap())
        .collect();
    for blob in labels.chunks(5) {
        assert!(blob.iter().all(|label| *label == blob[0]), "blob split: {labels:?}");
    }
    assert_eq!(labels.iter().collect::<BTreeSet<_>>().len(), 3);
    assert!(!outcome.artifacts.assignment.labeled.contains_key("drinks"));

    // report
    let summary = &outcome.artifacts.report.summaries["snacks"];
    assert_eq!(summary.num_clusters, 3);
    assert_eq!(summary.populated_clusters, summary.cluster_distribution.len());
    assert_eq!(summary.cluster_distribution.values().copied().collect::<Vec<_>>(), vec![5, 5, 5]);
    assert!(summary.silhouette.unwrap() > 0.9);
    assert_eq!(outcome.average_silhouette(), summary.silhouette);

    // partial success
    assert_eq!(outcome.partial_success.completed, vec!["snacks"]);
    assert_eq!(outcome.partial_success.skipped, vec!["drinks"]);
    let drinks: Vec<_> = outcome
        .partial_success
        .for_partition("drinks")
        .map(|d| d.kind.clone())
        .collect();
    assert!(drinks.contains(&DegradationKind::TooFewSamples));
    assert!(drinks.contains(&DegradationKind::TrainingSkipped));

    // persisted assets
    let out = dir.path().join("out");
    let assignments = JsonReader::new(out.join("assignments.json"), None)
        .read_partitions("category")
        .unwrap();
    assert_eq!(assignments.keys().collect::<Vec<_>>(), vec!["snacks"]);
    assert_eq!(assignments["snacks"].row_count(), 15);
    assert!(assignments["snacks"].column_index("city").is_some());

    let models = JsonReader::new(out.join("models.json"), None).read().unwrap();
    assert_eq!(models.row_count(), 1);
    let key = models.column("context_key").unwrap()[0].to_string();
    let context = DirContextStore::new(out.join("contexts"))
        .get(&key)
        .unwrap()
        .restore()
        .unwrap();
    assert_eq!(context.columns, vec!["units", "margin"]);

    let quality = JsonReader::new(out.join("quality.json"), None).read().unwrap();
    assert_eq!(quality.row_count(), 1);
    assert!(out.join("selection.json").exists());
    assert!(out.join("degradations.json").exists());

    let metrics = telemetry.render_prometheus();
    assert!(metrics.contains("clustering_records_labeled_total 15"));
    assert!(metrics.contains("clustering_runs_completed_total 1"));
}

#[test]
fn rerun_reproduces_labels() {
    let dir = tempfile::tempdir().unwrap();
    write_inputs(dir.path());
    let config = config(dir.path());
    let job = &config.jobs["internal"];
    let input = JobInput::load("internal", job).unwrap();

    let run = || {
        PipelineBuilder::new(config.pipeline.clone())
            .build()
            .unwrap()
            .execute(&input)
            .unwrap()
    };
    let first = run();
    let second = run();

    assert_eq!(
        first.artifacts.assignment.labeled,
        second.artifacts.assignment.labeled
    );
    assert_eq!(first.cluster_counts(), second.cluster_counts());
    assert_ne!(first.run.run_id, second.run.run_id);
}

#[test]
fn all_partitions_too_small_still_writes_model_metadata() {
    let dir = tempfile::tempdir().unwrap();
    write_json(
        &dir.path().join("features.json"),
        &[json!({"category": "drinks", "STORE_NBR": 1, "units": 1.0, "margin": 2.0})],
    );
    write_json(
        &dir.path().join("records.json"),
        &[json!({"category": "drinks", "STORE_NBR": 1, "city": "solo", "sales": 1.0})],
    );
    let config = config(dir.path());
    let job = &config.jobs["internal"];

    let outcome = PipelineBuilder::new(config.pipeline.clone())
        .with_job_outputs(job)
        .build()
        .unwrap()
        .execute(&JobInput::load("internal", job).unwrap())
        .unwrap();

    let persisted = outcome.persisted.as_ref().unwrap();
    assert_eq!(persisted.models_stored, 0);
    assert!(!persisted.assets_written.contains(&"assignments".to_string()));
    let out = dir.path().join("out");
    assert!(out.join("models.json").exists());
    assert!(!out.join("assignments.json").exists());
    assert_eq!(outcome.average_silhouette(), None);
}
