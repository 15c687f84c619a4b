/// クラスタ数選定と k-means 学習のベンチマーク。
use std::sync::Arc;

use clustering_pipeline::cluster::kmeans::KMeans;
use clustering_pipeline::cluster::{KMeansExperiment, KMeansSettings, MetricName};
use clustering_pipeline::observability::metrics::Metrics;
use clustering_pipeline::pipeline::RunContext;
use clustering_pipeline::pipeline::select::{MetricSelectStage, SelectStage};
use clustering_pipeline::table::{FeatureTable, PartitionedFeatures};
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use prometheus::Registry;

/// `blobs` 個の塊に `rows` 行を配った決定的な合成データ。
fn synthetic_features(rows: usize, blobs: usize) -> FeatureTable {
    let values: Vec<Vec<f64>> = (0..rows)
        .map(|i| {
            let blob = (i % blobs) as f64;
            let jitter = (i as f64 * 0.618).sin() * 0.4;
            vec![blob * 10.0 + jitter, blob * 5.0 - jitter, (i as f64 * 0.37).cos()]
        })
        .collect();
    FeatureTable::from_rows(
        vec!["units".into(), "margin".into(), "visits".into()],
        &values,
    )
    .unwrap()
}

fn bench_kmeans_fit(c: &mut Criterion) {
    let features = synthetic_features(500, 4);
    let settings = KMeansSettings::default();

    c.bench_function("kmeans_fit_500x3_k4", |b| {
        b.iter(|| {
            let fitted = KMeans::fit(features.values(), 4, &settings).unwrap();
            black_box(fitted.inertia);
        });
    });
}

fn bench_selection(c: &mut Criterion) {
    let partitions: PartitionedFeatures = (0..8)
        .map(|p| (format!("category-{p}"), synthetic_features(120, 3 + p % 3)))
        .collect();
    let settings = KMeansSettings {
        n_init: 3,
        ..KMeansSettings::default()
    };
    let run = RunContext::new("bench");

    for parallelism in [1, 4] {
        let metrics = Arc::new(Metrics::new(Arc::new(Registry::new())).unwrap());
        let stage = MetricSelectStage::new(
            Arc::new(KMeansExperiment::new(settings.clone())),
            2,
            8,
            MetricName::ALL.to_vec(),
            parallelism,
            metrics,
        );
        c.bench_function(&format!("select_8_partitions_p{parallelism}"), |b| {
            b.iter(|| {
                let output = stage.select(&run, &partitions).unwrap();
                black_box(output.counts.len());
            });
        });
    }
}

criterion_group!(benches, bench_kmeans_fit, bench_selection);
criterion_main!(benches);
