pub mod metrics;
pub mod tracing;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use prometheus::{Encoder, Registry, TextEncoder};

use self::metrics::Metrics;
use crate::config::{LogFormat, LogLevel};

/// Telemetry（メトリクスとトレーシング）を管理する構造体。
#[derive(Debug, Clone)]
pub struct Telemetry {
    registry: Arc<Registry>,
    metrics: Arc<Metrics>,
}

impl Telemetry {
    /// トレーシングを初期化し、専用レジストリにメトリクスを登録する。
    pub fn new(level: LogLevel, format: LogFormat) -> Result<Self> {
        tracing::init(level, format)?;
        Self::with_registry(Arc::new(Registry::new()))
    }

    /// トレーシングには触れずにメトリクスだけを用意する。
    pub fn with_registry(registry: Arc<Registry>) -> Result<Self> {
        let metrics = Arc::new(Metrics::new(Arc::clone(&registry))?);
        Ok(Self { registry, metrics })
    }

    /// メトリクスへのアクセスを提供する。
    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// Prometheusメトリクスをレンダリングする。
    pub fn render_prometheus(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).ok();
        String::from_utf8(buffer).unwrap_or_default()
    }

    /// レンダリング結果をファイルに書き出す。
    pub fn write_prometheus(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::write(path, self.render_prometheus())
            .with_context(|| format!("failed to write metrics to {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_only_its_own_registry() {
        let telemetry = Telemetry::with_registry(Arc::new(Registry::new())).unwrap();
        telemetry.metrics().records_labeled.inc_by(15.0);

        let text = telemetry.render_prometheus();
        assert!(text.contains("clustering_records_labeled_total 15"));
    }

    #[test]
    fn writes_metrics_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("metrics.prom");
        let telemetry = Telemetry::with_registry(Arc::new(Registry::new())).unwrap();

        telemetry.write_prometheus(&path).unwrap();

        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.contains("clustering_models_trained_total"));
    }
}
