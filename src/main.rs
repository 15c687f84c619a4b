use std::fs;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use clustering_pipeline::{
    Config, JobInput, PipelineBuilder,
    config::Cli,
    observability::Telemetry,
};

const RUN_SUMMARY_FILE: &str = "run_summary.json";

fn main() -> anyhow::Result<()> {
    std::panic::set_hook(Box::new(|panic_info| {
        let thread = std::thread::current();
        let thread_name = thread.name().unwrap_or("unnamed");
        let message = panic_info
            .payload()
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| {
                panic_info
                    .payload()
                    .downcast_ref::<String>()
                    .map(String::as_str)
            })
            .unwrap_or("unknown panic payload");

        match panic_info.location() {
            Some(location) => error!(
                thread = thread_name,
                file = location.file(),
                line = location.line(),
                message,
                "panic occurred"
            ),
            None => error!(thread = thread_name, message, "panic occurred without location information"),
        }
    }));

    let cli = Cli::parse();
    let telemetry =
        Telemetry::new(cli.log_level, cli.log_format).context("failed to initialise telemetry")?;
    let config = Config::load(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;
    let jobs = config.selected_jobs(&cli.jobs)?;
    if jobs.is_empty() {
        warn!(config = %cli.config.display(), "no jobs configured");
    }

    for (name, job) in jobs {
        info!(job = name, output_dir = %job.output_dir.display(), "running job");

        let input = JobInput::load(name, job).with_context(|| format!("failed to load input for job '{name}'"))?;
        let orchestrator = PipelineBuilder::new(config.pipeline.clone())
            .with_metrics(telemetry.metrics())
            .with_job_outputs(job)
            .build()
            .with_context(|| format!("failed to build pipeline for job '{name}'"))?;
        let outcome = orchestrator
            .execute(&input)
            .with_context(|| format!("job '{name}' aborted"))?;

        let summary = serde_json::to_string_pretty(&outcome.summary())?;
        let summary_path = job.output_dir.join(RUN_SUMMARY_FILE);
        fs::write(&summary_path, format!("{summary}\n"))
            .with_context(|| format!("failed to write {}", summary_path.display()))?;
        println!("{summary}");
    }

    if let Some(path) = &cli.metrics_out {
        telemetry.write_prometheus(path)?;
        info!(path = %path.display(), "metrics written");
    }

    Ok(())
}
