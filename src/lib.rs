#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::module_name_repetitions,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

pub mod cluster;
pub mod config;
pub mod observability;
pub mod pipeline;
pub mod store;
pub mod table;
pub mod util;

pub use config::{Config, PipelineConfig};
pub use pipeline::{JobInput, PipelineBuilder, PipelineOrchestrator, RunOutcome};
