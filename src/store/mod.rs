//! Reader/writer adapters between partitioned tables and files, plus the
//! content-addressed fit context store.

pub mod context;
pub mod reader;
pub mod writer;

use std::path::PathBuf;

use thiserror::Error;

use crate::table::TableError;

pub use context::{ContextStore, DirContextStore, MemoryContextStore};
pub use reader::{JsonReader, NdjsonReader, ReaderConfig, TableReader};
pub use writer::{JsonWriter, MemoryWriter, NdjsonWriter, OutputFormat, TableWriter};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("cannot write asset {asset}: {reason}")]
    Validation { asset: String, reason: String },
    #[error("no context stored under key {0}")]
    MissingContext(String),
    #[error(transparent)]
    Table(#[from] TableError),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        StoreError::Json {
            path: path.into(),
            source,
        }
    }
}
