use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::StoreError;
use crate::table::{PartitionedRecords, RecordTable, split_partitions};

/// Source of a single table of records.
pub trait TableReader: Send + Sync {
    fn read(&self) -> Result<RecordTable, StoreError>;

    /// Reads the table and splits it by `key_column`.
    fn read_partitions(&self, key_column: &str) -> Result<PartitionedRecords, StoreError> {
        let table = self.read()?;
        Ok(split_partitions(&table, key_column)?)
    }
}

/// A JSON document holding an array of row objects.
#[derive(Debug, Clone)]
pub struct JsonReader {
    path: PathBuf,
    limit: Option<usize>,
}

impl JsonReader {
    pub fn new(path: impl Into<PathBuf>, limit: Option<usize>) -> Self {
        Self {
            path: path.into(),
            limit,
        }
    }
}

impl TableReader for JsonReader {
    fn read(&self) -> Result<RecordTable, StoreError> {
        let file = File::open(&self.path).map_err(|e| StoreError::io(&self.path, e))?;
        let mut rows: Vec<Value> = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| StoreError::json(&self.path, e))?;
        if let Some(limit) = self.limit {
            rows.truncate(limit);
        }
        tracing::debug!(path = %self.path.display(), rows = rows.len(), "json table read");
        Ok(RecordTable::from_json_rows(rows)?)
    }
}

/// Newline-delimited JSON, one row object per line. Blank lines are skipped.
#[derive(Debug, Clone)]
pub struct NdjsonReader {
    path: PathBuf,
    limit: Option<usize>,
}

impl NdjsonReader {
    pub fn new(path: impl Into<PathBuf>, limit: Option<usize>) -> Self {
        Self {
            path: path.into(),
            limit,
        }
    }
}

impl TableReader for NdjsonReader {
    fn read(&self) -> Result<RecordTable, StoreError> {
        let file = File::open(&self.path).map_err(|e| StoreError::io(&self.path, e))?;
        let mut rows = Vec::new();
        for line in BufReader::new(file).lines() {
            if self.limit.is_some_and(|limit| rows.len() >= limit) {
                break;
            }
            let line = line.map_err(|e| StoreError::io(&self.path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            let row: Value =
                serde_json::from_str(&line).map_err(|e| StoreError::json(&self.path, e))?;
            rows.push(row);
        }
        tracing::debug!(path = %self.path.display(), rows = rows.len(), "ndjson table read");
        Ok(RecordTable::from_json_rows(rows)?)
    }
}

/// Reader selection as it appears in job configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "lowercase")]
pub enum ReaderConfig {
    Json {
        path: PathBuf,
        #[serde(default)]
        limit: Option<usize>,
    },
    Ndjson {
        path: PathBuf,
        #[serde(default)]
        limit: Option<usize>,
    },
}

impl ReaderConfig {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            ReaderConfig::Json { path, .. } | ReaderConfig::Ndjson { path, .. } => path,
        }
    }

    /// Anchors a relative path at `base`.
    pub fn resolve_against(&mut self, base: &Path) {
        let (ReaderConfig::Json { path, .. } | ReaderConfig::Ndjson { path, .. }) = self;
        if path.is_relative() {
            *path = base.join(&*path);
        }
    }

    #[must_use]
    pub fn build(&self) -> Box<dyn TableReader> {
        match self {
            ReaderConfig::Json { path, limit } => Box::new(JsonReader::new(path.clone(), *limit)),
            ReaderConfig::Ndjson { path, limit } => {
                Box::new(NdjsonReader::new(path.clone(), *limit))
            }
        }
    }
}
