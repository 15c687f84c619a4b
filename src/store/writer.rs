use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use super::StoreError;
use crate::table::{PartitionedRecords, RecordTable, flatten_partitions};

/// Sink for one named asset made of partitioned tables.
///
/// [`TableWriter::write`] runs the fixed sequence validate → prepare →
/// pre-process → write. Implementations override the steps they care about;
/// the default pre-processing flattens the partitions into one table keyed by
/// [`TableWriter::key_column`].
pub trait TableWriter: Send + Sync {
    fn key_column(&self) -> &str;

    fn validate(&self, asset: &str, partitions: &PartitionedRecords) -> Result<(), StoreError> {
        if asset.is_empty() || asset.contains(['/', '\\']) || asset.starts_with('.') {
            return Err(StoreError::Validation {
                asset: asset.to_string(),
                reason: "asset names must be plain file stems".to_string(),
            });
        }
        if let Some(blank) = partitions.keys().find(|key| key.trim().is_empty()) {
            return Err(StoreError::Validation {
                asset: asset.to_string(),
                reason: format!("blank partition key {blank:?}"),
            });
        }
        Ok(())
    }

    fn prepare(&self, _asset: &str) -> Result<(), StoreError> {
        Ok(())
    }

    fn pre_process(&self, partitions: &PartitionedRecords) -> Result<RecordTable, StoreError> {
        Ok(flatten_partitions(partitions, self.key_column())?)
    }

    fn write_to_destination(&self, asset: &str, table: &RecordTable) -> Result<(), StoreError>;

    fn write(&self, asset: &str, partitions: &PartitionedRecords) -> Result<(), StoreError> {
        self.validate(asset, partitions)?;
        self.prepare(asset)?;
        let table = self.pre_process(partitions)?;
        self.write_to_destination(asset, &table)?;
        tracing::info!(
            asset,
            partitions = partitions.len(),
            rows = table.row_count(),
            "asset written"
        );
        Ok(())
    }
}

/// Output format selected in job configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Json,
    Ndjson,
}

impl OutputFormat {
    #[must_use]
    pub fn writer(self, dir: impl Into<PathBuf>, key_column: &str) -> Box<dyn TableWriter> {
        match self {
            OutputFormat::Json => Box::new(JsonWriter::new(dir, key_column)),
            OutputFormat::Ndjson => Box::new(NdjsonWriter::new(dir, key_column)),
        }
    }
}

fn create_dir(dir: &Path) -> Result<(), StoreError> {
    fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))
}

/// Writes through a sibling temporary file and renames it into place, so readers
/// never observe a half-written asset.
fn write_atomically(
    path: &Path,
    body: impl FnOnce(&mut BufWriter<File>) -> Result<(), StoreError>,
) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    let file = File::create(&tmp).map_err(|e| StoreError::io(&tmp, e))?;
    let result = fill_and_rename(file, &tmp, path, body);
    if result.is_err() {
        fs::remove_file(&tmp).unwrap_or_else(|e| {
            tracing::warn!(path = %tmp.display(), error = %e, "failed to remove temporary asset file");
        });
    }
    result
}

fn fill_and_rename(
    file: File,
    tmp: &Path,
    path: &Path,
    body: impl FnOnce(&mut BufWriter<File>) -> Result<(), StoreError>,
) -> Result<(), StoreError> {
    let mut out = BufWriter::new(file);
    body(&mut out)?;
    out.flush().map_err(|e| StoreError::io(tmp, e))?;
    drop(out);
    fs::rename(tmp, path).map_err(|e| StoreError::io(path, e))
}

/// One JSON array of row objects per asset: `<dir>/<asset>.json`.
#[derive(Debug, Clone)]
pub struct JsonWriter {
    dir: PathBuf,
    key_column: String,
}

impl JsonWriter {
    pub fn new(dir: impl Into<PathBuf>, key_column: &str) -> Self {
        Self {
            dir: dir.into(),
            key_column: key_column.to_string(),
        }
    }

    #[must_use]
    pub fn path_for(&self, asset: &str) -> PathBuf {
        self.dir.join(format!("{asset}.json"))
    }
}

impl TableWriter for JsonWriter {
    fn key_column(&self) -> &str {
        &self.key_column
    }

    fn prepare(&self, _asset: &str) -> Result<(), StoreError> {
        create_dir(&self.dir)
    }

    fn write_to_destination(&self, asset: &str, table: &RecordTable) -> Result<(), StoreError> {
        let path = self.path_for(asset);
        write_atomically(&path, |out| {
            serde_json::to_writer_pretty(&mut *out, &table.to_json_rows())
                .map_err(|e| StoreError::json(&path, e))?;
            out.write_all(b"\n").map_err(|e| StoreError::io(&path, e))
        })
    }
}

/// One row object per line: `<dir>/<asset>.ndjson`.
#[derive(Debug, Clone)]
pub struct NdjsonWriter {
    dir: PathBuf,
    key_column: String,
}

impl NdjsonWriter {
    pub fn new(dir: impl Into<PathBuf>, key_column: &str) -> Self {
        Self {
            dir: dir.into(),
            key_column: key_column.to_string(),
        }
    }

    #[must_use]
    pub fn path_for(&self, asset: &str) -> PathBuf {
        self.dir.join(format!("{asset}.ndjson"))
    }
}

impl TableWriter for NdjsonWriter {
    fn key_column(&self) -> &str {
        &self.key_column
    }

    fn prepare(&self, _asset: &str) -> Result<(), StoreError> {
        create_dir(&self.dir)
    }

    fn write_to_destination(&self, asset: &str, table: &RecordTable) -> Result<(), StoreError> {
        let path = self.path_for(asset);
        write_atomically(&path, |out| {
            for row in table.to_json_rows() {
                serde_json::to_writer(&mut *out, &row).map_err(|e| StoreError::json(&path, e))?;
                out.write_all(b"\n").map_err(|e| StoreError::io(&path, e))?;
            }
            Ok(())
        })
    }
}

/// Keeps written assets in memory.
#[derive(Debug, Default)]
pub struct MemoryWriter {
    key_column: String,
    assets: Mutex<BTreeMap<String, RecordTable>>,
}

impl MemoryWriter {
    #[must_use]
    pub fn new(key_column: &str) -> Self {
        Self {
            key_column: key_column.to_string(),
            assets: Mutex::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn asset(&self, name: &str) -> Option<RecordTable> {
        self.assets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    #[must_use]
    pub fn asset_names(&self) -> Vec<String> {
        self.assets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

impl TableWriter for MemoryWriter {
    fn key_column(&self) -> &str {
        &self.key_column
    }

    fn write_to_destination(&self, asset: &str, table: &RecordTable) -> Result<(), StoreError> {
        self.assets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(asset.to_string(), table.clone());
        Ok(())
    }
}
