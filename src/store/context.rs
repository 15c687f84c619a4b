use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use super::StoreError;
use crate::cluster::ContextBlob;

/// Durable home for fit contexts, addressed by [`ContextBlob::key`].
pub trait ContextStore: Send + Sync {
    fn put(&self, blob: &ContextBlob) -> Result<(), StoreError>;

    fn get(&self, key: &str) -> Result<ContextBlob, StoreError>;
}

/// Stores each blob as `<dir>/<key>.json`. Existing keys are not rewritten.
#[derive(Debug, Clone)]
pub struct DirContextStore {
    dir: PathBuf,
}

impl DirContextStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl ContextStore for DirContextStore {
    fn put(&self, blob: &ContextBlob) -> Result<(), StoreError> {
        let path = self.path_for(blob.key());
        if path.exists() {
            tracing::debug!(key = blob.key(), "context already stored");
            return Ok(());
        }
        fs::create_dir_all(&self.dir).map_err(|e| StoreError::io(&self.dir, e))?;
        fs::write(&path, blob.bytes()).map_err(|e| StoreError::io(&path, e))
    }

    fn get(&self, key: &str) -> Result<ContextBlob, StoreError> {
        let path = self.path_for(key);
        match fs::read(&path) {
            Ok(bytes) => Ok(ContextBlob::from_parts(key.to_string(), bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::MissingContext(key.to_string()))
            }
            Err(e) => Err(StoreError::io(path, e)),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryContextStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryContextStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ContextStore for MemoryContextStore {
    fn put(&self, blob: &ContextBlob) -> Result<(), StoreError> {
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(blob.key().to_string())
            .or_insert_with(|| blob.bytes().to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<ContextBlob, StoreError> {
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|bytes| ContextBlob::from_parts(key.to_string(), bytes.clone()))
            .ok_or_else(|| StoreError::MissingContext(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::FitContext;
    use crate::table::FeatureTable;

    fn blob() -> ContextBlob {
        let features =
            FeatureTable::from_rows(vec!["x".into()], &[vec![1.0], vec![2.0]]).unwrap();
        ContextBlob::encode(&FitContext::setup(&features, 42).unwrap()).unwrap()
    }

    #[test]
    fn dir_store_round_trips_and_restores() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirContextStore::new(dir.path().join("contexts"));
        let blob = blob();

        store.put(&blob).unwrap();
        store.put(&blob).unwrap();

        let loaded = store.get(blob.key()).unwrap();
        assert_eq!(loaded, blob);
        assert_eq!(loaded.restore().unwrap().means, vec![1.5]);
        assert_eq!(fs::read_dir(dir.path().join("contexts")).unwrap().count(), 1);
    }

    #[test]
    fn dir_store_reports_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirContextStore::new(dir.path());
        assert!(matches!(
            store.get("0000000000000000"),
            Err(StoreError::MissingContext(_))
        ));
    }

    #[test]
    fn memory_store_deduplicates_by_key() {
        let store = MemoryContextStore::new();
        store.put(&blob()).unwrap();
        store.put(&blob()).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(blob().key()).unwrap(), blob());
    }
}
