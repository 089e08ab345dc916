//! In-memory provider for tests and dry runs.

use super::{StorageError, StorageProvider, UploadOptions};
use crate::types::StorageObject;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct MemoryProvider {
    objects: Mutex<BTreeMap<String, (Vec<u8>, StorageObject)>>,
    failing_deletes: Mutex<HashSet<String>>,
    gets: AtomicUsize,
}

/// Fixed timestamp used by [`MemoryProvider::insert`].
pub fn epoch_plus(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an object stamped at a fixed time (1 000 000 s after epoch).
    pub fn insert(&self, key: &str, data: Vec<u8>) -> StorageObject {
        self.insert_at(key, data, epoch_plus(1_000_000))
    }

    pub fn insert_at(&self, key: &str, data: Vec<u8>, last_modified: DateTime<Utc>) -> StorageObject {
        let object = StorageObject {
            key: key.to_string(),
            size: data.len() as u64,
            last_modified,
            etag: None,
        };
        self.lock().insert(key.to_string(), (data, object.clone()));
        object
    }

    pub fn remove(&self, key: &str) {
        self.lock().remove(key);
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Make every `delete_file(key)` fail, to exercise rollback paths.
    pub fn fail_deletes_of(&self, key: &str) {
        if let Ok(mut failing) = self.failing_deletes.lock() {
            failing.insert(key.to_string());
        }
    }

    /// Number of `get_file` calls so far.
    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, (Vec<u8>, StorageObject)>> {
        self.objects.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl StorageProvider for MemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    fn get_file(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        Ok(self.lock().get(key).map(|(data, _)| data.clone()))
    }

    fn list_all_files(&self) -> Result<Vec<StorageObject>, StorageError> {
        Ok(self.lock().values().map(|(_, o)| o.clone()).collect())
    }

    fn generate_public_url(&self, key: &str) -> String {
        format!("memory://{}", super::encode_key(key))
    }

    fn upload_file(
        &self,
        key: &str,
        data: &[u8],
        _opts: &UploadOptions,
    ) -> Result<StorageObject, StorageError> {
        Ok(self.insert_at(key, data.to_vec(), Utc::now()))
    }

    fn delete_file(&self, key: &str) -> Result<(), StorageError> {
        let failing = self
            .failing_deletes
            .lock()
            .map(|f| f.contains(key))
            .unwrap_or(false);
        if failing {
            return Err(StorageError::Transport(format!("injected delete failure for {key}")));
        }
        self.lock().remove(key);
        Ok(())
    }
}
