//! Directory tree on the local filesystem.

use super::{StorageError, StorageProvider, UploadOptions, encode_key, parse_options};
use crate::config::StorageConfig;
use crate::naming;
use crate::types::StorageObject;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalConfig {
    pub root: PathBuf,
    /// Prefix for public URLs. Defaults to `file://` paths.
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug)]
pub struct LocalProvider {
    root: PathBuf,
    base_url: Option<String>,
}

impl LocalProvider {
    pub fn new(root: impl Into<PathBuf>, base_url: Option<String>) -> Self {
        Self {
            root: root.into(),
            base_url,
        }
    }

    pub fn from_config(config: &StorageConfig) -> Result<Self, StorageError> {
        let local: LocalConfig = parse_options(&config.provider, &config.options)?;
        if !local.root.is_dir() {
            return Err(StorageError::Config(format!(
                "photo root {} is not a directory",
                local.root.display()
            )));
        }
        Ok(Self::new(local.root, local.base_url))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(naming::normalize_key(key))
    }

    fn object_for(&self, key: String, meta: &fs::Metadata) -> StorageObject {
        let last_modified: DateTime<Utc> = meta
            .modified()
            .map(DateTime::from)
            .unwrap_or_default();
        StorageObject {
            key,
            size: meta.len(),
            last_modified,
            etag: None,
        }
    }
}

impl StorageProvider for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }

    fn get_file(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(self.path_for(key)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(key, e)),
        }
    }

    fn list_all_files(&self) -> Result<Vec<StorageObject>, StorageError> {
        let mut objects = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(true) {
            let entry = entry.map_err(|e| {
                let key = e.path().map(|p| p.display().to_string()).unwrap_or_default();
                StorageError::io(key, e.into())
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let key = naming::normalize_key(&relative.to_string_lossy());
            let meta = entry
                .metadata()
                .map_err(|e| StorageError::io(key.clone(), e.into()))?;
            objects.push(self.object_for(key, &meta));
        }
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    fn generate_public_url(&self, key: &str) -> String {
        match &self.base_url {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), encode_key(key)),
            None => format!("file://{}", self.path_for(key).display()),
        }
    }

    fn upload_file(
        &self,
        key: &str,
        data: &[u8],
        _opts: &UploadOptions,
    ) -> Result<StorageObject, StorageError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StorageError::io(key, e))?;
        }
        fs::write(&path, data).map_err(|e| StorageError::io(key, e))?;
        let meta = fs::metadata(&path).map_err(|e| StorageError::io(key, e))?;
        Ok(self.object_for(naming::normalize_key(key), &meta))
    }

    fn delete_file(&self, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(key, e)),
        }
    }

    fn delete_folder(&self, prefix: &str) -> Result<usize, StorageError> {
        let dir = self.path_for(prefix);
        if !dir.is_dir() {
            return Ok(0);
        }
        let count = WalkDir::new(&dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .count();
        fs::remove_dir_all(&dir).map_err(|e| StorageError::io(prefix, e))?;
        Ok(count)
    }

    /// `rename` is atomic on one filesystem, so no copy is needed.
    fn move_file(&self, src: &str, dst: &str) -> Result<StorageObject, StorageError> {
        let from = self.path_for(src);
        let to = self.path_for(dst);
        if !from.is_file() {
            return Err(StorageError::NotFound(src.to_string()));
        }
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).map_err(|e| StorageError::io(dst, e))?;
        }
        match fs::rename(&from, &to) {
            Ok(()) => {}
            // Cross-device: fall back to copy + delete with rollback.
            Err(e) if e.kind() == ErrorKind::CrossesDevices => {
                return super::move_via_copy(self, src, dst);
            }
            Err(e) => return Err(StorageError::io(src, e)),
        }
        let meta = fs::metadata(&to).map_err(|e| StorageError::io(dst, e))?;
        Ok(self.object_for(naming::normalize_key(dst), &meta))
    }
}
