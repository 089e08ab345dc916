//! Read-only Eagle library.
//!
//! An Eagle library stores each asset in its own folder:
//!
//! ```text
//! Photos.library/
//! └── images/
//!     └── KBHG6KA0Y5S9W.info/
//!         ├── metadata.json
//!         ├── sunset.jpg
//!         └── sunset_thumbnail.png
//! ```
//!
//! `metadata.json` names the original (`name` + `ext`), its tags and a
//! deletion flag. Keys are `images/<id>.info/<name>.<ext>`.

use super::{StorageError, StorageProvider, UploadOptions, encode_key, parse_options};
use crate::config::StorageConfig;
use crate::types::StorageObject;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EagleConfig {
    pub library_path: PathBuf,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Only list assets carrying at least one of these tags. Empty = all.
    #[serde(default)]
    pub include_tags: Vec<String>,
}

/// The subset of `metadata.json` the provider needs.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssetMetadata {
    id: String,
    name: String,
    ext: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    is_deleted: bool,
    /// Milliseconds since epoch.
    #[serde(default)]
    modification_time: Option<i64>,
}

#[derive(Debug)]
pub struct EagleProvider {
    config: EagleConfig,
}

impl EagleProvider {
    pub fn new(config: EagleConfig) -> Self {
        Self { config }
    }

    pub fn from_config(config: &StorageConfig) -> Result<Self, StorageError> {
        let eagle: EagleConfig = parse_options(&config.provider, &config.options)?;
        if !eagle.library_path.join("images").is_dir() {
            return Err(StorageError::Config(format!(
                "{} is not an Eagle library (no images/ folder)",
                eagle.library_path.display()
            )));
        }
        Ok(Self::new(eagle))
    }

    fn read_asset(&self, info_dir: &std::path::Path) -> Result<Option<StorageObject>, StorageError> {
        let meta_path = info_dir.join("metadata.json");
        let key_hint = meta_path.display().to_string();
        let content = match fs::read_to_string(&meta_path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::io(key_hint, e)),
        };
        let asset: AssetMetadata = match serde_json::from_str(&content) {
            Ok(a) => a,
            Err(e) => {
                warn!(path = %key_hint, error = %e, "skipping asset with unreadable metadata.json");
                return Ok(None);
            }
        };
        if asset.is_deleted || !self.tags_match(&asset.tags) {
            return Ok(None);
        }

        let key = format!("images/{}.info/{}.{}", asset.id, asset.name, asset.ext);
        let file_meta = match fs::metadata(self.config.library_path.join(&key)) {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::io(key, e)),
        };
        let last_modified = asset
            .modification_time
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .or_else(|| file_meta.modified().ok().map(DateTime::<Utc>::from))
            .unwrap_or_default();
        Ok(Some(StorageObject {
            key,
            size: asset.size.unwrap_or(file_meta.len()),
            last_modified,
            etag: None,
        }))
    }

    fn tags_match(&self, tags: &[String]) -> bool {
        self.config.include_tags.is_empty()
            || tags.iter().any(|t| self.config.include_tags.contains(t))
    }

    fn read_only(&self, operation: &'static str) -> StorageError {
        StorageError::Unsupported {
            provider: "eagle".into(),
            operation,
        }
    }
}

impl StorageProvider for EagleProvider {
    fn name(&self) -> &str {
        "eagle"
    }

    fn get_file(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(self.config.library_path.join(key)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(key, e)),
        }
    }

    fn list_all_files(&self) -> Result<Vec<StorageObject>, StorageError> {
        let images = self.config.library_path.join("images");
        let entries = fs::read_dir(&images).map_err(|e| StorageError::io("images", e))?;
        let mut objects = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io("images", e))?;
            let path = entry.path();
            let is_info = path.is_dir()
                && path.extension().and_then(|e| e.to_str()) == Some("info");
            if !is_info {
                continue;
            }
            if let Some(object) = self.read_asset(&path)? {
                objects.push(object);
            }
        }
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    fn generate_public_url(&self, key: &str) -> String {
        match &self.config.base_url {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), encode_key(key)),
            None => format!("file://{}", self.config.library_path.join(key).display()),
        }
    }

    fn upload_file(
        &self,
        _key: &str,
        _data: &[u8],
        _opts: &UploadOptions,
    ) -> Result<StorageObject, StorageError> {
        Err(self.read_only("upload"))
    }

    fn delete_file(&self, _key: &str) -> Result<(), StorageError> {
        Err(self.read_only("delete"))
    }

    fn delete_folder(&self, _prefix: &str) -> Result<usize, StorageError> {
        Err(self.read_only("delete"))
    }

    fn move_file(&self, _src: &str, _dst: &str) -> Result<StorageObject, StorageError> {
        Err(self.read_only("move"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn add_asset(lib: &std::path::Path, id: &str, name: &str, tags: &[&str], deleted: bool) {
        let dir = lib.join("images").join(format!("{id}.info"));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(format!("{name}.jpg")), b"jpegbytes").unwrap();
        fs::write(dir.join(format!("{name}_thumbnail.png")), b"thumb").unwrap();
        let meta = serde_json::json!({
            "id": id,
            "name": name,
            "ext": "jpg",
            "size": 9,
            "tags": tags,
            "isDeleted": deleted,
            "modificationTime": 1_700_000_000_000i64,
            "folders": [],
            "annotation": ""
        });
        fs::write(dir.join("metadata.json"), meta.to_string()).unwrap();
    }

    fn provider(lib: &std::path::Path, include_tags: &[&str]) -> EagleProvider {
        EagleProvider::new(EagleConfig {
            library_path: lib.to_path_buf(),
            base_url: None,
            include_tags: include_tags.iter().map(|s| s.to_string()).collect(),
        })
    }

    #[test]
    fn lists_originals_not_thumbnails() {
        let tmp = TempDir::new().unwrap();
        add_asset(tmp.path(), "A1", "sunset", &[], false);
        add_asset(tmp.path(), "B2", "gone", &[], true);

        let objects = provider(tmp.path(), &[]).list_all_files().unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].key, "images/A1.info/sunset.jpg");
        assert_eq!(objects[0].size, 9);
        assert_eq!(objects[0].last_modified.timestamp(), 1_700_000_000);
    }

    #[test]
    fn include_tags_filters() {
        let tmp = TempDir::new().unwrap();
        add_asset(tmp.path(), "A1", "one", &["portfolio"], false);
        add_asset(tmp.path(), "B2", "two", &["family"], false);
        let objects = provider(tmp.path(), &["portfolio"]).list_all_files().unwrap();
        assert_eq!(objects.len(), 1);
        assert!(objects[0].key.ends_with("one.jpg"));
    }

    #[test]
    fn writes_are_unsupported() {
        let tmp = TempDir::new().unwrap();
        let p = provider(tmp.path(), &[]);
        assert!(matches!(
            p.upload_file("a.jpg", b"x", &UploadOptions::default()),
            Err(StorageError::Unsupported { .. })
        ));
        assert!(matches!(p.delete_file("a.jpg"), Err(StorageError::Unsupported { .. })));
    }

    #[test]
    fn get_reads_original() {
        let tmp = TempDir::new().unwrap();
        add_asset(tmp.path(), "A1", "sunset", &[], false);
        let data = provider(tmp.path(), &[]).get_file("images/A1.info/sunset.jpg").unwrap();
        assert_eq!(data.as_deref(), Some(&b"jpegbytes"[..]));
    }
}
