//! Storage abstraction.
//!
//! Every photo source is a [`StorageProvider`]: a flat namespace of
//! forward-slash keys that can be listed, fetched, written and removed.
//! Backends:
//!
//! | Provider | Module | Notes |
//! |---|---|---|
//! | `local` | [`local`] | A directory tree on disk |
//! | `eagle` | [`eagle`] | Read-only Eagle library (`images/<id>.info/`) |
//! | `s3`, `oss`, `cos` | [`s3`] | S3-compatible object stores, SigV4 signed |
//! | `github` | [`github`] | A repository branch through the REST API |
//!
//! Providers are created by name through a [`ProviderRegistry`], so plugins
//! can add backends without touching the pipeline. The [`StorageManager`]
//! wraps a provider with listing exclusions and upload observation.

pub mod eagle;
pub mod github;
pub mod local;
mod manager;
mod memory;
pub mod s3;
mod sigv4;

pub use manager::{ExclusionFilter, StorageManager};
pub use memory::{MemoryProvider, epoch_plus};

use crate::config::StorageConfig;
use crate::naming;
use crate::types::StorageObject;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },
    #[error("request failed: {0}")]
    Transport(String),
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("{provider} does not support {operation}")]
    Unsupported {
        provider: String,
        operation: &'static str,
    },
    #[error("move {src} -> {dst} failed: {reason}")]
    MoveFailed {
        src: String,
        dst: String,
        reason: String,
    },
    #[error("storage config error: {0}")]
    Config(String),
    #[error("unexpected response: {0}")]
    Parse(String),
}

impl StorageError {
    pub(crate) fn io(key: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            key: key.into(),
            source,
        }
    }

    /// Rate limits, server errors and transport failures are transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http { status, .. } => crate::http::is_retryable_status(*status),
            Self::Transport(_) => true,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for StorageError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => Self::Http {
                status: status.as_u16(),
                url: e.url().map(|u| u.to_string()).unwrap_or_default(),
            },
            None => Self::Transport(e.to_string()),
        }
    }
}

/// Per-upload options.
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    /// Explicit MIME type. Guessed from the key when absent.
    pub content_type: Option<String>,
}

impl UploadOptions {
    pub fn content_type_for(&self, key: &str) -> String {
        self.content_type.clone().unwrap_or_else(|| {
            mime_guess::from_path(key)
                .first_or_octet_stream()
                .essence_str()
                .to_string()
        })
    }
}

/// Upload lifecycle notification.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    Start {
        key: String,
        size: u64,
    },
    Complete {
        key: String,
        size: u64,
        elapsed: Duration,
    },
    Error {
        key: String,
        size: u64,
        elapsed: Duration,
        message: String,
    },
}

impl UploadEvent {
    pub fn key(&self) -> &str {
        match self {
            Self::Start { key, .. } | Self::Complete { key, .. } | Self::Error { key, .. } => key,
        }
    }
}

pub type UploadObserver = Arc<dyn Fn(&UploadEvent) + Send + Sync>;

/// Uniform access to a photo source.
pub trait StorageProvider: Send + Sync {
    /// Provider name as used in config (`"s3"`, `"github"`, ...).
    fn name(&self) -> &str;

    /// Fetch an object. `Ok(None)` when the key does not exist.
    fn get_file(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Every object under the provider root, images and videos alike.
    fn list_all_files(&self) -> Result<Vec<StorageObject>, StorageError>;

    /// Objects with a supported image extension.
    fn list_images(&self) -> Result<Vec<StorageObject>, StorageError> {
        Ok(self
            .list_all_files()?
            .into_iter()
            .filter(|o| naming::is_image_key(&o.key))
            .collect())
    }

    fn generate_public_url(&self, key: &str) -> String;

    fn upload_file(
        &self,
        key: &str,
        data: &[u8],
        opts: &UploadOptions,
    ) -> Result<StorageObject, StorageError>;

    /// Remove an object. Removing a missing key is not an error.
    fn delete_file(&self, key: &str) -> Result<(), StorageError>;

    /// Remove every object under `prefix`, returning how many were deleted.
    fn delete_folder(&self, prefix: &str) -> Result<usize, StorageError> {
        let prefix = folder_prefix(prefix);
        let mut deleted = 0;
        for object in self.list_all_files()? {
            if object.key.starts_with(&prefix) {
                self.delete_file(&object.key)?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Move an object. Backends without a native move copy then delete.
    fn move_file(&self, src: &str, dst: &str) -> Result<StorageObject, StorageError> {
        move_via_copy(self, src, dst)
    }

    /// Pair images with videos sharing their directory and basename.
    fn detect_live_photos(&self, objects: &[StorageObject]) -> HashMap<String, StorageObject> {
        pair_live_photos(objects)
    }
}

/// Get, put, then delete the source. If the source delete fails the
/// destination write is rolled back so the object is never duplicated.
pub fn move_via_copy<P: StorageProvider + ?Sized>(
    provider: &P,
    src: &str,
    dst: &str,
) -> Result<StorageObject, StorageError> {
    let data = provider
        .get_file(src)?
        .ok_or_else(|| StorageError::NotFound(src.to_string()))?;
    let written = provider.upload_file(dst, &data, &UploadOptions::default())?;
    if let Err(e) = provider.delete_file(src) {
        let rollback = match provider.delete_file(dst) {
            Ok(()) => "destination rolled back".to_string(),
            Err(rb) => format!("rollback also failed: {rb}"),
        };
        return Err(StorageError::MoveFailed {
            src: src.to_string(),
            dst: dst.to_string(),
            reason: format!("{e}; {rollback}"),
        });
    }
    Ok(written)
}

/// Map each image key to the video object with the same directory and
/// basename (case-insensitive), e.g. `IMG_1.HEIC`/`IMG_1.jpg` + `IMG_1.MOV`.
pub fn pair_live_photos(objects: &[StorageObject]) -> HashMap<String, StorageObject> {
    let group_key = |key: &str| {
        format!("{}/{}", naming::dirname(key), naming::stem(key)).to_lowercase()
    };
    let mut videos: HashMap<String, &StorageObject> = HashMap::new();
    for object in objects.iter().filter(|o| naming::is_video_key(&o.key)) {
        videos.entry(group_key(&object.key)).or_insert(object);
    }
    objects
        .iter()
        .filter(|o| naming::is_image_key(&o.key))
        .filter_map(|image| {
            videos
                .get(&group_key(&image.key))
                .map(|video| (image.key.clone(), (*video).clone()))
        })
        .collect()
}

fn folder_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}

/// Percent-encode a key for use in a URL path, leaving `/` intact.
///
/// Encodes everything outside RFC 3986 unreserved characters, which is also
/// the encoding SigV4 canonical requests expect.
pub fn encode_key(key: &str) -> String {
    uri_encode(key, false)
}

pub(crate) fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b'/' if !encode_slash => out.push('/'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Deserialize a backend's typed config from the `[storage]` table.
pub fn parse_options<T: DeserializeOwned>(
    provider: &str,
    options: &toml::Table,
) -> Result<T, StorageError> {
    toml::Value::Table(options.clone())
        .try_into()
        .map_err(|e| StorageError::Config(format!("[storage] for provider '{provider}': {e}")))
}

/// Builds a provider from the `[storage]` section.
pub type ProviderFactory =
    Arc<dyn Fn(&StorageConfig) -> Result<Arc<dyn StorageProvider>, StorageError> + Send + Sync>;

/// Provider name → factory. Starts with the built-in backends.
#[derive(Clone)]
pub struct ProviderRegistry {
    factories: HashMap<String, ProviderFactory>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("ProviderRegistry").field("providers", &names).finish()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("local", |c| Ok(Arc::new(local::LocalProvider::from_config(c)?)));
        registry.register("eagle", |c| Ok(Arc::new(eagle::EagleProvider::from_config(c)?)));
        for flavour in ["s3", "oss", "cos"] {
            registry.register(flavour, |c| Ok(Arc::new(s3::S3Provider::from_config(c)?)));
        }
        registry.register("github", |c| Ok(Arc::new(github::GitHubProvider::from_config(c)?)));
        registry
    }
}

impl ProviderRegistry {
    /// Register (or replace) a provider factory.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&StorageConfig) -> Result<Arc<dyn StorageProvider>, StorageError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn create(&self, config: &StorageConfig) -> Result<Arc<dyn StorageProvider>, StorageError> {
        let factory = self.factories.get(&config.provider).ok_or_else(|| {
            let mut known: Vec<&str> = self.factories.keys().map(String::as_str).collect();
            known.sort();
            StorageError::Config(format!(
                "unknown storage provider '{}' (available: {})",
                config.provider,
                known.join(", ")
            ))
        })?;
        factory(config)
    }
}

/// Create a provider with the built-in registry.
pub fn create_provider(config: &StorageConfig) -> Result<Arc<dyn StorageProvider>, StorageError> {
    ProviderRegistry::default().create(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::object;

    #[test]
    fn pairs_by_directory_and_stem() {
        let objects = vec![
            object("2024/IMG_1.jpg", 10),
            object("2024/IMG_1.MOV", 20),
            object("2024/IMG_2.jpg", 10),
            object("2023/IMG_2.mov", 20),
            object("IMG_3.png", 10),
        ];
        let pairs = pair_live_photos(&objects);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs["2024/IMG_1.jpg"].key, "2024/IMG_1.MOV");
    }

    #[test]
    fn move_rolls_back_when_source_delete_fails() {
        let provider = MemoryProvider::new();
        provider.insert("a.jpg", b"data".to_vec());
        provider.fail_deletes_of("a.jpg");

        let err = provider.move_file("a.jpg", "b.jpg").unwrap_err();
        assert!(matches!(err, StorageError::MoveFailed { .. }));
        assert!(provider.get_file("a.jpg").unwrap().is_some());
        assert!(provider.get_file("b.jpg").unwrap().is_none());
    }

    #[test]
    fn move_copies_then_deletes() {
        let provider = MemoryProvider::new();
        provider.insert("a.jpg", b"data".to_vec());
        let moved = provider.move_file("a.jpg", "x/b.jpg").unwrap();
        assert_eq!(moved.key, "x/b.jpg");
        assert_eq!(provider.get_file("x/b.jpg").unwrap().as_deref(), Some(&b"data"[..]));
        assert!(provider.get_file("a.jpg").unwrap().is_none());
    }

    #[test]
    fn move_missing_source_is_not_found() {
        let provider = MemoryProvider::new();
        assert!(matches!(
            provider.move_file("nope.jpg", "b.jpg"),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn delete_folder_only_touches_prefix() {
        let provider = MemoryProvider::new();
        provider.insert("a/1.jpg", vec![1]);
        provider.insert("a/2.jpg", vec![2]);
        provider.insert("ab/3.jpg", vec![3]);
        assert_eq!(provider.delete_folder("a").unwrap(), 2);
        assert_eq!(provider.keys(), vec!["ab/3.jpg".to_string()]);
    }

    #[test]
    fn uri_encoding() {
        assert_eq!(encode_key("a b/ü.jpg"), "a%20b/%C3%BC.jpg");
        assert_eq!(uri_encode("a/b", true), "a%2Fb");
        assert_eq!(encode_key("safe-_.~"), "safe-_.~");
    }

    #[test]
    fn content_type_guessed_from_key() {
        let opts = UploadOptions::default();
        assert_eq!(opts.content_type_for("a.jpg"), "image/jpeg");
        assert_eq!(opts.content_type_for("manifest.json"), "application/json");
    }

    #[test]
    fn unknown_provider_lists_known_ones() {
        let config = StorageConfig {
            provider: "ftp".into(),
            ..StorageConfig::default()
        };
        let err = create_provider(&config).err().unwrap();
        assert!(err.to_string().contains("github"));
    }

    #[test]
    fn registry_accepts_custom_provider() {
        let mut registry = ProviderRegistry::default();
        registry.register("memory", |_| Ok(Arc::new(MemoryProvider::new())));
        let config = StorageConfig {
            provider: "memory".into(),
            ..StorageConfig::default()
        };
        assert_eq!(registry.create(&config).unwrap().name(), "memory");
    }

    #[test]
    fn retryable_errors() {
        assert!(StorageError::Http { status: 503, url: String::new() }.is_retryable());
        assert!(StorageError::Transport("reset".into()).is_retryable());
        assert!(!StorageError::NotFound("k".into()).is_retryable());
    }
}
