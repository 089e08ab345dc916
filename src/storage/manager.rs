//! Provider wrapper applying exclusions and observing uploads.

use super::{
    ProviderRegistry, StorageError, StorageProvider, UploadEvent, UploadObserver, UploadOptions,
};
use crate::config::{ExcludeConfig, StorageConfig};
use crate::naming;
use crate::types::StorageObject;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// A rule removing objects from every listing.
#[derive(Clone)]
pub enum ExclusionFilter {
    /// Key starts with this prefix.
    Prefix(String),
    /// Key matches this `*` glob.
    Pattern(String),
    /// Key has a dot-segment.
    Hidden,
    /// Custom rule; `true` excludes.
    Predicate(Arc<dyn Fn(&StorageObject) -> bool + Send + Sync>),
}

impl fmt::Debug for ExclusionFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prefix(p) => f.debug_tuple("Prefix").field(p).finish(),
            Self::Pattern(p) => f.debug_tuple("Pattern").field(p).finish(),
            Self::Hidden => f.write_str("Hidden"),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

impl ExclusionFilter {
    pub fn excludes(&self, object: &StorageObject) -> bool {
        match self {
            Self::Prefix(prefix) => object.key.starts_with(prefix.as_str()),
            Self::Pattern(pattern) => glob_match(pattern, &object.key),
            Self::Hidden => naming::has_hidden_segment(&object.key),
            Self::Predicate(f) => f(object),
        }
    }

    /// Filters described by `[storage.exclude]`.
    pub fn from_config(exclude: &ExcludeConfig) -> Vec<Self> {
        let mut filters: Vec<Self> = exclude
            .prefixes
            .iter()
            .map(|p| Self::Prefix(naming::normalize_key(p)))
            .collect();
        filters.extend(exclude.patterns.iter().cloned().map(Self::Pattern));
        if exclude.hidden {
            filters.push(Self::Hidden);
        }
        filters
    }
}

/// Match `text` against a pattern where `*` matches any run of characters
/// (including `/`). No other metacharacters.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }
    let (first, rest) = (parts[0], &parts[1..]);
    let Some(mut remaining) = text.strip_prefix(first) else {
        return false;
    };
    let (last, middle) = match rest.split_last() {
        Some((last, middle)) => (*last, middle),
        None => return true,
    };
    for part in middle {
        match remaining.find(part) {
            Some(pos) => remaining = &remaining[pos + part.len()..],
            None => return false,
        }
    }
    remaining.len() >= last.len() && remaining.ends_with(last)
}

/// The pipeline's view of storage.
#[derive(Clone)]
pub struct StorageManager {
    provider: Arc<dyn StorageProvider>,
    filters: Vec<ExclusionFilter>,
    observer: Option<UploadObserver>,
}

impl fmt::Debug for StorageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageManager")
            .field("provider", &self.provider.name())
            .field("filters", &self.filters)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl StorageManager {
    pub fn new(provider: Arc<dyn StorageProvider>) -> Self {
        Self {
            provider,
            filters: Vec::new(),
            observer: None,
        }
    }

    /// Build the configured provider and its exclusions.
    pub fn from_config(
        config: &StorageConfig,
        registry: &ProviderRegistry,
    ) -> Result<Self, StorageError> {
        let provider = registry.create(config)?;
        Ok(Self::new(provider).with_filters(ExclusionFilter::from_config(&config.exclude)))
    }

    pub fn with_filters(mut self, filters: Vec<ExclusionFilter>) -> Self {
        self.filters.extend(filters);
        self
    }

    pub fn add_filter(&mut self, filter: ExclusionFilter) {
        self.filters.push(filter);
    }

    /// Observer notified of every upload, after any per-call handler.
    pub fn set_upload_observer(&mut self, observer: UploadObserver) {
        self.observer = Some(observer);
    }

    pub fn provider(&self) -> &Arc<dyn StorageProvider> {
        &self.provider
    }

    pub fn is_excluded(&self, object: &StorageObject) -> bool {
        self.filters.iter().any(|f| f.excludes(object))
    }

    fn filtered(&self, objects: Vec<StorageObject>) -> Vec<StorageObject> {
        objects.into_iter().filter(|o| !self.is_excluded(o)).collect()
    }

    pub fn list_all_files(&self) -> Result<Vec<StorageObject>, StorageError> {
        Ok(self.filtered(self.provider.list_all_files()?))
    }

    pub fn list_images(&self) -> Result<Vec<StorageObject>, StorageError> {
        Ok(self.filtered(self.provider.list_images()?))
    }

    pub fn get_file(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.provider.get_file(key)
    }

    pub fn generate_public_url(&self, key: &str) -> String {
        self.provider.generate_public_url(key)
    }

    pub fn detect_live_photos(&self, objects: &[StorageObject]) -> HashMap<String, StorageObject> {
        self.provider.detect_live_photos(objects)
    }

    /// Upload, firing `Start` then `Complete` or `Error` to `on_progress`
    /// and then to the manager-wide observer.
    pub fn upload_file(
        &self,
        key: &str,
        data: &[u8],
        opts: &UploadOptions,
        on_progress: Option<&dyn Fn(&UploadEvent)>,
    ) -> Result<StorageObject, StorageError> {
        let emit = |event: UploadEvent| {
            if let Some(handler) = on_progress {
                handler(&event);
            }
            if let Some(observer) = &self.observer {
                observer(&event);
            }
        };
        let size = data.len() as u64;
        let started = Instant::now();
        emit(UploadEvent::Start {
            key: key.to_string(),
            size,
        });
        match self.provider.upload_file(key, data, opts) {
            Ok(object) => {
                emit(UploadEvent::Complete {
                    key: key.to_string(),
                    size,
                    elapsed: started.elapsed(),
                });
                Ok(object)
            }
            Err(e) => {
                emit(UploadEvent::Error {
                    key: key.to_string(),
                    size,
                    elapsed: started.elapsed(),
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    pub fn delete_file(&self, key: &str) -> Result<(), StorageError> {
        self.provider.delete_file(key)
    }

    pub fn delete_folder(&self, prefix: &str) -> Result<usize, StorageError> {
        self.provider.delete_folder(prefix)
    }

    pub fn move_file(&self, src: &str, dst: &str) -> Result<StorageObject, StorageError> {
        self.provider.move_file(src, dst)
    }
}
