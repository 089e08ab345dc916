//! Builder configuration.
//!
//! Handles loading, validating, and merging `builder.toml`. The stock
//! defaults are serialized to a TOML table, the user file is merged on top
//! key by key, and the result is deserialized with unknown keys rejected.
//!
//! ## Configuration Options
//!
//! ```toml
//! [storage]
//! provider = "s3"            # local | eagle | s3 | oss | cos | github
//! bucket = "photos"
//! region = "us-east-1"
//!
//! [storage.exclude]
//! prefixes = ["drafts/"]
//! patterns = ["*.tmp.jpg"]
//! hidden = true
//!
//! [output]
//! manifest_path = "manifest.json"
//! thumbnail_dir = "thumbnails"
//!
//! [processing]
//! mode = "worker-pool"       # or "cluster"
//! concurrency = 8
//!
//! [geocoding]
//! enabled = true
//! provider = "auto"
//!
//! [[plugins]]
//! name = "thumbnail-storage"
//! options = { prefix = ".thumbnails/" }
//! ```
//!
//! Storage backend fields live next to `provider` and are validated when the
//! provider is built, because plugins may register additional providers
//! with their own fields.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML render error: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Built-in storage provider names.
pub const BUILTIN_PROVIDERS: &[&str] = &["local", "eagle", "s3", "oss", "cos", "github"];

/// Built-in plugin names resolvable from `[[plugins]]`.
pub const BUILTIN_PLUGINS: &[&str] = &["geocoding", "thumbnail-storage", "repo-sync"];

const MAX_CONCURRENCY: usize = 64;

/// Complete builder configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuilderConfig {
    pub storage: StorageConfig,
    pub output: OutputConfig,
    pub processing: ProcessingConfig,
    pub geocoding: GeocodingConfig,
    pub plugins: Vec<PluginConfig>,
    pub logging: LoggingConfig,
}

impl BuilderConfig {
    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.provider.trim().is_empty() {
            return Err(ConfigError::Validation(
                "storage.provider must not be empty".into(),
            ));
        }
        if self.processing.concurrency == 0 {
            return Err(ConfigError::Validation(
                "processing.concurrency must be at least 1".into(),
            ));
        }
        if self.processing.thumbnail_width == 0 {
            return Err(ConfigError::Validation(
                "processing.thumbnail_width must be non-zero".into(),
            ));
        }
        if self.processing.thumbnail_quality == 0 || self.processing.thumbnail_quality > 100 {
            return Err(ConfigError::Validation(
                "processing.thumbnail_quality must be 1-100".into(),
            ));
        }
        if self.processing.exiftool_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "processing.exiftool_timeout_secs must be non-zero".into(),
            ));
        }
        if self.geocoding.precision > 8 {
            return Err(ConfigError::Validation(
                "geocoding.precision must be 0-8".into(),
            ));
        }
        if self.geocoding.provider == GeocodingProviderKind::Mapbox
            && self.geocoding.enabled
            && self.geocoding.resolved_mapbox_token().is_none()
        {
            return Err(ConfigError::Validation(
                "geocoding.provider = \"mapbox\" requires mapbox_token or MAPBOX_TOKEN".into(),
            ));
        }
        for plugin in &self.plugins {
            if !BUILTIN_PLUGINS.contains(&plugin.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "unknown plugin '{}' (available: {})",
                    plugin.name,
                    BUILTIN_PLUGINS.join(", ")
                )));
            }
        }
        Ok(())
    }

    /// Render the resolved configuration as TOML with secrets masked.
    pub fn to_display_toml(&self) -> Result<String, ConfigError> {
        let mut masked = self.clone();
        for key in ["secret_access_key", "access_key_id", "token"] {
            if let Some(value) = masked.storage.options.get_mut(key)
                && value.as_str().is_some_and(|s| !s.is_empty())
            {
                *value = toml::Value::String("********".into());
            }
        }
        if masked.geocoding.mapbox_token.is_some() {
            masked.geocoding.mapbox_token = Some("********".into());
        }
        Ok(toml::to_string_pretty(&masked)?)
    }
}

/// Storage backend selection.
///
/// `provider` picks the backend; every other key is backend-specific and
/// is parsed by the backend itself (see [`crate::storage::create_provider`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub provider: String,
    #[serde(default)]
    pub exclude: ExcludeConfig,
    #[serde(flatten)]
    pub options: toml::Table,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let mut options = toml::Table::new();
        options.insert("root".into(), toml::Value::String("photos".into()));
        Self {
            provider: "local".into(),
            exclude: ExcludeConfig::default(),
            options,
        }
    }
}

/// Listing exclusions applied uniformly by the storage manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExcludeConfig {
    /// Keys starting with any of these prefixes are skipped.
    pub prefixes: Vec<String>,
    /// Simple `*` globs matched against the whole key.
    pub patterns: Vec<String>,
    /// Skip keys with a path segment starting with a dot.
    pub hidden: bool,
}

impl Default for ExcludeConfig {
    fn default() -> Self {
        Self {
            prefixes: Vec::new(),
            patterns: Vec::new(),
            hidden: true,
        }
    }
}

/// Where the manifest and thumbnails are written.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputConfig {
    pub manifest_path: PathBuf,
    pub thumbnail_dir: PathBuf,
    /// URL prefix under which `thumbnail_dir` is served.
    pub thumbnail_url_prefix: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            manifest_path: PathBuf::from("manifest.json"),
            thumbnail_dir: PathBuf::from("thumbnails"),
            thumbnail_url_prefix: "/thumbnails".into(),
        }
    }
}

/// How tasks are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DispatchMode {
    /// Bounded concurrency on a thread pool inside this process.
    WorkerPool,
    /// Independent worker processes fed from a shared queue.
    Cluster,
}

/// Per-photo pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessingConfig {
    pub mode: DispatchMode,
    /// Tasks in flight at once in worker-pool mode.
    pub concurrency: usize,
    /// Worker processes in cluster mode. When absent, the core count.
    pub cluster_workers: Option<usize>,
    /// Hex characters of key hash appended to photo ids.
    pub digest_suffix_len: usize,
    pub thumbnail_width: u32,
    pub thumbnail_quality: u8,
    /// Longest edge of the copy used for the luminance histogram.
    pub tone_sample_edge: u32,
    pub exiftool_path: PathBuf,
    pub exiftool_timeout_secs: u64,
    pub enable_live_photo: bool,
    pub enable_motion_photo: bool,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            mode: DispatchMode::WorkerPool,
            concurrency: 8,
            cluster_workers: None,
            digest_suffix_len: 8,
            thumbnail_width: 600,
            thumbnail_quality: 80,
            tone_sample_edge: 256,
            exiftool_path: PathBuf::from("exiftool"),
            exiftool_timeout_secs: 30,
            enable_live_photo: true,
            enable_motion_photo: true,
        }
    }
}

/// Resolve the effective worker-pool size (capped to a sane maximum).
pub fn effective_concurrency(config: &ProcessingConfig) -> usize {
    config.concurrency.clamp(1, MAX_CONCURRENCY)
}

/// Resolve the effective cluster size.
///
/// - `None` → use all available cores
/// - `Some(n)` → use `min(n, cores)` (user can constrain down, not up)
pub fn effective_cluster_workers(config: &ProcessingConfig) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    config
        .cluster_workers
        .map(|n| n.clamp(1, cores))
        .unwrap_or(cores)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeocodingProviderKind {
    /// Mapbox when a token is available, Nominatim otherwise.
    Auto,
    Mapbox,
    Nominatim,
}

/// Reverse geocoding settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GeocodingConfig {
    pub enabled: bool,
    pub provider: GeocodingProviderKind,
    pub mapbox_token: Option<String>,
    pub nominatim_base_url: String,
    pub language: Option<String>,
    /// Decimal places kept when building cache keys (4 ≈ 11 m).
    pub precision: u32,
    pub mapbox_interval_ms: u64,
    pub nominatim_interval_ms: u64,
    pub max_retries: u32,
    /// Shared directory for the cross-process rate-limit files.
    pub lock_dir: Option<PathBuf>,
    pub lock_stale_ms: u64,
    /// Clear existing locations when a lookup yields nothing.
    pub force_refresh: bool,
}

impl Default for GeocodingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: GeocodingProviderKind::Auto,
            mapbox_token: None,
            nominatim_base_url: "https://nominatim.openstreetmap.org".into(),
            language: None,
            precision: 4,
            mapbox_interval_ms: 100,
            nominatim_interval_ms: 1000,
            max_retries: 3,
            lock_dir: None,
            lock_stale_ms: 10_000,
            force_refresh: false,
        }
    }
}

impl GeocodingConfig {
    /// Token from config, falling back to `MAPBOX_TOKEN`.
    pub fn resolved_mapbox_token(&self) -> Option<String> {
        self.mapbox_token
            .clone()
            .or_else(|| std::env::var("MAPBOX_TOKEN").ok())
            .filter(|t| !t.trim().is_empty())
    }

    pub fn resolved_lock_dir(&self) -> PathBuf {
        self.lock_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("photo-manifest-geocoding"))
    }
}

/// One entry of the ordered `[[plugins]]` list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginConfig {
    pub name: String,
    #[serde(default)]
    pub options: toml::Table,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// =============================================================================
// Config loading, merging, and validation
// =============================================================================

/// Returns the stock default config as a `toml::Value::Table`.
pub fn stock_defaults_value() -> Result<toml::Value, ConfigError> {
    Ok(toml::Value::try_from(BuilderConfig::default())?)
}

/// Recursively merge `overlay` on top of `base`.
///
/// - Tables are merged key-by-key (overlay keys override base keys).
/// - Non-table values in overlay replace base values entirely.
/// - Keys in base that are not in overlay are preserved.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Merge an optional overlay onto a base value, then deserialize and validate.
pub fn resolve_config(
    base: toml::Value,
    overlay: Option<toml::Value>,
) -> Result<BuilderConfig, ConfigError> {
    let merged = match overlay {
        Some(ov) => {
            // A user-chosen backend replaces the stock backend's fields.
            let mut base = base;
            let switches_provider = match (base.get("storage"), ov.get("storage")) {
                (Some(base_storage), Some(ov_storage)) => ov_storage
                    .get("provider")
                    .is_some_and(|p| Some(p) != base_storage.get("provider")),
                _ => false,
            };
            if switches_provider && let toml::Value::Table(table) = &mut base {
                table.remove("storage");
            }
            merge_toml(base, ov)
        }
        None => base,
    };
    let config: BuilderConfig = merged.try_into()?;
    config.validate()?;
    Ok(config)
}

/// Load config from the given file.
///
/// A missing file yields the stock defaults.
pub fn load_config(path: &Path) -> Result<BuilderConfig, ConfigError> {
    let base = stock_defaults_value()?;
    let overlay = if path.exists() {
        let content = fs::read_to_string(path)?;
        Some(toml::from_str::<toml::Value>(&content)?)
    } else {
        None
    };
    resolve_config(base, overlay)
}

/// Parse a config from a TOML string (stock defaults underneath).
pub fn parse_config(content: &str) -> Result<BuilderConfig, ConfigError> {
    let overlay: toml::Value = toml::from_str(content)?;
    resolve_config(stock_defaults_value()?, Some(overlay))
}

/// Returns a fully-commented stock `builder.toml` with all keys and explanations.
pub fn stock_config_toml() -> &'static str {
    r##"# photo-manifest configuration
# ============================
# All settings are optional. Values shown below are the defaults.
# Unknown keys cause an error.

# ---------------------------------------------------------------------------
# Storage backend
# ---------------------------------------------------------------------------
[storage]
# local  : root, base_url
# eagle  : library_path, base_url, include_tags
# s3/oss/cos : bucket, region, endpoint, access_key_id, secret_access_key,
#              prefix, custom_domain, force_path_style, max_keys
# github : owner, repo, branch, path, token, use_raw_url
provider = "local"
root = "photos"

[storage.exclude]
prefixes = []
# Simple globs matched against the whole key, e.g. "*/drafts/*"
patterns = []
# Skip keys with a path segment starting with "."
hidden = true

# ---------------------------------------------------------------------------
# Output
# ---------------------------------------------------------------------------
[output]
manifest_path = "manifest.json"
thumbnail_dir = "thumbnails"
thumbnail_url_prefix = "/thumbnails"

# ---------------------------------------------------------------------------
# Processing
# ---------------------------------------------------------------------------
[processing]
# "worker-pool" runs tasks on threads; "cluster" forks worker processes.
mode = "worker-pool"
concurrency = 8
# cluster_workers = 4     # default: number of CPU cores
digest_suffix_len = 8
thumbnail_width = 600
thumbnail_quality = 80
tone_sample_edge = 256
exiftool_path = "exiftool"
exiftool_timeout_secs = 30
enable_live_photo = true
enable_motion_photo = true

# ---------------------------------------------------------------------------
# Reverse geocoding
# ---------------------------------------------------------------------------
[geocoding]
enabled = false
# "auto" uses Mapbox when a token is set, Nominatim otherwise.
provider = "auto"
# mapbox_token = "..."    # or MAPBOX_TOKEN
nominatim_base_url = "https://nominatim.openstreetmap.org"
# language = "en"
precision = 4
mapbox_interval_ms = 100
nominatim_interval_ms = 1000
max_retries = 3
# lock_dir = "/tmp/photo-manifest-geocoding"
lock_stale_ms = 10000
force_refresh = false

# ---------------------------------------------------------------------------
# Plugins (run in the order listed)
# ---------------------------------------------------------------------------
# [[plugins]]
# name = "thumbnail-storage"
# options = { prefix = ".thumbnails/" }
#
# [[plugins]]
# name = "repo-sync"
# options = { dir = "site-data", push = true }

[logging]
level = "info"
"##
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_is_valid() {
        let config = BuilderConfig::default();
        config.validate().unwrap();
        assert_eq!(config.storage.provider, "local");
        assert_eq!(config.processing.mode, DispatchMode::WorkerPool);
        assert_eq!(config.geocoding.precision, 4);
    }

    #[test]
    fn stock_config_toml_parses_to_defaults() {
        let config = parse_config(stock_config_toml()).unwrap();
        let defaults = BuilderConfig::default();
        assert_eq!(config.processing.concurrency, defaults.processing.concurrency);
        assert_eq!(config.output.manifest_path, defaults.output.manifest_path);
        assert_eq!(
            config.storage.options.get("root").and_then(|v| v.as_str()),
            Some("photos")
        );
    }

    #[test]
    fn partial_config_keeps_other_defaults() {
        let config = parse_config(
            r#"
            [processing]
            concurrency = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.processing.concurrency, 3);
        assert_eq!(config.processing.thumbnail_width, 600);
        assert_eq!(config.storage.provider, "local");
    }

    #[test]
    fn switching_provider_drops_stock_backend_fields() {
        let config = parse_config(
            r#"
            [storage]
            provider = "s3"
            bucket = "photos"
            region = "eu-west-1"
            "#,
        )
        .unwrap();
        assert_eq!(config.storage.provider, "s3");
        assert!(config.storage.options.get("root").is_none());
        assert_eq!(
            config.storage.options.get("bucket").and_then(|v| v.as_str()),
            Some("photos")
        );
        assert!(config.storage.exclude.hidden);
    }

    #[test]
    fn unknown_key_rejected() {
        let result = parse_config(
            r#"
            [processing]
            concurency = 3
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Toml(_))));
    }

    #[test]
    fn zero_concurrency_rejected() {
        let result = parse_config("[processing]\nconcurrency = 0\n");
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn unknown_plugin_rejected() {
        let result = parse_config("[[plugins]]\nname = \"nope\"\n");
        assert!(matches!(result, Err(ConfigError::Validation(msg)) if msg.contains("nope")));
    }

    #[test]
    fn plugins_keep_order_and_options() {
        let config = parse_config(
            r#"
            [[plugins]]
            name = "thumbnail-storage"
            options = { prefix = "t/" }

            [[plugins]]
            name = "repo-sync"
            "#,
        )
        .unwrap();
        let names: Vec<&str> = config.plugins.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["thumbnail-storage", "repo-sync"]);
        assert_eq!(
            config.plugins[0].options.get("prefix").and_then(|v| v.as_str()),
            Some("t/")
        );
    }

    #[test]
    fn dispatch_mode_kebab_case() {
        let config = parse_config("[processing]\nmode = \"cluster\"\ncluster_workers = 1\n").unwrap();
        assert_eq!(config.processing.mode, DispatchMode::Cluster);
        assert_eq!(effective_cluster_workers(&config.processing), 1);
    }

    #[test]
    fn effective_concurrency_is_capped() {
        let processing = ProcessingConfig {
            concurrency: 10_000,
            ..ProcessingConfig::default()
        };
        assert_eq!(effective_concurrency(&processing), MAX_CONCURRENCY);
    }

    #[test]
    fn load_missing_file_gives_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = load_config(&tmp.path().join("builder.toml")).unwrap();
        assert_eq!(config.storage.provider, "local");
    }

    #[test]
    fn load_reads_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("builder.toml");
        fs::write(&path, "[output]\nmanifest_path = \"out/m.json\"\n").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.output.manifest_path, PathBuf::from("out/m.json"));
    }

    #[test]
    fn display_toml_masks_secrets() {
        let config = parse_config(
            r#"
            [storage]
            provider = "s3"
            bucket = "b"
            region = "r"
            secret_access_key = "very-secret"
            "#,
        )
        .unwrap();
        let rendered = config.to_display_toml().unwrap();
        assert!(!rendered.contains("very-secret"));
        assert!(rendered.contains("********"));
    }

    #[test]
    fn merge_toml_overrides_scalars_and_keeps_rest() {
        let base: toml::Value = toml::from_str("[a]\nx = 1\ny = 2\n").unwrap();
        let overlay: toml::Value = toml::from_str("[a]\ny = 3\n").unwrap();
        let merged = merge_toml(base, overlay);
        assert_eq!(merged["a"]["x"].as_integer(), Some(1));
        assert_eq!(merged["a"]["y"].as_integer(), Some(3));
    }
}
