//! Plugins shipped with the builder, resolvable by name from `[[plugins]]`.

use super::{EventKind, HookEvent, Plugin, PluginError, PluginInitContext};
use crate::config::BuilderConfig;
use crate::geocoding::Geocoder;
use crate::storage::UploadOptions;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

pub const GEOCODING: &str = "geocoding";
pub const THUMBNAIL_STORAGE: &str = "thumbnail-storage";
pub const REPO_SYNC: &str = "repo-sync";

/// Instantiate a built-in plugin by name.
pub fn create(
    name: &str,
    config: &BuilderConfig,
    options: &toml::Table,
) -> Result<Arc<dyn Plugin>, PluginError> {
    match name {
        GEOCODING => {
            let geocoder = Geocoder::from_config(&config.geocoding).map_err(|e| PluginError::Init {
                plugin: GEOCODING.into(),
                message: e.to_string(),
            })?;
            Ok(Arc::new(GeocodingPlugin::new(geocoder)))
        }
        THUMBNAIL_STORAGE => Ok(Arc::new(ThumbnailStoragePlugin::new(
            super::parse_options(THUMBNAIL_STORAGE, options)?,
        ))),
        REPO_SYNC => Ok(Arc::new(RepoSyncPlugin::new(super::parse_options(
            REPO_SYNC, options,
        )?))),
        other => Err(PluginError::Unknown(other.to_string())),
    }
}

// ============================================================================
// Geocoding
// ============================================================================

/// Fills `location` for processed photos that carry GPS.
#[derive(Debug)]
pub struct GeocodingPlugin {
    geocoder: Geocoder,
}

impl GeocodingPlugin {
    pub fn new(geocoder: Geocoder) -> Self {
        Self { geocoder }
    }
}

impl Plugin for GeocodingPlugin {
    fn name(&self) -> &str {
        GEOCODING
    }

    fn init(self: Arc<Self>, ctx: &mut PluginInitContext<'_>) -> Result<(), PluginError> {
        let _enter = ctx.span.enter();
        tracing::info!(provider = self.geocoder.provider_name(), "reverse geocoding enabled");

        let this = Arc::clone(&self);
        ctx.hooks.on(EventKind::AfterPhotoProcess, GEOCODING, move |event, hook| {
            if let HookEvent::AfterPhotoProcess { item, scope, .. } = event
                && scope.metadata
            {
                let had = item.location.is_some();
                this.geocoder.enrich(item);
                if !had && item.location.is_some() {
                    hook.run.increment("geocoding.resolved", 1);
                }
            }
            Ok(())
        });

        ctx.hooks.on(EventKind::AfterDispatch, GEOCODING, move |_, hook| {
            let resolved = hook
                .run
                .get("geocoding.resolved")
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
            tracing::info!(
                resolved,
                distinct = self.geocoder.cached_keys(),
                "geocoding finished"
            );
            Ok(())
        });
        Ok(())
    }
}

// ============================================================================
// Thumbnail storage
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ThumbnailStorageOptions {
    /// Key prefix thumbnails are uploaded under.
    pub prefix: String,
    pub content_type: String,
}

impl Default for ThumbnailStorageOptions {
    fn default() -> Self {
        Self {
            prefix: ".thumbnails/".into(),
            content_type: "image/jpeg".into(),
        }
    }
}

/// Uploads freshly written thumbnails to the photo storage and points
/// `thumbnailUrl` at the uploaded copy.
///
/// The default prefix is a dot-directory so the uploaded thumbnails are
/// skipped by the hidden-segment exclusion on the next listing.
#[derive(Debug, Default)]
pub struct ThumbnailStoragePlugin {
    options: ThumbnailStorageOptions,
}

impl ThumbnailStoragePlugin {
    pub fn new(options: ThumbnailStorageOptions) -> Self {
        Self { options }
    }

    pub fn key_for(&self, thumbnail_path: &Path) -> String {
        let name = thumbnail_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!("{}{name}", self.options.prefix)
    }
}

impl Plugin for ThumbnailStoragePlugin {
    fn name(&self) -> &str {
        THUMBNAIL_STORAGE
    }

    fn init(self: Arc<Self>, ctx: &mut PluginInitContext<'_>) -> Result<(), PluginError> {
        let opts = UploadOptions {
            content_type: Some(self.options.content_type.clone()),
        };
        ctx.hooks.on(EventKind::AfterPhotoProcess, THUMBNAIL_STORAGE, move |event, hook| {
            let HookEvent::AfterPhotoProcess {
                item,
                thumbnail_path: Some(path),
                ..
            } = event
            else {
                return Ok(());
            };
            let path: &Path = path;
            let data = std::fs::read(path)
                .map_err(|e| PluginError::hook(format!("{}: {e}", path.display())))?;
            let key = self.key_for(path);
            hook.storage
                .upload_file(&key, &data, &opts, None)
                .map_err(PluginError::hook)?;
            item.thumbnail_url = hook.storage.generate_public_url(&key);
            hook.run.increment("thumbnail-storage.uploaded", 1);
            tracing::debug!(key, "thumbnail uploaded");
            Ok(())
        });
        Ok(())
    }
}

// ============================================================================
// Repository sync
// ============================================================================

fn default_message() -> String {
    "Update photo manifest".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepoSyncOptions {
    /// Working tree holding the manifest.
    pub dir: PathBuf,
    #[serde(default)]
    pub push: bool,
    #[serde(default)]
    pub remote: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default = "default_message")]
    pub message: String,
    #[serde(default = "default_git")]
    pub git: PathBuf,
}

fn default_git() -> PathBuf {
    PathBuf::from("git")
}

/// Keeps the manifest in a git repository: fast-forward before the build,
/// commit (and optionally push) after the manifest is saved.
#[derive(Debug)]
pub struct RepoSyncPlugin {
    options: RepoSyncOptions,
}

impl RepoSyncPlugin {
    pub fn new(options: RepoSyncOptions) -> Self {
        Self { options }
    }

    fn git(&self, args: &[&str]) -> Result<std::process::Output, PluginError> {
        tracing::debug!(dir = %self.options.dir.display(), ?args, "git");
        Command::new(&self.options.git)
            .arg("-C")
            .arg(&self.options.dir)
            .args(args)
            .output()
            .map_err(|e| PluginError::hook(format!("git {}: {e}", args.join(" "))))
    }

    fn git_ok(&self, args: &[&str]) -> Result<(), PluginError> {
        let out = self.git(args)?;
        if out.status.success() {
            return Ok(());
        }
        Err(PluginError::hook(format!(
            "git {} exited with {}: {}",
            args.join(" "),
            out.status,
            String::from_utf8_lossy(&out.stderr).trim()
        )))
    }

    fn remote_args(&self) -> Vec<&str> {
        let mut args = Vec::new();
        if let Some(remote) = &self.options.remote {
            args.push(remote.as_str());
            if let Some(branch) = &self.options.branch {
                args.push(branch.as_str());
            }
        }
        args
    }

    /// `git pull --ff-only`.
    pub fn pull(&self) -> Result<(), PluginError> {
        let mut args = vec!["pull", "--ff-only"];
        args.extend(self.remote_args());
        self.git_ok(&args)
    }

    /// Stage `path`, commit if it changed, then push when configured.
    /// Returns whether a commit was made.
    pub fn commit(&self, path: &Path) -> Result<bool, PluginError> {
        let target = path
            .strip_prefix(&self.options.dir)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned();
        self.git_ok(&["add", "--", &target])?;
        let staged = self.git(&["diff", "--cached", "--quiet", "--", &target])?;
        if staged.status.success() {
            tracing::info!("manifest unchanged, nothing to commit");
            return Ok(false);
        }
        self.git_ok(&["commit", "-m", &self.options.message, "--", &target])?;
        if self.options.push {
            let mut args = vec!["push"];
            args.extend(self.remote_args());
            self.git_ok(&args)?;
        }
        Ok(true)
    }
}

impl Plugin for RepoSyncPlugin {
    fn name(&self) -> &str {
        REPO_SYNC
    }

    fn init(self: Arc<Self>, ctx: &mut PluginInitContext<'_>) -> Result<(), PluginError> {
        if !self.options.dir.is_dir() {
            return Err(PluginError::Init {
                plugin: REPO_SYNC.into(),
                message: format!("{} is not a directory", self.options.dir.display()),
            });
        }
        let this = Arc::clone(&self);
        ctx.hooks.on(EventKind::BeforeBuild, REPO_SYNC, move |_, _| this.pull());
        ctx.hooks.on(EventKind::AfterManifestSave, REPO_SYNC, move |event, hook| {
            if let HookEvent::AfterManifestSave { path, .. } = event
                && self.commit(path)?
            {
                hook.run.set("repo-sync.committed", true.into());
            }
            Ok(())
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ProcessScope;
    use crate::plugins::{HookContext, PluginHost, RunScope};
    use crate::storage::{MemoryProvider, ProviderRegistry, StorageManager, StorageProvider};
    use crate::test_helpers::{CountingGeocoder, item, object};
    use crate::types::{BuildTask, PickedExif};
    use tempfile::TempDir;

    fn load(plugins: Vec<Arc<dyn Plugin>>) -> PluginHost {
        PluginHost::load(
            &BuilderConfig::default(),
            &mut ProviderRegistry::default(),
            plugins,
        )
        .unwrap()
    }

    fn task() -> BuildTask {
        BuildTask {
            object: object("trip/a.jpg", 10),
            existing: None,
            live_video: None,
        }
    }

    #[test]
    fn thumbnail_uploaded_and_url_rewritten() {
        let tmp = TempDir::new().unwrap();
        let thumb = tmp.path().join("a-1234.jpg");
        std::fs::write(&thumb, b"jpeg").unwrap();

        let provider = Arc::new(MemoryProvider::new());
        let storage = StorageManager::new(provider.clone());
        let config = BuilderConfig::default();
        let run = RunScope::new();
        let ctx = HookContext {
            config: &config,
            storage: &storage,
            run: &run,
        };
        let host = load(vec![Arc::new(ThumbnailStoragePlugin::default())]);

        let t = task();
        let mut it = item(&t.object);
        host.emit(
            &mut HookEvent::AfterPhotoProcess {
                task: &t,
                item: &mut it,
                scope: ProcessScope::ALL,
                thumbnail_path: Some(&thumb),
            },
            &ctx,
        )
        .unwrap();

        assert_eq!(provider.get_file(".thumbnails/a-1234.jpg").unwrap(), Some(b"jpeg".to_vec()));
        assert_eq!(it.thumbnail_url, storage.generate_public_url(".thumbnails/a-1234.jpg"));
        assert_eq!(run.get("thumbnail-storage.uploaded"), Some(serde_json::json!(1)));
    }

    #[test]
    fn reused_thumbnail_not_uploaded() {
        let provider = Arc::new(MemoryProvider::new());
        let storage = StorageManager::new(provider.clone());
        let config = BuilderConfig::default();
        let run = RunScope::new();
        let ctx = HookContext {
            config: &config,
            storage: &storage,
            run: &run,
        };
        let host = load(vec![Arc::new(ThumbnailStoragePlugin::default())]);

        let t = task();
        let mut it = item(&t.object);
        let before = it.thumbnail_url.clone();
        host.emit(
            &mut HookEvent::AfterPhotoProcess {
                task: &t,
                item: &mut it,
                scope: ProcessScope::ALL,
                thumbnail_path: None,
            },
            &ctx,
        )
        .unwrap();
        assert!(provider.keys().is_empty());
        assert_eq!(it.thumbnail_url, before);
    }

    #[test]
    fn geocoding_plugin_enriches_only_metadata_scope() {
        let fake = Arc::new(CountingGeocoder::found("Lisbon"));
        let geocoder = Geocoder::new(
            fake.clone(),
            crate::geocoding::RateLimiter::new(std::time::Duration::ZERO),
        );
        let host = load(vec![Arc::new(GeocodingPlugin::new(geocoder))]);

        let storage = StorageManager::new(Arc::new(MemoryProvider::new()));
        let config = BuilderConfig::default();
        let run = RunScope::new();
        let ctx = HookContext {
            config: &config,
            storage: &storage,
            run: &run,
        };

        let t = task();
        let mut it = item(&t.object);
        it.exif = Some(PickedExif {
            gps_latitude: Some(38.7223),
            gps_longitude: Some(-9.1393),
            ..Default::default()
        });

        let thumbs_only = ProcessScope {
            thumbnails: true,
            metadata: false,
        };
        host.emit(
            &mut HookEvent::AfterPhotoProcess {
                task: &t,
                item: &mut it,
                scope: thumbs_only,
                thumbnail_path: None,
            },
            &ctx,
        )
        .unwrap();
        assert!(it.location.is_none());
        assert_eq!(fake.calls(), 0);

        host.emit(
            &mut HookEvent::AfterPhotoProcess {
                task: &t,
                item: &mut it,
                scope: ProcessScope::ALL,
                thumbnail_path: None,
            },
            &ctx,
        )
        .unwrap();
        assert_eq!(it.location.as_ref().and_then(|l| l.city.as_deref()), Some("Lisbon"));
        assert_eq!(run.get("geocoding.resolved"), Some(serde_json::json!(1)));
    }

    #[test]
    fn repo_sync_requires_directory() {
        let plugin = RepoSyncPlugin::new(RepoSyncOptions {
            dir: PathBuf::from("/nonexistent/repo"),
            push: false,
            remote: None,
            branch: None,
            message: default_message(),
            git: default_git(),
        });
        let err = PluginHost::load(
            &BuilderConfig::default(),
            &mut ProviderRegistry::default(),
            vec![Arc::new(plugin)],
        )
        .unwrap_err();
        assert!(matches!(err, PluginError::Init { plugin, .. } if plugin == REPO_SYNC));
    }

    #[test]
    fn repo_sync_options_parse() {
        let table: toml::Table = toml::from_str("dir = \"site\"\npush = true\n").unwrap();
        let opts: RepoSyncOptions = super::super::parse_options(REPO_SYNC, &table).unwrap();
        assert_eq!(opts.dir, PathBuf::from("site"));
        assert!(opts.push);
        assert_eq!(opts.message, "Update photo manifest");
    }

    #[test]
    fn configured_thumbnail_storage_resolves() {
        let mut table = toml::Table::new();
        table.insert("prefix".into(), toml::Value::String("t/".into()));
        let plugin = create(THUMBNAIL_STORAGE, &BuilderConfig::default(), &table).unwrap();
        assert_eq!(plugin.name(), THUMBNAIL_STORAGE);
        assert_eq!(
            ThumbnailStoragePlugin::new(parse_thumb(&table)).key_for(Path::new("/x/y.jpg")),
            "t/y.jpg"
        );
    }

    fn parse_thumb(table: &toml::Table) -> ThumbnailStorageOptions {
        super::super::parse_options(THUMBNAIL_STORAGE, table).unwrap()
    }

    #[cfg(unix)]
    #[test]
    #[ignore = "needs git on PATH"]
    fn repo_sync_commits_manifest() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path();
        let git = |args: &[&str]| {
            assert!(
                Command::new("git").arg("-C").arg(dir).args(args).status().unwrap().success()
            );
        };
        git(&["init", "-q"]);
        git(&["config", "user.email", "builder@example.org"]);
        git(&["config", "user.name", "builder"]);
        let manifest = dir.join("manifest.json");
        std::fs::write(&manifest, "{}").unwrap();

        let plugin = RepoSyncPlugin::new(RepoSyncOptions {
            dir: dir.to_path_buf(),
            push: false,
            remote: None,
            branch: None,
            message: default_message(),
            git: default_git(),
        });
        assert!(plugin.commit(&manifest).unwrap());
        assert!(!plugin.commit(&manifest).unwrap());
    }
}
