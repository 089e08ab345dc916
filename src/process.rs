//! Per-photo pipeline.
//!
//! Each accepted [`BuildTask`] goes through these steps, each at most once:
//!
//! ```text
//!  1. fetch         storage.get_file(key), retried on transient errors
//!  2. normalize     legacy bitmap → PNG, everything else passes through
//!  3. digest        SHA-256 of the normalized bytes
//!  4. thumbnail     fixed-width JPEG + ThumbHash → thumbnail_dir/<id>.jpg
//!  5. metadata      ExifTool on a scratch copy of the raw bytes
//!  6. HDR           gain-map markers in the metadata
//!  7. motion video  trailer embedded in the raw bytes (see `motion`)
//!  8. live video    paired video file from the listing
//!  9. conflict      7 and 8 both present → the task fails
//! 10. tone          luminance histogram of a downsampled copy
//! 11. assemble      ManifestItem
//! ```
//!
//! The [`ProcessScope`] from the cache engine decides which halves run. A
//! thumbnail-only refresh carries metadata fields over from the previous
//! entry and the other way round. When the content digest did not change
//! and the thumbnail file is still on disk, the old thumbnail is reused
//! unless thumbnails are forced.
//!
//! Failures split three ways. [`ProcessError`] fails only this task.
//! Unreadable metadata and unusable motion markers are logged and leave the
//! field empty. Plugin hook errors from [`run_task`] abort the run.

use crate::cache::{self, Decision, ForceFlags, ProcessScope};
use crate::geocoding::cache_key;
use crate::config::BuilderConfig;
use crate::exif::{ExifError, MetadataExtractor, RawMetadata};
use crate::imaging::{self, BackendError, ImageBackend, ThumbnailConfig};
use crate::motion;
use crate::naming;
use crate::plugins::{HookContext, HookEvent, PluginError, PluginHost};
use crate::retry::{Backoff, retry};
use crate::storage::{StorageError, StorageManager};
use crate::types::{BuildTask, LocationInfo, ManifestItem, PickedExif, VideoSource};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("fetch failed: {0}")]
    Storage(#[from] StorageError),
    #[error("source object disappeared: {0}")]
    SourceMissing(String),
    #[error("image processing failed: {0}")]
    Imaging(#[from] BackendError),
    #[error("metadata extraction failed: {0}")]
    Metadata(#[source] ExifError),
    #[error("both a live photo video ({live}) and an embedded motion video at offset {offset}")]
    ConflictingVideo { live: String, offset: u64 },
    #[error("writing thumbnail {path}: {source}")]
    Thumbnail {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Pipeline knobs resolved from `[processing]` and `[output]`.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub thumbnail_dir: PathBuf,
    pub thumbnail_url_prefix: String,
    pub digest_suffix_len: usize,
    pub thumbnail: ThumbnailConfig,
    pub tone_sample_edge: u32,
    pub enable_live_photo: bool,
    pub enable_motion_photo: bool,
    /// Decimals at which a previous location still matches fresh GPS.
    pub location_precision: u32,
    pub fetch_backoff: Backoff,
}

impl PipelineSettings {
    pub fn from_config(config: &BuilderConfig) -> Self {
        let p = &config.processing;
        Self {
            thumbnail_dir: config.output.thumbnail_dir.clone(),
            thumbnail_url_prefix: config.output.thumbnail_url_prefix.clone(),
            digest_suffix_len: p.digest_suffix_len,
            thumbnail: ThumbnailConfig::new(p.thumbnail_width, u32::from(p.thumbnail_quality)),
            tone_sample_edge: p.tone_sample_edge,
            enable_live_photo: p.enable_live_photo,
            enable_motion_photo: p.enable_motion_photo,
            location_precision: config.geocoding.precision,
            fetch_backoff: Backoff::default(),
        }
    }

    pub fn thumbnail_path(&self, id: &str) -> PathBuf {
        self.thumbnail_dir.join(format!("{id}.jpg"))
    }

    pub fn thumbnail_url(&self, id: &str) -> String {
        format!("{}/{id}.jpg", self.thumbnail_url_prefix.trim_end_matches('/'))
    }

    /// Previous location to keep for `exif`, read fresh from the source.
    /// Dropped once the GPS is gone or has moved to another cell.
    fn carried_location(
        &self,
        previous: Option<&LocationInfo>,
        exif: Option<&PickedExif>,
    ) -> Option<LocationInfo> {
        let previous = previous?;
        let (lat, lng) = exif.and_then(PickedExif::gps)?;
        let p = self.location_precision;
        (cache_key(lat, lng, p) == cache_key(previous.latitude, previous.longitude, p))
            .then(|| previous.clone())
    }
}

/// A finished item plus the thumbnail written for it, if any.
#[derive(Debug, Clone)]
pub struct Processed {
    pub item: ManifestItem,
    /// Set only when a new thumbnail file was written in this run.
    pub thumbnail_path: Option<PathBuf>,
}

/// What came back for one dispatched task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum TaskOutcome {
    Done {
        decision: Decision,
        item: Box<ManifestItem>,
    },
    Failed {
        key: String,
        error: String,
    },
}

impl TaskOutcome {
    pub fn key(&self) -> &str {
        match self {
            Self::Done { item, .. } => &item.s3_key,
            Self::Failed { key, .. } => key,
        }
    }
}

/// The collaborators one task needs.
pub struct Pipeline<'a> {
    pub storage: &'a StorageManager,
    pub backend: &'a dyn ImageBackend,
    pub extractor: &'a dyn MetadataExtractor,
    pub settings: &'a PipelineSettings,
}

struct Metadata {
    exif: Option<PickedExif>,
    title: String,
    description: String,
    tags: Vec<String>,
    date_taken: chrono::DateTime<chrono::Utc>,
    is_hdr: bool,
    video: Option<VideoSource>,
}

impl Metadata {
    fn carried(existing: &ManifestItem) -> Self {
        Self {
            exif: existing.exif.clone(),
            title: existing.title.clone(),
            description: existing.description.clone(),
            tags: existing.tags.clone(),
            date_taken: existing.date_taken,
            is_hdr: existing.is_hdr,
            video: existing.video.clone(),
        }
    }
}

fn merge_tags(keywords: Vec<String>, directories: Vec<String>) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for tag in keywords.into_iter().chain(directories) {
        if !tags.iter().any(|t| t.eq_ignore_ascii_case(&tag)) {
            tags.push(tag);
        }
    }
    tags
}

impl Pipeline<'_> {
    fn fetch(&self, key: &str) -> Result<Vec<u8>, ProcessError> {
        retry(&self.settings.fetch_backoff, StorageError::is_retryable, |_| {
            self.storage.get_file(key)
        })?
        .ok_or_else(|| ProcessError::SourceMissing(key.to_string()))
    }

    fn extract(&self, key: &str, raw: &[u8], extension: &str) -> Result<RawMetadata, ProcessError> {
        match self.extractor.extract(raw, extension) {
            Ok(meta) => Ok(meta),
            Err(e) if e.fails_task() => Err(ProcessError::Metadata(e)),
            Err(e) => {
                tracing::warn!(key, error = %e, "metadata unavailable");
                Ok(RawMetadata::default())
            }
        }
    }

    fn metadata(&self, task: &BuildTask, raw: &[u8], extension: &str) -> Result<Metadata, ProcessError> {
        let key = task.object.key.as_str();
        let meta = self.extract(key, raw, extension)?;

        let motion = if self.settings.enable_motion_photo {
            motion::detect(key, raw, &meta)
        } else {
            None
        };
        let live = match &task.live_video {
            Some(video) if self.settings.enable_live_photo => Some(VideoSource::LivePhoto {
                video_key: video.key.clone(),
                video_url: self.storage.generate_public_url(&video.key),
            }),
            _ => None,
        };
        let video = match (live, motion) {
            (Some(VideoSource::LivePhoto { video_key, .. }), Some(trailer)) => {
                return Err(ProcessError::ConflictingVideo {
                    live: video_key,
                    offset: trailer.offset,
                });
            }
            (Some(live), None) => Some(live),
            (None, Some(trailer)) => {
                tracing::debug!(key, offset = trailer.offset, method = ?trailer.method, "motion photo");
                Some(trailer.to_video_source())
            }
            _ => None,
        };

        let picked = meta.pick();
        Ok(Metadata {
            exif: (picked != PickedExif::default()).then_some(picked),
            title: meta.title().unwrap_or_else(|| naming::title_from_key(key)),
            description: meta.description().unwrap_or_default(),
            tags: merge_tags(meta.keywords(), naming::directory_tags(key)),
            date_taken: meta.date_taken().unwrap_or(task.object.last_modified),
            is_hdr: meta.is_hdr(),
            video,
        })
    }

    fn write_thumbnail(&self, id: &str, data: &[u8]) -> Result<PathBuf, ProcessError> {
        let path = self.settings.thumbnail_path(id);
        let io_err = |source| ProcessError::Thumbnail {
            path: path.clone(),
            source,
        };
        fs::create_dir_all(&self.settings.thumbnail_dir).map_err(io_err)?;
        fs::write(&path, data).map_err(io_err)?;
        Ok(path)
    }

    /// Run the pipeline for one task.
    pub fn process(
        &self,
        task: &BuildTask,
        scope: ProcessScope,
        flags: &ForceFlags,
    ) -> Result<Processed, ProcessError> {
        let key = task.object.key.as_str();
        let existing = task.existing.as_ref();
        let extension = naming::extension(key).unwrap_or_default();
        let id = naming::photo_id(key, self.settings.digest_suffix_len);

        let raw = self.fetch(key)?;
        let normalized = imaging::normalize(self.backend, &raw, &extension)?;
        let digest = cache::digest(&normalized.data);

        // Previous thumbnail stays valid for identical content.
        let reusable = existing.filter(|e| {
            !(flags.force || flags.force_thumbnails)
                && e.digest == digest
                && self.settings.thumbnail_path(&id).exists()
        });
        let want_thumbnail = (scope.thumbnails || existing.is_none()) && reusable.is_none();
        let want_metadata = scope.metadata || existing.is_none();

        let derivatives = imaging::render_derivatives(
            self.backend,
            &normalized.data,
            want_thumbnail.then_some(&self.settings.thumbnail),
            want_metadata.then_some(self.settings.tone_sample_edge),
        )?;
        let (width, height) = match &derivatives {
            Some(d) => (d.dimensions.width, d.dimensions.height),
            None => imaging::get_dimensions(self.backend, &normalized.data)?,
        };

        let (thumbnail_url, thumb_hash, thumbnail_path) =
            match derivatives.as_ref().and_then(|d| d.thumbnail.as_ref()) {
                Some(thumb) => {
                    let path = self.write_thumbnail(&id, &thumb.data)?;
                    (self.settings.thumbnail_url(&id), Some(thumb.thumb_hash.clone()), Some(path))
                }
                None => {
                    let prev = reusable.or(existing);
                    (
                        prev.map(|e| e.thumbnail_url.clone())
                            .unwrap_or_else(|| self.settings.thumbnail_url(&id)),
                        prev.and_then(|e| e.thumb_hash.clone()),
                        None,
                    )
                }
            };
        if reusable.is_some() && scope.thumbnails {
            tracing::debug!(key, "content unchanged, thumbnail reused");
        }

        let (meta, tone_analysis) = match existing {
            Some(prev) if !want_metadata => (Metadata::carried(prev), prev.tone_analysis.clone()),
            _ => (
                self.metadata(task, &raw, &extension)?,
                derivatives.and_then(|d| d.tone),
            ),
        };

        let previous = existing.and_then(|e| e.location.as_ref());
        let location = if want_metadata {
            self.settings.carried_location(previous, meta.exif.as_ref())
        } else {
            previous.cloned()
        };

        let item = ManifestItem {
            id,
            s3_key: key.to_string(),
            original_url: self.storage.generate_public_url(key),
            thumbnail_url,
            thumb_hash,
            width,
            height,
            aspect_ratio: imaging::aspect_ratio(width, height),
            format: normalized.format,
            digest,
            last_modified: task.object.last_modified,
            size: task.object.size,
            source_etag: task.object.etag.clone(),
            exif: meta.exif,
            tone_analysis,
            location,
            video: meta.video,
            is_hdr: meta.is_hdr,
            title: meta.title,
            description: meta.description,
            date_taken: meta.date_taken,
            tags: meta.tags,
        };
        Ok(Processed {
            item,
            thumbnail_path,
        })
    }
}

/// Run one task with its photo hooks.
///
/// Pipeline failures come back as [`TaskOutcome::Failed`]; only hook errors
/// are returned as `Err`, since they abort the run.
pub fn run_task(
    pipeline: &Pipeline<'_>,
    plugins: &PluginHost,
    ctx: &HookContext<'_>,
    task: &BuildTask,
    decision: Decision,
    flags: &ForceFlags,
) -> Result<TaskOutcome, PluginError> {
    let key = task.object.key.as_str();
    let span = tracing::info_span!("photo", key);
    let _enter = span.enter();
    let scope = decision.scope().unwrap_or(ProcessScope::ALL);

    plugins.emit(&mut HookEvent::BeforePhotoProcess { task }, ctx)?;
    match pipeline.process(task, scope, flags) {
        Ok(Processed {
            mut item,
            thumbnail_path,
        }) => {
            plugins.emit(
                &mut HookEvent::AfterPhotoProcess {
                    task,
                    item: &mut item,
                    scope,
                    thumbnail_path: thumbnail_path.as_deref(),
                },
                ctx,
            )?;
            tracing::debug!(?decision, "processed");
            Ok(TaskOutcome::Done {
                decision,
                item: Box::new(item),
            })
        }
        Err(e) => {
            tracing::error!(error = %e, "photo failed");
            Ok(TaskOutcome::Failed {
                key: key.to_string(),
                error: e.to_string(),
            })
        }
    }
}

/// Whether `path` is a thumbnail this pipeline would write for `id`.
pub fn is_thumbnail_for(path: &Path, id: &str) -> bool {
    path.file_stem().is_some_and(|s| s == id) && path.extension().is_some_and(|e| e == "jpg")
}
