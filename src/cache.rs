//! Skip/process decisions for incremental builds.
//!
//! Fetching, decoding and running ExifTool dominate a build, so every listed
//! object first goes through [`decide`], a pure function of the previous
//! manifest entry, the listing snapshot and the force flags. It never touches
//! the network or the disk, which lets a run filter thousands of unchanged
//! objects before any expensive work starts.
//!
//! # Change signals
//!
//! An existing entry is considered stale when any of these differ from the
//! listing:
//!
//! - `lastModified` is newer than the one recorded
//! - `size` changed
//! - both sides carry an etag and they differ (backends without a useful
//!   modification time, such as the git-hosting provider, rely on this)
//! - the paired live-photo video appeared, disappeared or changed key
//!
//! The content digest is computed after fetch; the pipeline uses it to reuse
//! an unchanged thumbnail even when the listing says the object changed.
//!
//! # Force flags
//!
//! | Flag | Reprocesses |
//! |---|---|
//! | `force` | everything |
//! | `force_manifest` | metadata-derived fields (EXIF, title, tone, video, location) |
//! | `force_thumbnails` | thumbnail + thumb hash |
//!
//! Whatever a flag does not cover is carried over from the previous entry.

use crate::types::{BuildTask, ManifestItem, StorageObject, VideoSource};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Independent force switches from the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForceFlags {
    pub force: bool,
    pub force_manifest: bool,
    pub force_thumbnails: bool,
}

impl ForceFlags {
    pub fn any(&self) -> bool {
        self.force || self.force_manifest || self.force_thumbnails
    }
}

/// Which derived data a task has to recompute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessScope {
    pub thumbnails: bool,
    pub metadata: bool,
}

impl ProcessScope {
    pub const ALL: Self = Self {
        thumbnails: true,
        metadata: true,
    };
}

/// Why an existing entry is being reprocessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeReason {
    Modified,
    Resized,
    EtagChanged,
    PairingChanged,
    Forced,
}

impl fmt::Display for ChangeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Modified => "modified",
            Self::Resized => "size changed",
            Self::EtagChanged => "etag changed",
            Self::PairingChanged => "live photo pairing changed",
            Self::Forced => "forced",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    /// No previous entry.
    New,
    /// Previous entry exists but (part of) it must be recomputed.
    Processed {
        scope: ProcessScope,
        reason: ChangeReason,
    },
    /// Previous entry is current; it is copied into the new manifest as is.
    Skipped,
}

impl Decision {
    pub fn scope(&self) -> Option<ProcessScope> {
        match self {
            Self::New => Some(ProcessScope::ALL),
            Self::Processed { scope, .. } => Some(*scope),
            Self::Skipped => None,
        }
    }
}

fn video_key(video: Option<&VideoSource>) -> Option<&str> {
    match video {
        Some(VideoSource::LivePhoto { video_key, .. }) => Some(video_key),
        _ => None,
    }
}

/// First listing signal that says `existing` no longer matches the source.
pub fn change_reason(
    existing: &ManifestItem,
    object: &StorageObject,
    live_video: Option<&StorageObject>,
) -> Option<ChangeReason> {
    if object.last_modified > existing.last_modified {
        return Some(ChangeReason::Modified);
    }
    if object.size != existing.size {
        return Some(ChangeReason::Resized);
    }
    if let (Some(now), Some(before)) = (&object.etag, &existing.source_etag)
        && now != before
    {
        return Some(ChangeReason::EtagChanged);
    }
    let paired_now = live_video.map(|v| v.key.as_str());
    let paired_before = video_key(existing.video.as_ref());
    let had_motion = matches!(existing.video, Some(VideoSource::MotionPhoto { .. }));
    if paired_now != paired_before && !(had_motion && paired_now.is_none()) {
        return Some(ChangeReason::PairingChanged);
    }
    None
}

/// Decide what a task needs.
pub fn decide(task: &BuildTask, flags: &ForceFlags) -> Decision {
    let Some(existing) = &task.existing else {
        return Decision::New;
    };
    if flags.force {
        return Decision::Processed {
            scope: ProcessScope::ALL,
            reason: ChangeReason::Forced,
        };
    }
    if let Some(reason) = change_reason(existing, &task.object, task.live_video.as_ref()) {
        return Decision::Processed {
            scope: ProcessScope::ALL,
            reason,
        };
    }
    if flags.force_manifest || flags.force_thumbnails {
        return Decision::Processed {
            scope: ProcessScope {
                thumbnails: flags.force_thumbnails,
                metadata: flags.force_manifest,
            },
            reason: ChangeReason::Forced,
        };
    }
    Decision::Skipped
}

/// SHA-256 of `bytes`, hex encoded.
pub fn digest(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Per-run outcome counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStats {
    pub new: u32,
    pub processed: u32,
    pub skipped: u32,
    pub failed: u32,
    pub deleted: u32,
}

impl BuildStats {
    pub fn record(&mut self, decision: &Decision) {
        match decision {
            Decision::New => self.new += 1,
            Decision::Processed { .. } => self.processed += 1,
            Decision::Skipped => self.skipped += 1,
        }
    }

    pub fn fail(&mut self) {
        self.failed += 1;
    }

    /// Tasks seen, deletions excluded.
    pub fn total(&self) -> u32 {
        self.new + self.processed + self.skipped + self.failed
    }

    /// Whether the run changed anything in the manifest.
    pub fn has_changes(&self) -> bool {
        self.new > 0 || self.processed > 0 || self.deleted > 0
    }
}

impl fmt::Display for BuildStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} new, {} processed, {} skipped, {} deleted",
            self.new, self.processed, self.skipped, self.deleted
        )?;
        if self.failed > 0 {
            write!(f, ", {} failed", self.failed)?;
        }
        Ok(())
    }
}
