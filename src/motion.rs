//! Motion-photo trailer detection.
//!
//! A motion photo is a still image with an MP4/QuickTime clip appended to the
//! same file. Two metadata layouts point at the clip:
//!
//! - **Container directory** (current Google/Samsung format): a list of items
//!   with a semantic tag and a byte length. The `MotionPhoto` item's length is
//!   measured from the end of the file, so `offset = file_len - length`.
//! - **Legacy micro video**: a `MicroVideo` / `MotionPhoto` flag plus a single
//!   `MicroVideoOffset`. Writers disagree about whether it counts from the start
//!   or from the end, so both readings are tried, start first, and the first
//!   one that validates is used. This is a heuristic and not a parse of any
//!   formal layout.
//!
//! A candidate window is accepted only if it is at least [`MIN_VIDEO_SIZE`]
//! bytes and an ISO-BMFF box type (`ftyp`, `moov`, `mdat`, `wide`) appears in
//! its first [`SIGNATURE_WINDOW`] bytes. Metadata that flags a video but
//! yields no valid window is logged and otherwise ignored; the photo is still
//! manifested without one.

use crate::exif::RawMetadata;
use crate::types::VideoSource;

/// Smallest trailer accepted as a real video.
pub const MIN_VIDEO_SIZE: u64 = 8 * 1024;

/// How far into the candidate window the container signature may start.
pub const SIGNATURE_WINDOW: usize = 32;

const BOX_TYPES: [&[u8; 4]; 4] = [b"ftyp", b"moov", b"mdat", b"wide"];

/// How a trailer was located.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Directory,
    LegacyFromStart,
    LegacyFromEnd,
}

/// A validated embedded video.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MotionTrailer {
    pub offset: u64,
    pub size: u64,
    pub presentation_timestamp_us: Option<i64>,
    pub method: Method,
}

impl MotionTrailer {
    pub fn to_video_source(&self) -> VideoSource {
        VideoSource::MotionPhoto {
            offset: self.offset,
            size: self.size,
            presentation_timestamp_us: self.presentation_timestamp_us,
        }
    }
}

/// Whether `window` starts like an ISO-BMFF video.
pub fn has_video_signature(window: &[u8]) -> bool {
    let head = &window[..window.len().min(SIGNATURE_WINDOW)];
    head.windows(4)
        .any(|w| BOX_TYPES.iter().any(|b| w == b.as_slice()))
}

/// Check a candidate `(offset, size)` against the file bytes.
pub fn validate(data: &[u8], offset: u64, size: u64) -> bool {
    let len = data.len() as u64;
    if size < MIN_VIDEO_SIZE || offset >= len || size > len - offset {
        return false;
    }
    has_video_signature(&data[offset as usize..])
}

fn directory_candidate(data: &[u8], meta: &RawMetadata) -> Option<(u64, u64)> {
    let item = meta.directory().into_iter().find(|item| {
        item.semantic.eq_ignore_ascii_case("MotionPhoto")
            || (item.length > 0 && item.mime.starts_with("video/"))
    })?;
    let len = data.len() as u64;
    if item.length == 0 || item.length > len {
        return None;
    }
    Some((len - item.length, item.length))
}

fn flagged(meta: &RawMetadata) -> bool {
    meta.integer("MotionPhoto") == Some(1) || meta.integer("MicroVideo") == Some(1)
}

/// Locate an embedded video in the raw (pre-normalization) bytes.
pub fn detect(key: &str, data: &[u8], meta: &RawMetadata) -> Option<MotionTrailer> {
    let timestamp = meta
        .number("MotionPhotoPresentationTimestampUs")
        .or_else(|| meta.number("MicroVideoPresentationTimestampUs"))
        .map(|n| n as i64);
    let trailer = |offset, size, method| MotionTrailer {
        offset,
        size,
        presentation_timestamp_us: timestamp,
        method,
    };

    if let Some((offset, size)) = directory_candidate(data, meta) {
        if validate(data, offset, size) {
            return Some(trailer(offset, size, Method::Directory));
        }
        tracing::debug!(key, offset, size, "directory video entry failed validation");
    }

    if flagged(meta)
        && let Some(raw_offset) = meta.integer("MicroVideoOffset")
    {
        let len = data.len() as u64;
        if raw_offset < len {
            let (offset, size) = (raw_offset, len - raw_offset);
            if validate(data, offset, size) {
                return Some(trailer(offset, size, Method::LegacyFromStart));
            }
        }
        if raw_offset <= len {
            let (offset, size) = (len - raw_offset, raw_offset);
            if validate(data, offset, size) {
                return Some(trailer(offset, size, Method::LegacyFromEnd));
            }
        }
    }

    if flagged(meta) || directory_candidate(data, meta).is_some() {
        tracing::warn!(key, "motion photo flagged but no valid video trailer found");
    }
    None
}
