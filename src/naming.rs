//! Storage key conventions.
//!
//! Keys are forward-slash paths relative to the provider root, whatever the
//! backend. This module owns everything derived purely from a key: its
//! normalized form, its media kind, the display title of its basename, and
//! the stable photo id.
//!
//! ## Photo ids
//!
//! An id is the sanitized basename plus a short SHA-256 suffix of the full
//! key: `2024/trip/IMG_0042.jpg` → `IMG_0042-3fa9c1d2`. The suffix keeps
//! ids unique when two directories contain the same filename, and because
//! it only depends on the key, the id is stable across runs.
//!
//! ## Display titles
//!
//! Basenames may follow the `NNN-name` ordering convention; the number is
//! dropped and dashes/underscores become spaces:
//! - `001-Morning-Fog.jpg` → "Morning Fog"
//! - `IMG_0042.jpg` → "IMG 0042"

use sha2::{Digest, Sha256};

/// Extensions the decoder handles. `bmp` is accepted and normalized.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "tif", "tiff", "webp", "bmp"];

/// Extensions treated as the video half of a live photo.
pub const VIDEO_EXTENSIONS: &[&str] = &["mov", "mp4"];

/// Legacy bitmap containers that are re-encoded before hashing.
const LEGACY_EXTENSIONS: &[&str] = &["bmp"];

const MAX_SLUG_LEN: usize = 80;

/// Normalize a key: backslashes become slashes, leading `./` and `/` are
/// stripped and repeated separators collapse.
pub fn normalize_key(raw: &str) -> String {
    let replaced = raw.replace('\\', "/");
    replaced
        .split('/')
        .filter(|seg| !seg.is_empty() && *seg != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Lowercased extension of the key's basename.
pub fn extension(key: &str) -> Option<String> {
    let base = basename(key);
    let dot = base.rfind('.')?;
    if dot == 0 {
        return None;
    }
    Some(base[dot + 1..].to_ascii_lowercase())
}

pub fn basename(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Basename without its extension.
pub fn stem(key: &str) -> &str {
    let base = basename(key);
    match base.rfind('.') {
        Some(dot) if dot > 0 => &base[..dot],
        _ => base,
    }
}

/// Directory part of the key, empty for keys at the root.
pub fn dirname(key: &str) -> &str {
    match key.rfind('/') {
        Some(pos) => &key[..pos],
        None => "",
    }
}

pub fn is_image_key(key: &str) -> bool {
    extension(key).is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.as_str()))
}

pub fn is_video_key(key: &str) -> bool {
    extension(key).is_some_and(|e| VIDEO_EXTENSIONS.contains(&e.as_str()))
}

pub fn is_legacy_bitmap(extension: &str) -> bool {
    LEGACY_EXTENSIONS.contains(&extension.to_ascii_lowercase().as_str())
}

/// Whether any path segment is hidden (starts with a dot).
pub fn has_hidden_segment(key: &str) -> bool {
    key.split('/').any(|seg| seg.starts_with('.'))
}

/// Result of parsing a basename like `020-Morning-Fog`.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedName {
    /// Number prefix if present (e.g. `20` from `020-Morning-Fog`).
    pub number: Option<u32>,
    /// Name part after `NNN-`, or the full input when unnumbered.
    pub name: String,
    /// Name with dashes and underscores converted to spaces.
    pub display_title: String,
}

/// Parse a basename following the optional `NNN-name` convention.
pub fn parse_entry_name(name: &str) -> ParsedName {
    if let Some(dash_pos) = name.find('-') {
        let prefix = &name[..dash_pos];
        if let Ok(num) = prefix.parse::<u32>() {
            let raw = &name[dash_pos + 1..];
            return ParsedName {
                number: Some(num),
                name: raw.to_string(),
                display_title: to_display(raw),
            };
        }
    }
    ParsedName {
        number: None,
        name: name.to_string(),
        display_title: to_display(name),
    }
}

fn to_display(raw: &str) -> String {
    raw.replace(['-', '_'], " ").trim().to_string()
}

/// Fallback title for a key: display title of the stem, or the raw stem
/// when the name part is empty (`001.jpg`).
pub fn title_from_key(key: &str) -> String {
    let stem = stem(key);
    let parsed = parse_entry_name(stem);
    if parsed.display_title.is_empty() {
        stem.to_string()
    } else {
        parsed.display_title
    }
}

/// Directory segments of a key, used as implicit tags.
pub fn directory_tags(key: &str) -> Vec<String> {
    dirname(key)
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| parse_entry_name(s).display_title)
        .filter(|s| !s.is_empty())
        .collect()
}

/// Deterministic photo id: sanitized stem plus a truncated key hash.
pub fn photo_id(key: &str, suffix_len: usize) -> String {
    let digest = format!("{:x}", Sha256::digest(key.as_bytes()));
    let suffix = &digest[..suffix_len.clamp(4, digest.len())];
    let slug = sanitize_slug(stem(key));
    if slug.is_empty() {
        suffix.to_string()
    } else {
        format!("{slug}-{suffix}")
    }
}

/// Sanitize a string for use in ids, URLs and filenames.
///
/// - Replaces characters other than ASCII alphanumerics, `-` and `_` with dashes
/// - Collapses consecutive dashes into one
/// - Strips leading and trailing dashes
/// - Truncates to `MAX_SLUG_LEN` characters (breaks at last dash before limit)
pub fn sanitize_slug(title: &str) -> String {
    let mut collapsed = String::with_capacity(title.len());
    let mut prev_dash = false;
    for c in title.chars() {
        let c = if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            c
        } else {
            '-'
        };
        if c == '-' {
            if !prev_dash {
                collapsed.push('-');
            }
            prev_dash = true;
        } else {
            collapsed.push(c);
            prev_dash = false;
        }
    }

    let trimmed = collapsed.trim_matches('-');
    if trimmed.len() <= MAX_SLUG_LEN {
        trimmed.to_string()
    } else {
        let truncated = &trimmed[..MAX_SLUG_LEN];
        match truncated.rfind('-') {
            Some(pos) => truncated[..pos].to_string(),
            None => truncated.to_string(),
        }
    }
}
