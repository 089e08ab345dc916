//! Manifest persistence and derived projections.
//!
//! The manifest is rebuilt from scratch on every run out of kept, skipped
//! and freshly processed items; nothing in it is patched in place. The
//! `cameras` and `lenses` lists are recomputed from `data` on every save.
//!
//! ## Versioning
//!
//! `version` is [`MANIFEST_VERSION`]. A file with another version is treated
//! as absent, which makes the run a full rebuild. Unknown fields are ignored
//! so newer files stay readable.

use crate::types::{CameraInfo, LensInfo, Manifest, ManifestItem};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const MANIFEST_VERSION: &str = "v1";

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("manifest {path} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl ManifestError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Empty manifest at the current version.
pub fn empty() -> Manifest {
    Manifest {
        version: MANIFEST_VERSION.to_string(),
        data: Vec::new(),
        cameras: Vec::new(),
        lenses: Vec::new(),
    }
}

/// Read the previous manifest.
///
/// `Ok(None)` when the file does not exist or was written by an
/// incompatible version. Unparseable JSON is an error: silently rebuilding
/// over a damaged file would hide the damage.
pub fn load(path: &Path) -> Result<Option<Manifest>, ManifestError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ManifestError::io(path, e)),
    };
    let manifest: Manifest = serde_json::from_str(&content).map_err(|source| ManifestError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    if manifest.version != MANIFEST_VERSION {
        tracing::warn!(
            found = %manifest.version,
            expected = MANIFEST_VERSION,
            "manifest version changed, rebuilding everything"
        );
        return Ok(None);
    }
    Ok(Some(manifest))
}

/// Write the manifest through a temp file in the same directory, so readers
/// never see a half-written file.
pub fn save(manifest: &Manifest, path: &Path) -> Result<(), ManifestError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(|e| ManifestError::io(dir, e))?;
    let json = serde_json::to_vec_pretty(manifest).map_err(|source| ManifestError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| ManifestError::io(dir, e))?;
    tmp.write_all(&json)
        .and_then(|()| tmp.write_all(b"\n"))
        .map_err(|e| ManifestError::io(tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| ManifestError::io(path, e.error))?;
    Ok(())
}

/// Previous items by storage key.
pub fn index_by_key(manifest: Option<Manifest>) -> HashMap<String, ManifestItem> {
    manifest
        .map(|m| m.data)
        .unwrap_or_default()
        .into_iter()
        .map(|item| (item.s3_key.clone(), item))
        .collect()
}

fn display_name(make: Option<&str>, model: &str) -> String {
    match make {
        Some(make) if !model.to_lowercase().starts_with(&make.to_lowercase()) => {
            format!("{make} {model}")
        }
        _ => model.to_string(),
    }
}

/// Distinct cameras in `items`, sorted by display name.
pub fn cameras(items: &[ManifestItem]) -> Vec<CameraInfo> {
    let set: BTreeSet<(String, String, String)> = items
        .iter()
        .filter_map(|item| item.exif.as_ref())
        .filter_map(|exif| {
            let make = exif.make.as_deref()?.trim();
            let model = exif.model.as_deref()?.trim();
            Some((display_name(Some(make), model), make.to_string(), model.to_string()))
        })
        .collect();
    set.into_iter()
        .map(|(display_name, make, model)| CameraInfo {
            make,
            model,
            display_name,
        })
        .collect()
}

/// Distinct lenses in `items`, sorted by display name.
pub fn lenses(items: &[ManifestItem]) -> Vec<LensInfo> {
    let set: BTreeSet<(String, Option<String>, String)> = items
        .iter()
        .filter_map(|item| item.exif.as_ref())
        .filter_map(|exif| {
            let model = exif.lens_model.as_deref()?.trim();
            let make = exif.lens_make.as_deref().map(str::trim).filter(|m| !m.is_empty());
            Some((display_name(make, model), make.map(String::from), model.to_string()))
        })
        .collect();
    set.into_iter()
        .map(|(display_name, make, model)| LensInfo {
            make,
            model,
            display_name,
        })
        .collect()
}

/// Newest capture first; ties broken by id so output is stable.
pub fn sort_items(items: &mut [ManifestItem]) {
    items.sort_by(|a, b| b.date_taken.cmp(&a.date_taken).then_with(|| a.id.cmp(&b.id)));
}

/// Sort `items` and derive the camera and lens lists.
pub fn assemble(mut items: Vec<ManifestItem>) -> Manifest {
    sort_items(&mut items);
    Manifest {
        version: MANIFEST_VERSION.to_string(),
        cameras: cameras(&items),
        lenses: lenses(&items),
        data: items,
    }
}

/// Previous entries whose key is no longer listed.
pub fn deleted<'a>(
    previous: &'a HashMap<String, ManifestItem>,
    listed: &HashSet<&str>,
) -> Vec<&'a ManifestItem> {
    let mut gone: Vec<&ManifestItem> = previous
        .values()
        .filter(|item| !listed.contains(item.s3_key.as_str()))
        .collect();
    gone.sort_by(|a, b| a.s3_key.cmp(&b.s3_key));
    gone
}

/// Delete `<id>.jpg` files in `dir` whose id is not in `keep`.
pub fn remove_orphan_thumbnails(dir: &Path, keep: &HashSet<&str>) -> io::Result<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let mut removed = 0;
    for entry in entries {
        let path = entry?.path();
        if path.extension().is_none_or(|ext| ext != "jpg") {
            continue;
        }
        let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if !keep.contains(id) {
            fs::remove_file(&path)?;
            tracing::debug!(path = %path.display(), "removed orphan thumbnail");
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{item, object};
    use crate::types::PickedExif;
    use chrono::Duration;
    use tempfile::TempDir;

    fn with_gear(key: &str, make: &str, model: &str, lens: Option<&str>) -> ManifestItem {
        let mut it = item(&object(key, 1));
        it.exif = Some(PickedExif {
            make: Some(make.into()),
            model: Some(model.into()),
            lens_model: lens.map(String::from),
            ..Default::default()
        });
        it
    }

    #[test]
    fn missing_file_is_none() {
        let tmp = TempDir::new().unwrap();
        assert!(load(&tmp.path().join("manifest.json")).unwrap().is_none());
    }

    #[test]
    fn save_then_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("out/manifest.json");
        let manifest = assemble(vec![item(&object("a.jpg", 1))]);
        save(&manifest, &path).unwrap();
        assert_eq!(load(&path).unwrap(), Some(manifest));
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn other_version_is_rebuilt() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("manifest.json");
        fs::write(&path, r#"{"version": "v0", "data": []}"#).unwrap();
        assert!(load(&path).unwrap().is_none());
    }

    #[test]
    fn corrupt_manifest_is_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("manifest.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(load(&path), Err(ManifestError::Json { .. })));
    }

    #[test]
    fn cameras_deduplicated_and_named() {
        let items = vec![
            with_gear("a.jpg", "FUJIFILM", "X-T5", Some("XF23mmF1.4 R LM WR")),
            with_gear("b.jpg", "FUJIFILM", "X-T5", Some("XF23mmF1.4 R LM WR")),
            with_gear("c.jpg", "Canon", "Canon EOS R5", None),
        ];
        let cams = cameras(&items);
        let names: Vec<&str> = cams.iter().map(|c| c.display_name.as_str()).collect();
        assert_eq!(names, vec!["Canon EOS R5", "FUJIFILM X-T5"]);
        let lens = lenses(&items);
        assert_eq!(lens.len(), 1);
        assert_eq!(lens[0].display_name, "XF23mmF1.4 R LM WR");
    }

    #[test]
    fn sorted_newest_first() {
        let mut old = item(&object("old.jpg", 1));
        old.date_taken -= Duration::days(10);
        let new = item(&object("new.jpg", 1));
        let manifest = assemble(vec![old, new]);
        let keys: Vec<&str> = manifest.data.iter().map(|i| i.s3_key.as_str()).collect();
        assert_eq!(keys, vec!["new.jpg", "old.jpg"]);
    }

    #[test]
    fn deleted_entries_found() {
        let previous = index_by_key(Some(assemble(vec![
            item(&object("b.jpg", 1)),
            item(&object("c.jpg", 1)),
        ])));
        let listed: HashSet<&str> = ["a.jpg", "b.jpg"].into_iter().collect();
        let gone = deleted(&previous, &listed);
        assert_eq!(gone.len(), 1);
        assert_eq!(gone[0].s3_key, "c.jpg");
    }

    #[test]
    fn orphan_thumbnails_removed() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("keep-1.jpg"), b"x").unwrap();
        fs::write(tmp.path().join("gone-2.jpg"), b"x").unwrap();
        fs::write(tmp.path().join("notes.txt"), b"x").unwrap();
        let keep: HashSet<&str> = ["keep-1"].into_iter().collect();
        assert_eq!(remove_orphan_thumbnails(tmp.path(), &keep).unwrap(), 1);
        assert!(tmp.path().join("keep-1.jpg").exists());
        assert!(!tmp.path().join("gone-2.jpg").exists());
        assert!(tmp.path().join("notes.txt").exists());
    }
}
