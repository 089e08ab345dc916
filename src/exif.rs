//! Embedded metadata extraction.
//!
//! Metadata comes from [ExifTool](https://exiftool.org), run once per photo
//! against a scratch copy of the source bytes. The full JSON record is kept
//! as [`RawMetadata`]; the manifest only carries the [`PickedExif`]
//! whitelist, while the pipeline reads a handful of extra tags directly:
//!
//! | Field | Tags, first non-empty wins |
//! |---|---|
//! | title | `Title` → `ObjectName` → `XPTitle` → `Headline` |
//! | description | `Description` → `ImageDescription` → `Caption-Abstract` |
//! | keywords | `Keywords` + `Subject` (string or list) |
//! | capture date | `DateTimeOriginal` (+ `OffsetTimeOriginal`) → `CreateDate` |
//! | HDR | any gain-map tag, or a `GainMap` item in the container directory |
//!
//! # Process hygiene
//!
//! The scratch file is a [`tempfile::NamedTempFile`], removed on drop on every
//! exit path. Spawned children and live scratch paths are tracked in
//! process-wide registries, so the interrupt handler can kill the former with
//! [`terminate_all`] and delete the latter with [`remove_scratch_files`]
//! before a forced exit skips the destructors. Each invocation carries its
//! own timeout; hitting it kills the child and fails only that photo.

use crate::types::PickedExif;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExifError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to start {tool}: {source}")]
    Spawn {
        tool: String,
        source: std::io::Error,
    },
    #[error("metadata tool timed out after {0:?}")]
    Timeout(Duration),
    #[error("metadata tool exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("unreadable metadata output: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("metadata tool returned no record")]
    Empty,
    #[error("metadata extraction interrupted")]
    Interrupted,
}

impl ExifError {
    /// Errors that fail the photo instead of just dropping its metadata.
    pub fn fails_task(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Interrupted)
    }
}

/// Reads metadata from in-memory image bytes.
pub trait MetadataExtractor: Send + Sync {
    fn extract(&self, data: &[u8], extension: &str) -> Result<RawMetadata, ExifError>;
}

// ============================================================================
// Raw record
// ============================================================================

/// One ExifTool JSON record, keyed by tag name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawMetadata(Map<String, Value>);

impl From<Map<String, Value>> for RawMetadata {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Leading decimal number of a formatted value (`"35.0 mm"`, `"+51.5"`),
/// or a fraction (`"1/250"`).
fn parse_number(text: &str) -> Option<f64> {
    let text = text.trim();
    if let Some((num, den)) = text.split_once('/') {
        let num: f64 = num.trim().parse().ok()?;
        let den: f64 = den.trim().parse().ok()?;
        return (den != 0.0).then(|| num / den);
    }
    let end = text
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || c == '.' || ((c == '-' || c == '+') && i == 0)))
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    text[..end].parse().ok()
}

impl RawMetadata {
    pub fn get(&self, tag: &str) -> Option<&Value> {
        self.0.get(tag)
    }

    pub fn string(&self, tag: &str) -> Option<String> {
        match self.0.get(tag)? {
            Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn number(&self, tag: &str) -> Option<f64> {
        match self.0.get(tag)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => parse_number(s),
            _ => None,
        }
    }

    pub fn integer(&self, tag: &str) -> Option<u64> {
        self.number(tag)
            .filter(|n| *n >= 0.0 && n.fract() == 0.0)
            .map(|n| n as u64)
    }

    fn first_string(&self, tags: &[&str]) -> Option<String> {
        tags.iter().find_map(|t| self.string(t))
    }

    fn strings(&self, tag: &str) -> Vec<String> {
        match self.0.get(tag) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| match v {
                    Value::String(s) => Some(s.trim().to_string()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .filter(|s| !s.is_empty())
                .collect(),
            Some(_) => self
                .string(tag)
                .map(|s| {
                    s.split(',')
                        .map(|k| k.trim().to_string())
                        .filter(|k| !k.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            None => Vec::new(),
        }
    }

    /// Project the record onto the manifest whitelist.
    pub fn pick(&self) -> PickedExif {
        let count = |tag: &str| self.integer(tag).map(|n| n.min(u32::MAX as u64) as u32);
        PickedExif {
            make: self.string("Make"),
            model: self.string("Model"),
            lens_make: self.string("LensMake"),
            lens_model: self.first_string(&["LensModel", "Lens"]),
            focal_length: self.number("FocalLength"),
            focal_length_in_35mm_format: self.number("FocalLengthIn35mmFormat"),
            f_number: self.number("FNumber"),
            exposure_time: self.number("ExposureTime"),
            iso: count("ISO"),
            exposure_program: self.string("ExposureProgram"),
            exposure_compensation: self.number("ExposureCompensation"),
            metering_mode: self.string("MeteringMode"),
            flash: self.string("Flash"),
            white_balance: self.string("WhiteBalance"),
            date_time_original: self.string("DateTimeOriginal"),
            offset_time_original: self.string("OffsetTimeOriginal"),
            gps_latitude: self.number("GPSLatitude"),
            gps_longitude: self.number("GPSLongitude"),
            gps_altitude: self.number("GPSAltitude"),
            orientation: count("Orientation"),
            rating: count("Rating"),
            software: self.string("Software"),
            film_mode: self.string("FilmMode"),
            grain_effect_roughness: self.string("GrainEffectRoughness"),
            grain_effect_size: self.string("GrainEffectSize"),
            color_chrome_effect: self.string("ColorChromeEffect"),
            color_chrome_fx_blue: self.string("ColorChromeFXBlue"),
            white_balance_fine_tune: self.string("WhiteBalanceFineTune"),
            dynamic_range_setting: self.string("DynamicRangeSetting"),
            highlight_tone: self.string("HighlightTone"),
            shadow_tone: self.string("ShadowTone"),
            saturation: self.string("Saturation"),
            sharpness: self.string("Sharpness"),
            noise_reduction: self.string("NoiseReduction"),
            clarity: self.string("Clarity"),
            motion_photo: count("MotionPhoto"),
            motion_photo_version: count("MotionPhotoVersion"),
            motion_photo_presentation_timestamp_us: self
                .number("MotionPhotoPresentationTimestampUs")
                .map(|n| n as i64),
            micro_video: count("MicroVideo"),
            micro_video_offset: self.integer("MicroVideoOffset"),
        }
    }

    pub fn title(&self) -> Option<String> {
        self.first_string(&["Title", "ObjectName", "XPTitle", "Headline"])
    }

    pub fn description(&self) -> Option<String> {
        self.first_string(&["Description", "ImageDescription", "Caption-Abstract"])
    }

    /// `Keywords` and `Subject`, deduplicated, original order.
    pub fn keywords(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for k in self.strings("Keywords").into_iter().chain(self.strings("Subject")) {
            if !out.contains(&k) {
                out.push(k);
            }
        }
        out
    }

    /// Capture time. Dates without a zone are read as UTC.
    pub fn date_taken(&self) -> Option<DateTime<Utc>> {
        let original = self.string("DateTimeOriginal").and_then(|d| {
            let offset = self.string("OffsetTimeOriginal");
            parse_exif_date(&d, offset.as_deref())
        });
        original.or_else(|| {
            self.string("CreateDate")
                .and_then(|d| parse_exif_date(&d, None))
        })
    }

    /// Whether the photo carries an HDR gain map.
    pub fn is_hdr(&self) -> bool {
        const GAIN_MAP_TAGS: [&str; 5] = [
            "HDRGainMapVersion",
            "HDRGainMapHeadroom",
            "HDRHeadroom",
            "HDRGain",
            "GainMapMin",
        ];
        GAIN_MAP_TAGS.iter().any(|t| self.0.contains_key(*t))
            || self
                .directory()
                .iter()
                .any(|item| item.semantic.eq_ignore_ascii_case("GainMap"))
    }

    /// Entries of the container directory (`Container:Directory`), if any.
    pub fn directory(&self) -> Vec<DirectoryItem> {
        let list = self
            .0
            .get("ContainerDirectory")
            .or_else(|| self.0.get("Directory"));
        let Some(Value::Array(entries)) = list else {
            return Vec::new();
        };
        entries
            .iter()
            .filter_map(|entry| {
                let item = entry.get("Item").unwrap_or(entry);
                let field = |name: &str| item.get(name);
                let text = |name: &str| field(name).and_then(Value::as_str).map(str::to_string);
                let int = |name: &str| match field(name)? {
                    Value::Number(n) => n.as_u64(),
                    Value::String(s) => s.trim().parse().ok(),
                    _ => None,
                };
                Some(DirectoryItem {
                    semantic: text("Semantic")?,
                    mime: text("Mime").unwrap_or_default(),
                    length: int("Length").unwrap_or(0),
                    padding: int("Padding").unwrap_or(0),
                })
            })
            .collect()
    }
}

/// One `Container:Directory` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryItem {
    pub semantic: String,
    pub mime: String,
    pub length: u64,
    pub padding: u64,
}

/// Parse an EXIF `YYYY:MM:DD HH:MM:SS[.fff][±HH:MM]` date.
pub fn parse_exif_date(value: &str, offset: Option<&str>) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_str(value, "%Y:%m:%d %H:%M:%S%.f%:z") {
        return Some(dt.with_timezone(&Utc));
    }
    if let Some(offset) = offset.map(str::trim).filter(|o| !o.is_empty()) {
        let joined = format!("{value}{offset}");
        if let Ok(dt) = DateTime::parse_from_str(&joined, "%Y:%m:%d %H:%M:%S%.f%:z") {
            return Some(dt.with_timezone(&Utc));
        }
    }
    let trimmed = value.strip_suffix('Z').unwrap_or(value);
    NaiveDateTime::parse_from_str(trimmed, "%Y:%m:%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

// ============================================================================
// Child registry
// ============================================================================

type SharedChild = Arc<Mutex<Child>>;

static CHILDREN: LazyLock<Mutex<HashMap<u64, SharedChild>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));
static NEXT_CHILD: AtomicU64 = AtomicU64::new(0);
static TERMINATING: AtomicBool = AtomicBool::new(false);

/// Removes the child from the registry when the invocation ends.
struct Registration(u64);

impl Registration {
    fn new(child: SharedChild) -> Self {
        let id = NEXT_CHILD.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut children) = CHILDREN.lock() {
            children.insert(id, child);
        }
        Self(id)
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Ok(mut children) = CHILDREN.lock() {
            children.remove(&self.0);
        }
    }
}

/// Kill every running metadata-tool child. Further invocations fail with
/// [`ExifError::Interrupted`].
pub fn terminate_all() -> usize {
    TERMINATING.store(true, Ordering::SeqCst);
    let Ok(children) = CHILDREN.lock() else {
        return 0;
    };
    let mut killed = 0;
    for child in children.values() {
        if let Ok(mut child) = child.lock()
            && child.kill().is_ok()
        {
            killed += 1;
        }
    }
    if killed > 0 {
        tracing::warn!(killed, "terminated metadata tool processes");
    }
    killed
}

/// Number of metadata-tool children currently running.
pub fn running_children() -> usize {
    CHILDREN.lock().map(|c| c.len()).unwrap_or(0)
}

static SCRATCH: LazyLock<Mutex<HashMap<u64, PathBuf>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));
static NEXT_SCRATCH: AtomicU64 = AtomicU64::new(0);

/// Scratch copy of the source bytes, registered while it exists.
struct Scratch {
    id: u64,
    file: NamedTempFile,
}

impl Scratch {
    fn create(data: &[u8], extension: &str) -> io::Result<Self> {
        let mut file = tempfile::Builder::new()
            .prefix("photo-manifest-")
            .suffix(&format!(".{extension}"))
            .tempfile()?;
        file.write_all(data)?;
        file.flush()?;
        let id = NEXT_SCRATCH.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut paths) = SCRATCH.lock() {
            paths.insert(id, file.path().to_path_buf());
        }
        Ok(Self { id, file })
    }

    fn path(&self) -> &Path {
        self.file.path()
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        if let Ok(mut paths) = SCRATCH.lock() {
            paths.remove(&self.id);
        }
    }
}

/// Delete every scratch file still on disk. For exits that bypass `Drop`.
pub fn remove_scratch_files() -> usize {
    let Ok(mut paths) = SCRATCH.lock() else {
        return 0;
    };
    let mut removed = 0;
    for (_, path) in paths.drain() {
        match std::fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "could not remove scratch file"),
        }
    }
    removed
}

// ============================================================================
// ExifTool
// ============================================================================

/// ExifTool invoked as an external process.
#[derive(Debug, Clone)]
pub struct ExifTool {
    path: PathBuf,
    timeout: Duration,
}

impl ExifTool {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
        }
    }

    /// Run the tool with the given arguments followed by `file`, and return
    /// its stdout.
    fn run(&self, args: &[&str], file: &Path) -> Result<Vec<u8>, ExifError> {
        if TERMINATING.load(Ordering::SeqCst) {
            return Err(ExifError::Interrupted);
        }
        let mut stdout = tempfile::tempfile()?;
        let mut stderr = tempfile::tempfile()?;
        let child = Command::new(&self.path)
            .args(args)
            .arg(file)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout.try_clone()?))
            .stderr(Stdio::from(stderr.try_clone()?))
            .spawn()
            .map_err(|source| ExifError::Spawn {
                tool: self.path.display().to_string(),
                source,
            })?;
        let child = Arc::new(Mutex::new(child));
        let _registration = Registration::new(Arc::clone(&child));

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            let polled = match child.lock() {
                Ok(mut c) => c.try_wait()?,
                Err(_) => return Err(ExifError::Interrupted),
            };
            if let Some(status) = polled {
                break status;
            }
            if Instant::now() >= deadline {
                if let Ok(mut c) = child.lock() {
                    let _ = c.kill();
                    let _ = c.wait();
                }
                return Err(ExifError::Timeout(self.timeout));
            }
            std::thread::sleep(Duration::from_millis(10));
        };

        if TERMINATING.load(Ordering::SeqCst) {
            return Err(ExifError::Interrupted);
        }
        let mut out = Vec::new();
        stdout.seek(SeekFrom::Start(0))?;
        stdout.read_to_end(&mut out)?;
        if !status.success() && out.is_empty() {
            let mut err = String::new();
            stderr.seek(SeekFrom::Start(0))?;
            stderr.read_to_string(&mut err)?;
            return Err(ExifError::Failed {
                status: status.to_string(),
                stderr: err.trim().to_string(),
            });
        }
        Ok(out)
    }
}

impl MetadataExtractor for ExifTool {
    fn extract(&self, data: &[u8], extension: &str) -> Result<RawMetadata, ExifError> {
        let scratch = Scratch::create(data, extension)?;
        let out = self.run(&["-json", "-struct", "-c", "%+.6f"], scratch.path())?;
        let mut records: Vec<Map<String, Value>> = serde_json::from_slice(&out)?;
        if records.is_empty() {
            return Err(ExifError::Empty);
        }
        Ok(RawMetadata(records.swap_remove(0)))
    }
}
