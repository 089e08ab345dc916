//! Shared fixtures and fakes for unit tests.
//!
//! Nothing here touches the network or needs ExifTool:
//!
//! - [`object`] / [`item`] build listing snapshots and matching manifest
//!   entries with a fixed timestamp
//! - [`gray_image`] / [`encode_image`] make real, decodable image bytes
//! - [`ScriptedExtractor`] answers metadata requests from a table
//! - [`CountingGeocoder`] is a geocoding provider that counts its calls

use crate::cache;
use crate::exif::{ExifError, MetadataExtractor, RawMetadata};
use crate::geocoding::{GeocodeError, GeocodingProvider, Place};
use crate::naming;
use crate::storage::epoch_plus;
use crate::types::{ManifestItem, StorageObject};
use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

// =========================================================================
// Model fixtures
// =========================================================================

/// Listing snapshot stamped at the same instant as `MemoryProvider::insert`.
pub fn object(key: &str, size: u64) -> StorageObject {
    StorageObject {
        key: key.to_string(),
        size,
        last_modified: epoch_plus(1_000_000),
        etag: None,
    }
}

/// Minimal manifest entry that is up to date with `object`.
pub fn item(object: &StorageObject) -> ManifestItem {
    let id = naming::photo_id(&object.key, 8);
    ManifestItem {
        thumbnail_url: format!("/thumbnails/{id}.jpg"),
        id,
        s3_key: object.key.clone(),
        original_url: format!("memory://{}", object.key),
        thumb_hash: None,
        width: 4,
        height: 3,
        aspect_ratio: 4.0 / 3.0,
        format: "jpeg".into(),
        digest: cache::digest(object.key.as_bytes()),
        last_modified: object.last_modified,
        size: object.size,
        source_etag: object.etag.clone(),
        exif: None,
        tone_analysis: None,
        location: None,
        video: None,
        is_hdr: false,
        title: naming::title_from_key(&object.key),
        description: String::new(),
        date_taken: object.last_modified,
        tags: Vec::new(),
    }
}

// =========================================================================
// Images
// =========================================================================

/// Uniform grayscale image.
pub fn gray_image(width: u32, height: u32, value: u8) -> DynamicImage {
    DynamicImage::ImageLuma8(GrayImage::from_pixel(width, height, Luma([value])))
}

/// Encode to the given container in memory.
pub fn encode_image(image: &DynamicImage, format: ImageFormat) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    let image = match format {
        ImageFormat::Jpeg | ImageFormat::Bmp => DynamicImage::ImageRgb8(image.to_rgb8()),
        _ => image.clone(),
    };
    image.write_to(&mut out, format).unwrap();
    out.into_inner()
}

// =========================================================================
// Metadata extractor
// =========================================================================

enum Scripted {
    Record(RawMetadata),
    Timeout,
    Broken,
}

/// Metadata extractor answering from a table keyed by content digest.
/// Unknown content gets an empty record.
#[derive(Default)]
pub struct ScriptedExtractor {
    by_digest: Mutex<HashMap<String, Scripted>>,
    calls: AtomicUsize,
}

impl ScriptedExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self, data: &[u8], answer: Scripted) {
        self.by_digest
            .lock()
            .unwrap()
            .insert(cache::digest(data), answer);
    }

    /// Return `record` (a JSON object) for exactly these bytes.
    pub fn record(self, data: &[u8], record: serde_json::Value) -> Self {
        let map = match record {
            serde_json::Value::Object(map) => map,
            other => panic!("metadata record must be an object, got {other}"),
        };
        self.set(data, Scripted::Record(RawMetadata::from(map)));
        self
    }

    /// Time out on these bytes.
    pub fn timeout(self, data: &[u8]) -> Self {
        self.set(data, Scripted::Timeout);
        self
    }

    /// Fail with unreadable output on these bytes.
    pub fn broken(self, data: &[u8]) -> Self {
        self.set(data, Scripted::Broken);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl MetadataExtractor for ScriptedExtractor {
    fn extract(&self, data: &[u8], _extension: &str) -> Result<RawMetadata, ExifError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.by_digest.lock().unwrap().get(&cache::digest(data)) {
            Some(Scripted::Record(meta)) => Ok(meta.clone()),
            Some(Scripted::Timeout) => Err(ExifError::Timeout(Duration::from_secs(30))),
            Some(Scripted::Broken) => Err(ExifError::Empty),
            None => Ok(RawMetadata::default()),
        }
    }
}

// =========================================================================
// Geocoding provider
// =========================================================================

enum Answer {
    Found(String),
    Empty,
    Failing(u16),
}

/// Geocoding provider that counts calls and answers the same for every
/// coordinate.
pub struct CountingGeocoder {
    answer: Answer,
    delay: Duration,
    calls: AtomicUsize,
}

impl CountingGeocoder {
    fn with_answer(answer: Answer) -> Self {
        Self {
            answer,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// Every lookup resolves to `city`.
    pub fn found(city: &str) -> Self {
        Self::with_answer(Answer::Found(city.to_string()))
    }

    /// Every lookup is a confirmed miss.
    pub fn empty() -> Self {
        Self::with_answer(Answer::Empty)
    }

    /// Every lookup fails with this HTTP status.
    pub fn failing(status: u16) -> Self {
        Self::with_answer(Answer::Failing(status))
    }

    /// Sleep this long inside each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl GeocodingProvider for CountingGeocoder {
    fn name(&self) -> &str {
        "counting"
    }

    fn min_interval(&self) -> Duration {
        Duration::ZERO
    }

    fn reverse(&self, _latitude: f64, _longitude: f64) -> Result<Option<Place>, GeocodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        match &self.answer {
            Answer::Found(city) => Ok(Some(Place {
                country: Some("Testland".into()),
                city: Some(city.clone()),
                location_name: Some(format!("Somewhere in {city}")),
            })),
            Answer::Empty => Ok(None),
            Answer::Failing(status) => Err(GeocodeError::Http {
                status: *status,
                url: "test://reverse".into(),
            }),
        }
    }
}
