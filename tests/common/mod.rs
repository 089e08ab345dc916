//! Fixtures shared by the integration tests. No network, no ExifTool.

#![allow(dead_code)]

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use photo_manifest::builder::{Builder, Components};
use photo_manifest::cache;
use photo_manifest::config::BuilderConfig;
use photo_manifest::exif::{ExifError, MetadataExtractor, RawMetadata};
use photo_manifest::geocoding::{GeocodeError, GeocodingProvider, Place};
use photo_manifest::plugins::Plugin;
use photo_manifest::storage::MemoryProvider;
use photo_manifest::types::Manifest;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Solid-color JPEG; different `shade` values give different bytes.
pub fn jpeg(width: u32, height: u32, shade: u8) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb([shade, shade / 2, 255 - shade]));
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut out, ImageFormat::Jpeg)
        .unwrap();
    out.into_inner()
}

/// JPEG followed by a 10 000 byte MP4-looking trailer.
pub fn with_motion_trailer(image: &[u8]) -> Vec<u8> {
    let mut data = image.to_vec();
    let mut trailer = vec![0u8; 10_000];
    trailer[4..8].copy_from_slice(b"ftyp");
    data.extend_from_slice(&trailer);
    data
}

/// Metadata extractor answering from a table keyed by content digest.
#[derive(Default)]
pub struct TableExtractor {
    records: Mutex<HashMap<String, RawMetadata>>,
    calls: AtomicUsize,
}

impl TableExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, data: &[u8], record: serde_json::Value) {
        let serde_json::Value::Object(map) = record else {
            panic!("metadata record must be a JSON object");
        };
        self.records
            .lock()
            .unwrap()
            .insert(cache::digest(data), RawMetadata::from(map));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl MetadataExtractor for TableExtractor {
    fn extract(&self, data: &[u8], _extension: &str) -> Result<RawMetadata, ExifError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(&cache::digest(data))
            .cloned()
            .unwrap_or_default())
    }
}

/// Geocoding provider resolving every coordinate to one city.
pub struct FixedGeocoder {
    city: String,
    calls: AtomicUsize,
}

impl FixedGeocoder {
    pub fn new(city: &str) -> Self {
        Self {
            city: city.to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl GeocodingProvider for FixedGeocoder {
    fn name(&self) -> &str {
        "fixed"
    }

    fn min_interval(&self) -> Duration {
        Duration::ZERO
    }

    fn reverse(&self, _latitude: f64, _longitude: f64) -> Result<Option<Place>, GeocodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Some(Place {
            country: Some("France".into()),
            city: Some(self.city.clone()),
            location_name: Some(format!("{}, France", self.city)),
        }))
    }
}

/// In-memory source, scripted metadata and output under a temp dir.
pub struct Workspace {
    pub tmp: TempDir,
    pub provider: Arc<MemoryProvider>,
    pub extractor: Arc<TableExtractor>,
    pub config: BuilderConfig,
}

impl Workspace {
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let mut config = BuilderConfig::default();
        config.output.manifest_path = tmp.path().join("out/manifest.json");
        config.output.thumbnail_dir = tmp.path().join("out/thumbnails");
        config.processing.concurrency = 3;
        config.geocoding.lock_dir = Some(tmp.path().join("locks"));
        Self {
            tmp,
            provider: Arc::new(MemoryProvider::new()),
            extractor: Arc::new(TableExtractor::new()),
            config,
        }
    }

    pub fn put(&self, key: &str, data: Vec<u8>) {
        self.provider.insert(key, data);
    }

    pub fn builder_with(&self, plugins: Vec<Arc<dyn Plugin>>) -> Builder {
        Builder::with_components(
            self.config.clone(),
            Components {
                provider: Some(self.provider.clone()),
                extractor: Some(self.extractor.clone()),
                plugins,
                ..Default::default()
            },
        )
        .unwrap()
    }

    pub fn builder(&self) -> Builder {
        self.builder_with(Vec::new())
    }

    pub fn manifest(&self) -> Manifest {
        photo_manifest::manifest::load(&self.config.output.manifest_path)
            .unwrap()
            .expect("manifest written")
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.manifest().data.into_iter().map(|i| i.s3_key).collect();
        keys.sort();
        keys
    }

    pub fn thumbnail_count(&self) -> usize {
        std::fs::read_dir(&self.config.output.thumbnail_dir)
            .map(|d| d.count())
            .unwrap_or(0)
    }
}
