//! Shared data model.
//!
//! Everything here is serialized: [`Manifest`] is the persisted output read by
//! the presentation layer, and [`BuildTask`] / [`ManifestItem`] cross the
//! process boundary in cluster mode. Field names in the manifest use the
//! camelCase shape the front-end expects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Snapshot of one object in the storage backend at scan time.
///
/// Identity is `key`, a forward-slash normalized path relative to the
/// provider root. Produced by provider listings and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageObject {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

/// Where the moving part of a photo lives.
///
/// A photo has either no video, a separate live-photo video file, or a
/// video trailer embedded in the image file itself. Never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum VideoSource {
    /// Separate video file sharing the image's directory and basename.
    LivePhoto { video_key: String, video_url: String },
    /// Video appended to the image file, addressed by byte range.
    MotionPhoto {
        offset: u64,
        size: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        presentation_timestamp_us: Option<i64>,
    },
}

/// Coarse exposure character of a photo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToneType {
    LowKey,
    HighKey,
    Normal,
    HighContrast,
}

/// Histogram-derived tone classification, percentages in `0..=100`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToneAnalysis {
    pub tone_type: ToneType,
    pub brightness: f64,
    pub contrast: f64,
    pub shadow_ratio: f64,
    pub highlight_ratio: f64,
}

/// Reverse-geocoded place for a photo's GPS position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationInfo {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_name: Option<String>,
}

/// Whitelisted metadata fields carried into the manifest.
///
/// Keys keep ExifTool's tag names. Only the GPS and motion-photo marker
/// fields are interpreted by the pipeline; everything else passes through.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PickedExif {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub make: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lens_make: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lens_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focal_length: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focal_length_in_35mm_format: Option<f64>,
    #[serde(rename = "FNumber", default, skip_serializing_if = "Option::is_none")]
    pub f_number: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposure_time: Option<f64>,
    #[serde(rename = "ISO", default, skip_serializing_if = "Option::is_none")]
    pub iso: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposure_program: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposure_compensation: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metering_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub white_balance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_time_original: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset_time_original: Option<String>,
    #[serde(rename = "GPSLatitude", default, skip_serializing_if = "Option::is_none")]
    pub gps_latitude: Option<f64>,
    #[serde(rename = "GPSLongitude", default, skip_serializing_if = "Option::is_none")]
    pub gps_longitude: Option<f64>,
    #[serde(rename = "GPSAltitude", default, skip_serializing_if = "Option::is_none")]
    pub gps_altitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orientation: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub software: Option<String>,
    /// Fujifilm film simulation and the rest of the in-camera recipe.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub film_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grain_effect_roughness: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grain_effect_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color_chrome_effect: Option<String>,
    #[serde(rename = "ColorChromeFXBlue", default, skip_serializing_if = "Option::is_none")]
    pub color_chrome_fx_blue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub white_balance_fine_tune: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynamic_range_setting: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highlight_tone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shadow_tone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saturation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sharpness: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub noise_reduction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motion_photo: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motion_photo_version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motion_photo_presentation_timestamp_us: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub micro_video: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub micro_video_offset: Option<u64>,
}

impl PickedExif {
    /// GPS position as signed decimal degrees, if both axes are present.
    pub fn gps(&self) -> Option<(f64, f64)> {
        match (self.gps_latitude, self.gps_longitude) {
            (Some(lat), Some(lng)) => Some((lat, lng)),
            _ => None,
        }
    }
}

/// One photo in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestItem {
    pub id: String,
    pub s3_key: String,
    pub original_url: String,
    pub thumbnail_url: String,
    #[serde(default)]
    pub thumb_hash: Option<String>,
    pub width: u32,
    pub height: u32,
    pub aspect_ratio: f64,
    pub format: String,
    pub digest: String,
    pub last_modified: DateTime<Utc>,
    pub size: u64,
    /// Listing etag at the time the item was built; used as a cheap
    /// content-change signal on backends that expose one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_etag: Option<String>,
    #[serde(default)]
    pub exif: Option<PickedExif>,
    #[serde(default)]
    pub tone_analysis: Option<ToneAnalysis>,
    #[serde(default)]
    pub location: Option<LocationInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<VideoSource>,
    #[serde(rename = "isHDR", default)]
    pub is_hdr: bool,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub date_taken: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A camera seen anywhere in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraInfo {
    pub make: String,
    pub model: String,
    pub display_name: String,
}

/// A lens seen anywhere in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LensInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub make: Option<String>,
    pub model: String,
    pub display_name: String,
}

/// The persisted catalog.
///
/// Readers ignore unknown fields so newer producers stay readable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    #[serde(default)]
    pub data: Vec<ManifestItem>,
    #[serde(default)]
    pub cameras: Vec<CameraInfo>,
    #[serde(default)]
    pub lenses: Vec<LensInfo>,
}

/// A unit of pipeline work: a source object, the prior manifest entry for
/// the same key, and the live-photo video paired with it.
///
/// Consumed once by the pipeline; results come back as a separate outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildTask {
    pub object: StorageObject,
    pub existing: Option<ManifestItem>,
    pub live_video: Option<StorageObject>,
}
