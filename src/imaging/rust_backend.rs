//! Pure Rust image processing backend.
//!
//! Everything is statically linked into the binary.
//!
//! ## Crate mapping
//!
//! | Operation | Crate / function |
//! |---|---|
//! | Decode (JPEG, PNG, TIFF, WebP, BMP) | `image` crate (pure Rust decoders) |
//! | Orientation | `ImageDecoder::orientation` + `DynamicImage::apply_orientation` |
//! | Normalize BMP → PNG | `image` PNG encoder |
//! | Thumbnail | `resize` (Lanczos3) + `imageops::unsharpen` → JPEG |
//! | Thumb hash | `thumbhash::rgba_to_thumb_hash` on a ≤100px copy, base64 |
//! | Histogram | Triangle-filtered sample, BT.709 luma |

use super::backend::{
    BackendError, Dimensions, Histogram, ImageBackend, Normalized, Rendered, Thumbnail,
};
use super::calculations::{fit_width, fit_within};
use super::params::{RenderParams, ThumbnailParams};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::metadata::Orientation;
use image::{DynamicImage, ImageDecoder, ImageFormat, ImageReader};
use std::io::Cursor;

/// Largest edge ThumbHash accepts.
const THUMB_HASH_MAX_EDGE: u32 = 100;

/// Pure Rust backend using the `image` crate ecosystem.
///
/// See the [module docs](self) for the crate-to-operation mapping.
#[derive(Debug, Default)]
pub struct RustBackend;

impl RustBackend {
    pub fn new() -> Self {
        Self
    }
}

fn reader(data: &[u8]) -> Result<ImageReader<Cursor<&[u8]>>, BackendError> {
    let reader = ImageReader::new(Cursor::new(data)).with_guessed_format()?;
    if reader.format().is_none() {
        return Err(BackendError::Unsupported("unrecognized image data".into()));
    }
    Ok(reader)
}

/// Manifest name of a container format.
pub fn format_name(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Jpeg => "jpeg",
        ImageFormat::Png => "png",
        ImageFormat::Tiff => "tiff",
        ImageFormat::WebP => "webp",
        ImageFormat::Bmp => "bmp",
        _ => "unknown",
    }
}

fn swaps_axes(orientation: Orientation) -> bool {
    matches!(
        orientation,
        Orientation::Rotate90
            | Orientation::Rotate270
            | Orientation::Rotate90FlipH
            | Orientation::Rotate270FlipH
    )
}

/// Decode with EXIF orientation applied.
fn decode_oriented(data: &[u8]) -> Result<DynamicImage, BackendError> {
    let mut decoder = reader(data)?
        .into_decoder()
        .map_err(|e| BackendError::Decode(e.to_string()))?;
    let orientation = decoder.orientation().unwrap_or(Orientation::NoTransforms);
    let mut img =
        DynamicImage::from_decoder(decoder).map_err(|e| BackendError::Decode(e.to_string()))?;
    img.apply_orientation(orientation);
    Ok(img)
}

fn encode_jpeg(img: &DynamicImage, quality: u32) -> Result<Vec<u8>, BackendError> {
    let mut buf = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100) as u8);
    DynamicImage::ImageRgb8(img.to_rgb8())
        .write_with_encoder(encoder)
        .map_err(|e| BackendError::Encode(format!("JPEG: {e}")))?;
    Ok(buf)
}

fn thumb_hash(img: &DynamicImage) -> String {
    let (w, h) = fit_within((img.width(), img.height()), THUMB_HASH_MAX_EDGE);
    let small = img.resize_exact(w, h, FilterType::Triangle).to_rgba8();
    let hash = thumbhash::rgba_to_thumb_hash(w as usize, h as usize, small.as_raw());
    BASE64.encode(hash)
}

fn make_thumbnail(img: &DynamicImage, params: &ThumbnailParams) -> Result<Thumbnail, BackendError> {
    let (w, h) = fit_width((img.width(), img.height()), params.width);
    let resized = if (w, h) == (img.width(), img.height()) {
        img.clone()
    } else {
        img.resize_exact(w, h, FilterType::Lanczos3)
    };
    let sharpened = match params.sharpening {
        Some(s) => DynamicImage::from(image::imageops::unsharpen(&resized, s.sigma, s.threshold)),
        None => resized,
    };
    Ok(Thumbnail {
        data: encode_jpeg(&sharpened, params.quality.value())?,
        width: w,
        height: h,
        thumb_hash: thumb_hash(&sharpened),
    })
}

/// BT.709 luma histogram of a downsampled copy.
fn luminance_histogram(img: &DynamicImage, edge: u32) -> Box<Histogram> {
    let (w, h) = fit_within((img.width(), img.height()), edge.max(1));
    let sample = img.resize_exact(w, h, FilterType::Triangle).to_rgb8();
    let mut histogram = Box::new([0u64; 256]);
    for pixel in sample.pixels() {
        let [r, g, b] = pixel.0;
        let luma = 0.2126 * r as f64 + 0.7152 * g as f64 + 0.0722 * b as f64;
        histogram[(luma.round() as usize).min(255)] += 1;
    }
    histogram
}

impl ImageBackend for RustBackend {
    fn identify(&self, data: &[u8]) -> Result<Dimensions, BackendError> {
        let mut decoder = reader(data)?
            .into_decoder()
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        let (width, height) = decoder.dimensions();
        let orientation = decoder.orientation().unwrap_or(Orientation::NoTransforms);
        Ok(if swaps_axes(orientation) {
            Dimensions {
                width: height,
                height: width,
            }
        } else {
            Dimensions { width, height }
        })
    }

    fn normalize(&self, data: &[u8], extension: &str) -> Result<Normalized, BackendError> {
        let reader = reader(data)?;
        let format = reader
            .format()
            .ok_or_else(|| BackendError::Unsupported(extension.to_string()))?;
        match format {
            ImageFormat::Bmp => {
                let img = reader
                    .decode()
                    .map_err(|e| BackendError::Decode(e.to_string()))?;
                let mut png = Vec::new();
                img.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
                    .map_err(|e| BackendError::Encode(format!("PNG: {e}")))?;
                Ok(Normalized {
                    data: png,
                    format: "png".into(),
                    converted: true,
                })
            }
            ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::Tiff | ImageFormat::WebP => {
                Ok(Normalized {
                    data: data.to_vec(),
                    format: format_name(format).into(),
                    converted: false,
                })
            }
            other => Err(BackendError::Unsupported(format!("{other:?}"))),
        }
    }

    fn render(&self, data: &[u8], params: &RenderParams) -> Result<Rendered, BackendError> {
        let img = decode_oriented(data)?;
        let thumbnail = params
            .thumbnail
            .as_ref()
            .map(|p| make_thumbnail(&img, p))
            .transpose()?;
        let histogram = params.histogram_edge.map(|edge| luminance_histogram(&img, edge));
        Ok(Rendered {
            dimensions: Dimensions {
                width: img.width(),
                height: img.height(),
            },
            thumbnail,
            histogram,
        })
    }
}
