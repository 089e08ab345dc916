//! High-level image operations.
//!
//! These functions combine calculations with backend execution.
//! They take configuration, compute parameters, and call the backend.

use super::backend::{BackendError, Dimensions, ImageBackend, Normalized, Thumbnail};
use super::params::{Quality, RenderParams, Sharpening, ThumbnailParams};
use super::tone;
use crate::types::ToneAnalysis;

/// Result type for image operations.
pub type Result<T> = std::result::Result<T, BackendError>;

/// Get displayed image dimensions using the backend.
pub fn get_dimensions(backend: &(impl ImageBackend + ?Sized), data: &[u8]) -> Result<(u32, u32)> {
    let dims = backend.identify(data)?;
    Ok((dims.width, dims.height))
}

/// Re-encode legacy containers, pass everything else through.
pub fn normalize(backend: &(impl ImageBackend + ?Sized), data: &[u8], extension: &str) -> Result<Normalized> {
    backend.normalize(data, extension)
}

/// Configuration for thumbnail generation.
#[derive(Debug, Clone)]
pub struct ThumbnailConfig {
    /// Fixed output width; height follows the aspect ratio.
    pub width: u32,
    pub quality: Quality,
    pub sharpening: Option<Sharpening>,
}

impl ThumbnailConfig {
    pub fn new(width: u32, quality: u32) -> Self {
        Self {
            width,
            quality: Quality::new(quality),
            sharpening: Some(Sharpening::light()),
        }
    }
}

/// What [`render_derivatives`] produced for one photo.
#[derive(Debug, Clone, PartialEq)]
pub struct Derivatives {
    pub dimensions: Dimensions,
    pub thumbnail: Option<Thumbnail>,
    pub tone: Option<ToneAnalysis>,
}

/// Decode once and derive the thumbnail and tone classification.
///
/// Either half can be turned off: a cached thumbnail passes `None` for
/// `thumbnail`, and a metadata-only refresh still wants the tone. When both
/// are off the image is not decoded at all.
pub fn render_derivatives(
    backend: &(impl ImageBackend + ?Sized),
    data: &[u8],
    thumbnail: Option<&ThumbnailConfig>,
    tone_sample_edge: Option<u32>,
) -> Result<Option<Derivatives>> {
    if thumbnail.is_none() && tone_sample_edge.is_none() {
        return Ok(None);
    }
    let params = RenderParams {
        thumbnail: thumbnail.map(|c| ThumbnailParams {
            width: c.width,
            quality: c.quality,
            sharpening: c.sharpening,
        }),
        histogram_edge: tone_sample_edge,
    };
    let rendered = backend.render(data, &params)?;
    let tone = rendered.histogram.as_deref().and_then(tone::analyze);
    Ok(Some(Derivatives {
        dimensions: rendered.dimensions,
        thumbnail: rendered.thumbnail,
        tone,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::backend::tests::{MockBackend, RecordedOp};
    use crate::types::ToneType;

    #[test]
    fn get_dimensions_calls_identify() {
        let backend = MockBackend::new(800, 600);
        let dims = get_dimensions(&backend, b"bytes").unwrap();
        assert_eq!(dims, (800, 600));
        assert_eq!(backend.get_operations(), vec![RecordedOp::Identify]);
    }

    #[test]
    fn normalize_passes_extension() {
        let backend = MockBackend::new(10, 10);
        normalize(&backend, b"bytes", "bmp").unwrap();
        assert_eq!(
            backend.get_operations(),
            vec![RecordedOp::Normalize("bmp".into())]
        );
    }

    #[test]
    fn render_requests_both_derivatives() {
        let mut histogram = [0u64; 256];
        histogram[5] = 100;
        let backend = MockBackend::new(1200, 800).with_histogram(histogram);
        let config = ThumbnailConfig::new(600, 80);

        let out = render_derivatives(&backend, b"bytes", Some(&config), Some(256))
            .unwrap()
            .unwrap();

        assert_eq!(out.thumbnail.unwrap().width, 600);
        assert_eq!(out.tone.unwrap().tone_type, ToneType::LowKey);
        assert_eq!(
            backend.get_operations(),
            vec![RecordedOp::Render {
                thumbnail_width: Some(600),
                histogram_edge: Some(256),
            }]
        );
    }

    #[test]
    fn empty_histogram_gives_no_tone() {
        let backend = MockBackend::new(100, 100);
        let out = render_derivatives(&backend, b"bytes", None, Some(64))
            .unwrap()
            .unwrap();
        assert!(out.thumbnail.is_none());
        assert!(out.tone.is_none());
    }

    #[test]
    fn nothing_requested_skips_decode() {
        let backend = MockBackend::new(100, 100);
        assert!(render_derivatives(&backend, b"bytes", None, None)
            .unwrap()
            .is_none());
        assert!(backend.get_operations().is_empty());
    }
}
