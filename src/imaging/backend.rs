//! Image processing backend trait and shared types.
//!
//! The [`ImageBackend`] trait defines the three operations every backend
//! must support: identify, normalize, and render. All of them work on
//! in-memory bytes, since sources come from remote storage.
//!
//! The production implementation,
//! [`RustBackend`](super::rust_backend::RustBackend), is pure Rust and
//! statically linked.

use super::params::RenderParams;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unsupported image format: {0}")]
    Unsupported(String),
    #[error("Decode failed: {0}")]
    Decode(String),
    #[error("Encode failed: {0}")]
    Encode(String),
}

/// Displayed dimensions (EXIF orientation applied).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// Source bytes in a container the rest of the pipeline accepts.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub data: Vec<u8>,
    /// Lowercase container name written to the manifest (`jpeg`, `png`, ...).
    pub format: String,
    /// Whether the bytes were re-encoded.
    pub converted: bool,
}

/// JPEG thumbnail plus its perceptual placeholder hash.
#[derive(Debug, Clone, PartialEq)]
pub struct Thumbnail {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Base64 ThumbHash of the thumbnail.
    pub thumb_hash: String,
}

/// 256-bucket luminance histogram.
pub type Histogram = [u64; 256];

/// Output of one decode.
#[derive(Debug, Clone, PartialEq)]
pub struct Rendered {
    pub dimensions: Dimensions,
    pub thumbnail: Option<Thumbnail>,
    pub histogram: Option<Box<Histogram>>,
}

/// Trait for image processing backends.
///
/// Every backend must implement all three operations so the pipeline is
/// backend-agnostic.
pub trait ImageBackend: Send + Sync {
    /// Read displayed dimensions from the header without a full decode.
    fn identify(&self, data: &[u8]) -> Result<Dimensions, BackendError>;

    /// Re-encode legacy containers; pass everything else through.
    fn normalize(&self, data: &[u8], extension: &str) -> Result<Normalized, BackendError>;

    /// Decode once and produce the requested derivatives.
    fn render(&self, data: &[u8], params: &RenderParams) -> Result<Rendered, BackendError>;
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mock backend that records operations and returns canned results.
    /// Uses Mutex (not RefCell) so it is Sync and works with rayon's par_iter.
    #[derive(Default)]
    pub struct MockBackend {
        pub dimensions: Option<Dimensions>,
        pub histogram: Option<Histogram>,
        pub operations: Mutex<Vec<RecordedOp>>,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub enum RecordedOp {
        Identify,
        Normalize(String),
        Render {
            thumbnail_width: Option<u32>,
            histogram_edge: Option<u32>,
        },
    }

    impl MockBackend {
        pub fn new(width: u32, height: u32) -> Self {
            Self {
                dimensions: Some(Dimensions { width, height }),
                histogram: None,
                operations: Mutex::new(Vec::new()),
            }
        }

        pub fn with_histogram(mut self, histogram: Histogram) -> Self {
            self.histogram = Some(histogram);
            self
        }

        pub fn get_operations(&self) -> Vec<RecordedOp> {
            self.operations.lock().unwrap().clone()
        }

        fn dims(&self) -> Result<Dimensions, BackendError> {
            self.dimensions
                .ok_or_else(|| BackendError::Decode("No mock dimensions".to_string()))
        }
    }

    impl ImageBackend for MockBackend {
        fn identify(&self, _data: &[u8]) -> Result<Dimensions, BackendError> {
            self.operations.lock().unwrap().push(RecordedOp::Identify);
            self.dims()
        }

        fn normalize(&self, data: &[u8], extension: &str) -> Result<Normalized, BackendError> {
            self.operations
                .lock()
                .unwrap()
                .push(RecordedOp::Normalize(extension.to_string()));
            Ok(Normalized {
                data: data.to_vec(),
                format: extension.to_string(),
                converted: false,
            })
        }

        fn render(&self, _data: &[u8], params: &RenderParams) -> Result<Rendered, BackendError> {
            self.operations.lock().unwrap().push(RecordedOp::Render {
                thumbnail_width: params.thumbnail.as_ref().map(|t| t.width),
                histogram_edge: params.histogram_edge,
            });
            let dimensions = self.dims()?;
            Ok(Rendered {
                dimensions,
                thumbnail: params.thumbnail.as_ref().map(|t| Thumbnail {
                    data: b"mock-thumbnail".to_vec(),
                    width: t.width,
                    height: t.width,
                    thumb_hash: "bW9jaw==".to_string(),
                }),
                histogram: params
                    .histogram_edge
                    .map(|_| Box::new(self.histogram.unwrap_or([0; 256]))),
            })
        }
    }

    #[test]
    fn mock_records_render_request() {
        use crate::imaging::{Quality, ThumbnailParams};
        let backend = MockBackend::new(800, 600);
        let rendered = backend
            .render(
                b"",
                &RenderParams {
                    thumbnail: Some(ThumbnailParams {
                        width: 600,
                        quality: Quality::default(),
                        sharpening: None,
                    }),
                    histogram_edge: None,
                },
            )
            .unwrap();
        assert_eq!(rendered.dimensions.width, 800);
        assert!(rendered.thumbnail.is_some());
        assert!(rendered.histogram.is_none());
        assert_eq!(
            backend.get_operations(),
            vec![RecordedOp::Render {
                thumbnail_width: Some(600),
                histogram_edge: None
            }]
        );
    }
}
