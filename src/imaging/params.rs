//! Parameter types for image operations.
//!
//! These structs describe *what* to do, not *how* to do it. They are the
//! interface between the high-level [`operations`](super::operations) module
//! (which decides what to derive for a photo) and the
//! [`backend`](super::backend) (which does the actual pixel work). This
//! separation allows swapping backends (e.g. for testing with a mock)
//! without changing pipeline logic.
//!
//! ## Types
//!
//! - [`Quality`]: Lossy encoding quality (1–100, default 80). Clamped on construction.
//! - [`Sharpening`]: Unsharp-mask parameters (sigma + threshold) for thumbnail crispness.
//! - [`ThumbnailParams`]: Target width, quality and optional sharpening of the JPEG thumbnail.
//! - [`RenderParams`]: Which derivatives one decode should produce.

/// Quality setting for lossy image encoding (1-100).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quality(pub u32);

impl Quality {
    pub fn new(value: u32) -> Self {
        Self(value.clamp(1, 100))
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl Default for Quality {
    fn default() -> Self {
        Self(80)
    }
}

/// Sharpening parameters for unsharp mask.
///
/// - `sigma`: Standard deviation of the Gaussian blur (higher = more sharpening)
/// - `threshold`: Minimum brightness difference to sharpen (0 = sharpen all pixels)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sharpening {
    pub sigma: f32,
    pub threshold: i32,
}

impl Sharpening {
    /// Light sharpening suitable for thumbnails.
    pub fn light() -> Self {
        Self {
            sigma: 0.5,
            threshold: 0,
        }
    }
}

/// Parameters for the thumbnail derivative (fixed width, proportional height).
#[derive(Debug, Clone, PartialEq)]
pub struct ThumbnailParams {
    pub width: u32,
    pub quality: Quality,
    pub sharpening: Option<Sharpening>,
}

/// What a single decode should produce.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderParams {
    /// Encode a thumbnail (and its thumb hash).
    pub thumbnail: Option<ThumbnailParams>,
    /// Build a luminance histogram from a copy downsampled to this edge.
    pub histogram_edge: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_clamps_to_valid_range() {
        assert_eq!(Quality::new(0).value(), 1);
        assert_eq!(Quality::new(50).value(), 50);
        assert_eq!(Quality::new(150).value(), 100);
    }

    #[test]
    fn quality_default_is_80() {
        assert_eq!(Quality::default().value(), 80);
    }

    #[test]
    fn sharpening_light_values() {
        let s = Sharpening::light();
        assert_eq!(s.sigma, 0.5);
        assert_eq!(s.threshold, 0);
    }
}
