//! Image processing: pure Rust, statically linked.
//!
//! | Operation | Crate / function |
//! |---|---|
//! | **Identify** | `ImageDecoder::dimensions` + EXIF orientation |
//! | **Normalize** | BMP → PNG via the `image` PNG encoder |
//! | **Thumbnail** | Lanczos3 `resize` + `unsharpen` → JPEG |
//! | **Thumb hash** | `thumbhash` on a ≤100px copy |
//! | **Tone** | BT.709 luminance histogram → [`tone::classify`] |
//!
//! The module is split into:
//! - **Calculations**: Pure functions for dimension math (unit testable)
//! - **Parameters**: Data structures describing image operations
//! - **Backend**: [`ImageBackend`] trait + [`RustBackend`]
//! - **Operations**: High-level functions combining calculations + backend
//! - **Tone**: Histogram statistics and classification

pub mod backend;
mod calculations;
pub mod operations;
mod params;
pub mod rust_backend;
pub mod tone;

pub use backend::{
    BackendError, Dimensions, Histogram, ImageBackend, Normalized, Rendered, Thumbnail,
};
pub use calculations::{aspect_ratio, fit_width, fit_within};
pub use operations::{Derivatives, ThumbnailConfig, get_dimensions, normalize, render_derivatives};
pub use params::{Quality, RenderParams, Sharpening, ThumbnailParams};
pub use rust_backend::RustBackend;
