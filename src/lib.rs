//! # Photo Manifest
//!
//! Incremental builder for a photo catalog. It scans a photo source (a local
//! directory, an Eagle library, an S3-compatible bucket or a GitHub
//! repository), derives thumbnails, perceptual hashes, EXIF, tone and
//! embedded video information, optionally reverse-geocodes GPS positions,
//! and writes one versioned `manifest.json` for a gallery front-end.
//!
//! # Pipeline
//!
//! ```text
//! storage listing ─→ cache decisions ─→ per-photo pipeline ─→ manifest
//!   (exclusions,        (skip / full /      (fetch, thumbnail,    (sort, cameras,
//!    live pairs)         partial rework)     metadata, video)      lenses, save)
//! ```
//!
//! Most runs touch only what changed: the [`cache`] engine compares each
//! listed object with its previous manifest entry before any byte is
//! fetched, and unchanged photos are copied forward untouched.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`builder`] | Run state machine: listing, task preparation, dispatch, aggregation, save |
//! | [`process`] | Per-photo pipeline producing a manifest item or a task failure |
//! | [`cache`] | Pure skip/process decisions, force flags, run statistics |
//! | [`storage`] | `StorageProvider` trait, backends, exclusions, upload observation |
//! | [`imaging`] | Decode, normalization, thumbnails, thumb hash, tone analysis |
//! | [`exif`] | ExifTool invocation and metadata picking |
//! | [`motion`] | Motion-photo trailers embedded in still images |
//! | [`geocoding`] | Reverse geocoding with caching and cross-process rate limiting |
//! | [`plugins`] | Lifecycle hooks and the built-in plugins |
//! | [`cluster`] | Multi-process dispatch over a JSON-lines protocol |
//! | [`manifest`] | Manifest load/save and derived lists |
//! | [`config`] | `builder.toml` loading, merging and validation |
//! | [`progress`] | Progress listener interface |
//! | [`output`] | CLI formatting of progress and summaries |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`types`] | Data model shared by every stage |
//! | [`naming`] | Key classification and photo ids |
//!
//! # Design Decisions
//!
//! ## Blocking I/O on Rayon
//!
//! Per-photo work is dominated by decoding, encoding and an external
//! process, so tasks run on a bounded rayon pool with a blocking HTTP
//! client. No async runtime is involved.
//!
//! ## Failing One Photo, Not the Run
//!
//! Decode failures, ExifTool timeouts and contradictory video sources fail
//! only their task; the photo is left out of the manifest and listed in the
//! summary. Only storage listing, manifest I/O and plugin hooks can abort a
//! run.
//!
//! ## Processes for Isolation
//!
//! Cluster mode runs the same binary as workers. They share nothing but the
//! config they are sent and the geocoding lock directory, which keeps the
//! rate limit honest across processes.

pub mod builder;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod exif;
pub mod geocoding;
pub mod http;
pub mod imaging;
pub mod logging;
pub mod manifest;
pub mod motion;
pub mod naming;
pub mod output;
pub mod plugins;
pub mod process;
pub mod progress;
pub mod retry;
pub mod storage;
pub mod types;

#[cfg(test)]
pub(crate) mod test_helpers;
