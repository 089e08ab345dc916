//! Histogram-based tone classification.
//!
//! Works on a 256-bucket luminance histogram. The shadow band is the first
//! third of buckets (`0..85`), the highlight band the last third
//! (`171..256`). Rules, checked in order:
//!
//! | Class | Rule |
//! |---|---|
//! | low-key | mean < 30% and shadow mass ≥ 60% |
//! | high-key | mean > 70% and highlight mass ≥ 60% |
//! | high-contrast | normalized std-dev > 60% and both bands > 30% |
//! | normal | otherwise |

use super::backend::Histogram;
use crate::types::{ToneAnalysis, ToneType};

const SHADOW_END: usize = 85;
const HIGHLIGHT_START: usize = 171;

/// Summary statistics of a histogram, as percentages.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToneStats {
    /// Mean luminance, 0–100.
    pub brightness: f64,
    /// Standard deviation relative to half the range, 0–100.
    pub contrast: f64,
    /// Share of pixels in the shadow band, 0–100.
    pub shadow_ratio: f64,
    /// Share of pixels in the highlight band, 0–100.
    pub highlight_ratio: f64,
}

pub fn tone_stats(histogram: &Histogram) -> Option<ToneStats> {
    let total: u64 = histogram.iter().sum();
    if total == 0 {
        return None;
    }
    let total_f = total as f64;
    let mean = histogram
        .iter()
        .enumerate()
        .map(|(value, &count)| value as f64 * count as f64)
        .sum::<f64>()
        / total_f;
    let variance = histogram
        .iter()
        .enumerate()
        .map(|(value, &count)| (value as f64 - mean).powi(2) * count as f64)
        .sum::<f64>()
        / total_f;
    let shadow: u64 = histogram[..SHADOW_END].iter().sum();
    let highlight: u64 = histogram[HIGHLIGHT_START..].iter().sum();

    Some(ToneStats {
        brightness: mean / 255.0 * 100.0,
        contrast: (variance.sqrt() / 127.5 * 100.0).min(100.0),
        shadow_ratio: shadow as f64 / total_f * 100.0,
        highlight_ratio: highlight as f64 / total_f * 100.0,
    })
}

pub fn classify(stats: &ToneStats) -> ToneType {
    if stats.brightness < 30.0 && stats.shadow_ratio >= 60.0 {
        ToneType::LowKey
    } else if stats.brightness > 70.0 && stats.highlight_ratio >= 60.0 {
        ToneType::HighKey
    } else if stats.contrast > 60.0 && stats.shadow_ratio > 30.0 && stats.highlight_ratio > 30.0 {
        ToneType::HighContrast
    } else {
        ToneType::Normal
    }
}

/// Classify a histogram. `None` for an empty histogram.
pub fn analyze(histogram: &Histogram) -> Option<ToneAnalysis> {
    let stats = tone_stats(histogram)?;
    let round1 = |v: f64| (v * 10.0).round() / 10.0;
    Some(ToneAnalysis {
        tone_type: classify(&stats),
        brightness: round1(stats.brightness),
        contrast: round1(stats.contrast),
        shadow_ratio: round1(stats.shadow_ratio),
        highlight_ratio: round1(stats.highlight_ratio),
    })
}
