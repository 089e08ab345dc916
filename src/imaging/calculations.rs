//! Pure calculation functions for image dimensions.
//!
//! All functions here are pure and testable without any I/O or images.

/// Scale `source` to `target_width`, preserving aspect ratio.
///
/// Never upscales: sources narrower than the target keep their size.
///
/// # Examples
/// ```
/// # use photo_manifest::imaging::fit_width;
/// assert_eq!(fit_width((4000, 3000), 600), (600, 450));
/// assert_eq!(fit_width((300, 200), 600), (300, 200));
/// ```
pub fn fit_width(source: (u32, u32), target_width: u32) -> (u32, u32) {
    let (src_w, src_h) = source;
    if src_w <= target_width || src_w == 0 {
        return source;
    }
    let h = (target_width as f64 * src_h as f64 / src_w as f64).round() as u32;
    (target_width, h.max(1))
}

/// Scale `source` so its longer edge is at most `max_edge`.
///
/// Never upscales. Used for the thumb hash input (max 100) and for the
/// tone-analysis sample.
pub fn fit_within(source: (u32, u32), max_edge: u32) -> (u32, u32) {
    let (src_w, src_h) = source;
    let longer = src_w.max(src_h);
    if longer <= max_edge || longer == 0 {
        return source;
    }
    let scale = max_edge as f64 / longer as f64;
    (
        ((src_w as f64 * scale).round() as u32).max(1),
        ((src_h as f64 * scale).round() as u32).max(1),
    )
}

/// `width / height`, or 1.0 for degenerate input.
pub fn aspect_ratio(width: u32, height: u32) -> f64 {
    if height == 0 {
        1.0
    } else {
        width as f64 / height as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // fit_width tests
    // =========================================================================

    #[test]
    fn fit_width_landscape() {
        assert_eq!(fit_width((4000, 3000), 600), (600, 450));
    }

    #[test]
    fn fit_width_portrait() {
        assert_eq!(fit_width((3000, 4500), 600), (600, 900));
    }

    #[test]
    fn fit_width_never_upscales() {
        assert_eq!(fit_width((320, 240), 600), (320, 240));
        assert_eq!(fit_width((600, 10), 600), (600, 10));
    }

    #[test]
    fn fit_width_keeps_at_least_one_pixel() {
        assert_eq!(fit_width((10_000, 1), 600), (600, 1));
    }

    // =========================================================================
    // fit_within tests
    // =========================================================================

    #[test]
    fn fit_within_scales_longer_edge() {
        assert_eq!(fit_within((4000, 3000), 100), (100, 75));
        assert_eq!(fit_within((3000, 4000), 100), (75, 100));
    }

    #[test]
    fn fit_within_small_source_unchanged() {
        assert_eq!(fit_within((64, 48), 100), (64, 48));
    }

    #[test]
    fn aspect_ratio_values() {
        assert_eq!(aspect_ratio(1500, 1000), 1.5);
        assert_eq!(aspect_ratio(10, 0), 1.0);
    }
}
