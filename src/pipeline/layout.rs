//! Invisible-text placement: recognition results → positioned spans.
//!
//! Pure geometry, no I/O. Image-pixel coordinates divide by the *actual*
//! render scale to land in page points — using the requested scale here is
//! the classic misaligned-text-layer bug, because adaptive capping may have
//! rendered at a lower resolution than asked for.

use crate::document::TextSpan;
use crate::engine::TextRegion;

/// Font size clamp range, points.
const MIN_FONT_SIZE: f32 = 4.0;
const MAX_FONT_SIZE: f32 = 72.0;

/// Convert recognition results into positioned invisible text spans.
///
/// Regions below `min_confidence` or with empty text are dropped. The
/// returned spans use top-left-origin page points (see
/// [`crate::document::TextSpan`]).
pub fn build_text_layer(
    regions: &[TextRegion],
    actual_scale: f32,
    min_confidence: f32,
) -> Vec<TextSpan> {
    if actual_scale <= 0.0 {
        return Vec::new();
    }

    let mut spans = Vec::with_capacity(regions.len());

    for region in regions {
        if region.confidence < min_confidence {
            continue;
        }
        let text = region.text.trim();
        if text.is_empty() {
            continue;
        }

        let x0 = region.x0() / actual_scale;
        let y0 = region.y0() / actual_scale;
        let x1 = region.x1() / actual_scale;
        let y1 = region.y1() / actual_scale;

        let width = x1 - x0;
        let height = y1 - y0;
        let char_count = text.chars().count().max(1) as f32;

        // A region much taller than wide is a vertical run (common in CJK
        // layouts); its font size follows the column width, text flows
        // top-to-bottom.
        let vertical = height > width * 2.0;

        let font_size = if vertical {
            (width * 0.9).min(height / char_count * 0.9)
        } else {
            (height * 0.9).min(width / char_count * 1.5)
        }
        .clamp(MIN_FONT_SIZE, MAX_FONT_SIZE);

        spans.push(TextSpan {
            text: text.to_string(),
            x: x0,
            y: y0,
            width,
            height,
            font_size,
            vertical,
        });
    }

    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spans_scale_by_actual_scale_only() {
        // Region at 400..800 px rendered at scale 4 → 100..200 points.
        let regions = vec![TextRegion::from_rect("hello", 400.0, 400.0, 400.0, 80.0, 0.99)];
        let spans = build_text_layer(&regions, 4.0, 0.5);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].x, 100.0);
        assert_eq!(spans[0].y, 100.0);
        assert_eq!(spans[0].width, 100.0);
        assert_eq!(spans[0].height, 20.0);
    }

    #[test]
    fn low_confidence_and_empty_regions_dropped() {
        let regions = vec![
            TextRegion::from_rect("noise", 0.0, 0.0, 50.0, 10.0, 0.2),
            TextRegion::from_rect("   ", 0.0, 20.0, 50.0, 10.0, 0.9),
            TextRegion::from_rect("kept", 0.0, 40.0, 50.0, 10.0, 0.9),
        ];
        let spans = build_text_layer(&regions, 1.0, 0.5);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].text, "kept");
    }

    #[test]
    fn tall_narrow_region_is_vertical() {
        let regions = vec![TextRegion::from_rect("縦書き文字列", 10.0, 10.0, 20.0, 300.0, 0.9)];
        let spans = build_text_layer(&regions, 1.0, 0.5);
        assert!(spans[0].vertical);
        // Font follows the column width for vertical runs.
        assert!(spans[0].font_size <= 20.0 * 0.9 + f32::EPSILON);
    }

    #[test]
    fn horizontal_font_size_fits_height_and_width() {
        // 10 chars in a 100×20 box: height bound = 18, width bound = 15.
        let regions = vec![TextRegion::from_rect("abcdefghij", 0.0, 0.0, 100.0, 20.0, 0.9)];
        let spans = build_text_layer(&regions, 1.0, 0.5);
        assert!(!spans[0].vertical);
        assert!((spans[0].font_size - 15.0).abs() < 0.01);
    }

    #[test]
    fn font_size_clamped_to_range() {
        let tiny = vec![TextRegion::from_rect("x", 0.0, 0.0, 2.0, 2.0, 0.9)];
        let huge = vec![TextRegion::from_rect("Y", 0.0, 0.0, 800.0, 400.0, 0.9)];
        assert_eq!(build_text_layer(&tiny, 1.0, 0.5)[0].font_size, MIN_FONT_SIZE);
        assert_eq!(build_text_layer(&huge, 1.0, 0.5)[0].font_size, MAX_FONT_SIZE);
    }

    #[test]
    fn zero_scale_yields_no_spans() {
        let regions = vec![TextRegion::from_rect("x", 0.0, 0.0, 10.0, 10.0, 0.9)];
        assert!(build_text_layer(&regions, 0.0, 0.5).is_empty());
    }
}
