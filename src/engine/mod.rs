//! OCR engine collaborator boundary.
//!
//! The pipeline treats recognition as a black box: image in,
//! [`TextRegion`] list out. One engine instance is reused across many
//! calls — engines front-load their expensive model/initialisation work in
//! their constructor, which is exactly what the worker pool amortises by
//! keeping one warmed engine per worker process.

use crate::error::PageFailure;
use async_trait::async_trait;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

pub mod tesseract;

pub use tesseract::TesseractEngine;

/// One detected text region in image-pixel space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextRegion {
    pub text: String,
    /// Bounding quadrilateral, four `[x, y]` points in image pixels.
    /// Axis-aligned detectors emit the rectangle corners clockwise from
    /// top-left; skewed detectors may emit a genuine quadrilateral.
    pub quad: [[f32; 2]; 4],
    /// Confidence in `[0, 1]`.
    pub confidence: f32,
}

impl TextRegion {
    /// Build a region from an axis-aligned box.
    pub fn from_rect(text: impl Into<String>, x: f32, y: f32, w: f32, h: f32, confidence: f32) -> Self {
        Self {
            text: text.into(),
            quad: [[x, y], [x + w, y], [x + w, y + h], [x, y + h]],
            confidence,
        }
    }

    /// Left edge of the axis-aligned bounding box.
    pub fn x0(&self) -> f32 {
        self.quad.iter().map(|p| p[0]).fold(f32::INFINITY, f32::min)
    }

    /// Top edge.
    pub fn y0(&self) -> f32 {
        self.quad.iter().map(|p| p[1]).fold(f32::INFINITY, f32::min)
    }

    /// Right edge.
    pub fn x1(&self) -> f32 {
        self.quad.iter().map(|p| p[0]).fold(f32::NEG_INFINITY, f32::max)
    }

    /// Bottom edge.
    pub fn y1(&self) -> f32 {
        self.quad.iter().map(|p| p[1]).fold(f32::NEG_INFINITY, f32::max)
    }

    pub fn width(&self) -> f32 {
        self.x1() - self.x0()
    }

    pub fn height(&self) -> f32 {
        self.y1() - self.y0()
    }
}

/// Text recognition collaborator.
///
/// Implementations must be restartable per process and safe to call
/// repeatedly from one consumer; the pipeline never calls `recognize`
/// concurrently on a single instance.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Recognize all text regions in `image`.
    ///
    /// The page index is threaded through only for error attribution.
    async fn recognize(
        &self,
        page_index: u32,
        image: &DynamicImage,
    ) -> Result<Vec<TextRegion>, PageFailure>;

    /// Engine-native language codes this instance was built with.
    fn languages(&self) -> &[String];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bbox_derived_from_skewed_quad() {
        let region = TextRegion {
            text: "hello".into(),
            quad: [[10.0, 5.0], [98.0, 8.0], [100.0, 25.0], [12.0, 22.0]],
            confidence: 0.9,
        };
        assert_eq!(region.x0(), 10.0);
        assert_eq!(region.y0(), 5.0);
        assert_eq!(region.x1(), 100.0);
        assert_eq!(region.y1(), 25.0);
        assert_eq!(region.width(), 90.0);
        assert_eq!(region.height(), 20.0);
    }

    #[test]
    fn from_rect_builds_clockwise_quad() {
        let region = TextRegion::from_rect("t", 1.0, 2.0, 10.0, 4.0, 0.5);
        assert_eq!(region.quad[0], [1.0, 2.0]);
        assert_eq!(region.quad[2], [11.0, 6.0]);
        assert_eq!(region.width(), 10.0);
        assert_eq!(region.height(), 4.0);
    }
}
