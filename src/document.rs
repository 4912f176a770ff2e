//! Document I/O collaborator boundary.
//!
//! The pipeline never talks to a PDF library directly — it goes through
//! these traits. The production implementation is
//! [`crate::pdfium::PdfiumBackend`]; tests drive the coordinator with
//! in-memory fakes.
//!
//! Ownership rules (enforced by the pipeline, assumed by implementations):
//! the render stage opens its own [`SourceDocument`] handle and is its sole
//! user; the assembly stage exclusively owns a second source handle plus
//! the single [`OutputDocument`]. No handle is ever shared between stages.

use crate::error::{ConvertError, PageFailure};
use image::DynamicImage;
use std::path::Path;

/// Page dimensions in PDF points (1/72 inch).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageGeometry {
    pub width: f32,
    pub height: f32,
}

/// One invisible text run, positioned in page space.
///
/// Coordinates use the top-left-origin convention (y grows downward),
/// matching rendered-image space divided by the render scale. Backends
/// writing into bottom-left-origin PDF space convert at the boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct TextSpan {
    pub text: String,
    /// Left edge of the region, page points.
    pub x: f32,
    /// Top edge of the region, page points.
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub font_size: f32,
    /// Vertical writing direction: text flows top-to-bottom.
    pub vertical: bool,
}

/// Factory for document handles.
pub trait DocumentBackend: Send + Sync + 'static {
    type Source: SourceDocument;
    type Output: OutputDocument<Source = Self::Source>;

    /// Open an existing document for reading.
    fn open(&self, path: &Path, password: Option<&str>) -> Result<Self::Source, ConvertError>;

    /// Create an empty output document.
    fn create_output(&self) -> Result<Self::Output, ConvertError>;

    /// Reopen a previously saved (temporary) output document for appending,
    /// used when resuming from a checkpoint.
    fn open_output(&self, path: &Path) -> Result<Self::Output, ConvertError>;
}

/// Read-only access to the input document.
pub trait SourceDocument: Send + 'static {
    fn page_count(&self) -> u32;

    fn page_geometry(&self, index: u32) -> Result<PageGeometry, PageFailure>;

    /// The page's extractable text; empty for image-only pages.
    fn page_text(&self, index: u32) -> String;

    /// Length of the page's extractable text, used to classify pages that
    /// are already textual and need no recognition.
    fn page_text_chars(&self, index: u32) -> u32 {
        self.page_text(index).trim().chars().count() as u32
    }

    /// Rasterise one page at `scale` (1.0 = 72 DPI native size).
    fn render_page(&self, index: u32, scale: f32) -> Result<DynamicImage, PageFailure>;
}

/// Write access to the document being assembled.
pub trait OutputDocument: Send + 'static {
    type Source: SourceDocument;

    fn page_count(&self) -> u32;

    /// Append a recognized page: the rendered image as the visible layer
    /// plus invisible text spans on top.
    fn append_recognized_page(
        &mut self,
        geometry: PageGeometry,
        image: &DynamicImage,
        jpeg_quality: u8,
        spans: &[TextSpan],
    ) -> Result<(), PageFailure>;

    /// Copy one page verbatim from the source (skip and fallback paths).
    fn copy_page_from(&mut self, source: &Self::Source, index: u32) -> Result<(), PageFailure>;

    /// Rearrange pages: `order[k]` is the current position of the page that
    /// must end up at position `k`. `order` is a permutation of
    /// `0..page_count()`.
    fn reorder(&mut self, order: &[u32]) -> Result<(), ConvertError>;

    /// Persist to `path`. `compact = false` is the fast mode used for
    /// periodic recovery saves; `compact = true` garbage-collects and
    /// compresses for the final artifact.
    fn save(&mut self, path: &Path, compact: bool) -> Result<(), ConvertError>;
}

/// Threshold above which a single page counts as already textual.
pub const PAGE_TEXT_CHARS_THRESHOLD: u32 = 50;

/// Threshold above which a whole document counts as already textual.
pub const DOCUMENT_TEXT_CHARS_THRESHOLD: u32 = 100;

/// True when the document already carries substantial extractable text —
/// callers can use this as a front-door check before queueing a file that
/// does not need OCR at all.
pub fn has_existing_text(source: &impl SourceDocument) -> bool {
    let mut total = 0u32;
    for index in 0..source.page_count() {
        total += source.page_text_chars(index);
        if total > DOCUMENT_TEXT_CHARS_THRESHOLD {
            return true;
        }
    }
    false
}
