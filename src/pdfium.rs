//! pdfium-backed implementation of the document collaborator traits.
//!
//! Binding resolution order: `PDFIUM_LIB_PATH`, a `./lib` directory next
//! to the working directory, then the system library. The binding is
//! process-wide and lazily initialised; with the `thread_safe` feature
//! every FFI call is serialized by the bindings' internal lock.

use crate::document::{
    DocumentBackend, OutputDocument, PageGeometry, SourceDocument, TextSpan,
};
use crate::error::{ConvertError, PageFailure};
use image::DynamicImage;
use once_cell::sync::Lazy;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tracing::debug;

static PDFIUM: Lazy<Result<Pdfium, String>> = Lazy::new(|| {
    if let Some(path) = std::env::var_os("PDFIUM_LIB_PATH") {
        let name = PathBuf::from(path).to_string_lossy().to_string();
        return Pdfium::bind_to_library(name)
            .map(Pdfium::new)
            .map_err(|e| format!("PDFIUM_LIB_PATH binding failed: {e:?}"));
    }
    Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./lib"))
        .or_else(|_| Pdfium::bind_to_system_library())
        .map(Pdfium::new)
        .map_err(|e| format!("no usable pdfium library found: {e:?}"))
});

fn pdfium() -> Result<&'static Pdfium, ConvertError> {
    PDFIUM
        .as_ref()
        .map_err(|e| ConvertError::Internal(format!("pdfium unavailable: {e}")))
}

/// Map a pdfium load error onto the input-error taxonomy, mirroring what
/// callers need to distinguish: password problems are actionable, the rest
/// is a corrupt input.
fn classify_load_error(error: PdfiumError, path: &Path, password: Option<&str>) -> ConvertError {
    let detail = format!("{error:?}");
    if detail.contains("Password") || detail.contains("password") {
        if password.is_some() {
            ConvertError::WrongPassword {
                path: path.to_path_buf(),
            }
        } else {
            ConvertError::PasswordRequired {
                path: path.to_path_buf(),
            }
        }
    } else {
        ConvertError::CorruptPdf {
            path: path.to_path_buf(),
            detail,
        }
    }
}

/// Document factory backed by pdfium.
#[derive(Default)]
pub struct PdfiumBackend;

impl PdfiumBackend {
    pub fn new() -> Self {
        Self
    }
}

impl DocumentBackend for PdfiumBackend {
    type Source = PdfiumSource;
    type Output = PdfiumOutput;

    fn open(&self, path: &Path, password: Option<&str>) -> Result<Self::Source, ConvertError> {
        match std::fs::metadata(path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConvertError::FileNotFound {
                    path: path.to_path_buf(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(ConvertError::PermissionDenied {
                    path: path.to_path_buf(),
                })
            }
            _ => {}
        }

        let doc = pdfium()?
            .load_pdf_from_file(path, password)
            .map_err(|e| classify_load_error(e, path, password))?;
        debug!("opened {} ({} pages)", path.display(), doc.pages().len());
        Ok(PdfiumSource { doc })
    }

    fn create_output(&self) -> Result<Self::Output, ConvertError> {
        let doc = pdfium()?
            .create_new_pdf()
            .map_err(|e| ConvertError::Internal(format!("create output document: {e:?}")))?;
        Ok(PdfiumOutput { doc })
    }

    fn open_output(&self, path: &Path) -> Result<Self::Output, ConvertError> {
        let doc = pdfium()?
            .load_pdf_from_file(path, None)
            .map_err(|e| ConvertError::CorruptPdf {
                path: path.to_path_buf(),
                detail: format!("{e:?}"),
            })?;
        Ok(PdfiumOutput { doc })
    }
}

/// Read handle over an input document.
pub struct PdfiumSource {
    doc: PdfDocument<'static>,
}

// The pipeline gives each handle a single owner at a time and the
// thread_safe bindings serialize every FFI call, so moving a handle
// between threads cannot race inside pdfium.
unsafe impl Send for PdfiumSource {}

impl SourceDocument for PdfiumSource {
    fn page_count(&self) -> u32 {
        self.doc.pages().len() as u32
    }

    fn page_geometry(&self, index: u32) -> Result<PageGeometry, PageFailure> {
        let page = self
            .doc
            .pages()
            .get(index as u16)
            .map_err(|e| PageFailure::RenderFailed {
                page: index,
                detail: format!("{e:?}"),
            })?;
        Ok(PageGeometry {
            width: page.width().value,
            height: page.height().value,
        })
    }

    fn page_text(&self, index: u32) -> String {
        self.doc
            .pages()
            .get(index as u16)
            .and_then(|page| page.text().map(|text| text.all()))
            .unwrap_or_default()
    }

    fn render_page(&self, index: u32, scale: f32) -> Result<DynamicImage, PageFailure> {
        let render_failed = |detail: String| PageFailure::RenderFailed {
            page: index,
            detail,
        };

        let page = self
            .doc
            .pages()
            .get(index as u16)
            .map_err(|e| render_failed(format!("{e:?}")))?;

        let config = PdfRenderConfig::new().scale_page_by_factor(scale);
        let bitmap = page
            .render_with_config(&config)
            .map_err(|e| render_failed(format!("{e:?}")))?;
        Ok(bitmap.as_image())
    }
}

/// Write handle over the document being assembled.
pub struct PdfiumOutput {
    doc: PdfDocument<'static>,
}

// Same single-owner + serialized-FFI invariant as `PdfiumSource`.
unsafe impl Send for PdfiumOutput {}

impl OutputDocument for PdfiumOutput {
    type Source = PdfiumSource;

    fn page_count(&self) -> u32 {
        self.doc.pages().len() as u32
    }

    fn append_recognized_page(
        &mut self,
        geometry: PageGeometry,
        image: &DynamicImage,
        _jpeg_quality: u8,
        spans: &[TextSpan],
    ) -> Result<(), PageFailure> {
        let index = self.doc.pages().len() as u32;
        let author_failed = |detail: String| PageFailure::RecognitionFailed {
            page: index,
            detail,
        };

        let mut page = self
            .doc
            .pages_mut()
            .create_page_at_end(PdfPagePaperSize::Custom(
                PdfPoints::new(geometry.width),
                PdfPoints::new(geometry.height),
            ))
            .map_err(|e| author_failed(format!("create page: {e:?}")))?;

        // Visible layer: the rendered page raster, fitted to the page.
        let image_object =
            PdfPageImageObject::new_with_width(&self.doc, image, PdfPoints::new(geometry.width))
                .map_err(|e| author_failed(format!("image object: {e:?}")))?;
        page.objects_mut()
            .add_image_object(image_object)
            .map_err(|e| author_failed(format!("add image: {e:?}")))?;

        // Invisible layer: one text object per span, converted from
        // top-left-origin span coordinates into PDF bottom-left space.
        let font = self.doc.fonts_mut().helvetica();
        for span in spans {
            let mut object = PdfPageTextObject::new(
                &self.doc,
                &span.text,
                font,
                PdfPoints::new(span.font_size),
            )
            .map_err(|e| author_failed(format!("text object: {e:?}")))?;

            object
                .set_text_render_mode(PdfPageTextRenderMode::Invisible)
                .map_err(|e| author_failed(format!("render mode: {e:?}")))?;

            if span.vertical {
                // Vertical runs anchor at the column's top-right corner and
                // flow downward.
                object
                    .rotate_clockwise_degrees(90.0)
                    .map_err(|e| author_failed(format!("rotate: {e:?}")))?;
                object
                    .translate(
                        PdfPoints::new(span.x + span.width),
                        PdfPoints::new(geometry.height - span.y),
                    )
                    .map_err(|e| author_failed(format!("translate: {e:?}")))?;
            } else {
                object
                    .translate(
                        PdfPoints::new(span.x),
                        PdfPoints::new(geometry.height - span.y - span.height),
                    )
                    .map_err(|e| author_failed(format!("translate: {e:?}")))?;
            }

            page.objects_mut()
                .add_text_object(object)
                .map_err(|e| author_failed(format!("add text: {e:?}")))?;
        }

        Ok(())
    }

    fn copy_page_from(&mut self, source: &Self::Source, index: u32) -> Result<(), PageFailure> {
        let destination = self.doc.pages().len();
        self.doc
            .pages_mut()
            .copy_page_from_document(&source.doc, index as u16, destination)
            .map_err(|e| PageFailure::RenderFailed {
                page: index,
                detail: format!("verbatim copy: {e:?}"),
            })
    }

    fn reorder(&mut self, order: &[u32]) -> Result<(), ConvertError> {
        // pdfium has no in-place page move; rebuild by copying pages in the
        // requested order and swap the handle.
        let mut rebuilt = pdfium()?
            .create_new_pdf()
            .map_err(|e| ConvertError::Internal(format!("reorder scratch document: {e:?}")))?;

        for (position, &current) in order.iter().enumerate() {
            rebuilt
                .pages_mut()
                .copy_page_from_document(&self.doc, current as u16, position as u16)
                .map_err(|e| {
                    ConvertError::Internal(format!(
                        "reorder copy {current} → {position}: {e:?}"
                    ))
                })?;
        }

        self.doc = rebuilt;
        Ok(())
    }

    fn save(&mut self, path: &Path, _compact: bool) -> Result<(), ConvertError> {
        // pdfium always writes a full, linearly rebuilt file; `compact` is
        // meaningful for backends that distinguish fast saves from
        // garbage-collected ones.
        self.doc
            .save_to_file(path)
            .map_err(|e| ConvertError::OutputWriteFailed {
                path: path.to_path_buf(),
                source: std::io::Error::other(format!("{e:?}")),
            })
    }
}
