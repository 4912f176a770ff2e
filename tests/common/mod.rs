//! In-memory fakes for the document and engine collaborators.
//!
//! `FakeBackend` encodes the source page index into each rendered image's
//! width (50 + index) so the output side can attribute appended pages
//! without any side channel — the pipeline under test only ever sees the
//! collaborator traits.

use async_trait::async_trait;
use image::{DynamicImage, GrayImage, Luma};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use textlayer::document::{
    DocumentBackend, OutputDocument, PageGeometry, SourceDocument, TextSpan,
};
use textlayer::error::{ConvertError, PageFailure};
use textlayer::engine::{OcrEngine, TextRegion};

pub const INDEX_WIDTH_BASE: u32 = 50;

/// One scripted source page.
#[derive(Clone, Debug, Default)]
pub struct FakePage {
    pub text: String,
    pub blank: bool,
    pub fail_render: bool,
}

impl FakePage {
    /// Image-only page with scanned content.
    pub fn normal() -> Self {
        Self::default()
    }

    /// Near-uniform page the blank detector should skip.
    pub fn blank() -> Self {
        Self {
            blank: true,
            ..Self::default()
        }
    }

    /// Page that already carries extractable text.
    pub fn textual() -> Self {
        Self {
            text: "x".repeat(120),
            ..Self::default()
        }
    }

    /// Page whose rasterisation fails.
    pub fn broken() -> Self {
        Self {
            fail_render: true,
            ..Self::default()
        }
    }
}

/// What landed in an output document.
#[derive(Clone, Debug, PartialEq)]
pub enum OutEntry {
    /// Verbatim copy of a source page (skip or fallback path).
    Copied(u32),
    /// Recognized page: visible image + `spans` invisible text runs.
    Recognized { index: u32, spans: usize },
}

impl OutEntry {
    pub fn index(&self) -> u32 {
        match self {
            OutEntry::Copied(index) => *index,
            OutEntry::Recognized { index, .. } => *index,
        }
    }
}

type SavedDocs = Arc<Mutex<HashMap<PathBuf, Vec<OutEntry>>>>;

/// In-memory document backend.
pub struct FakeBackend {
    pages: Arc<Vec<FakePage>>,
    saved: SavedDocs,
}

impl FakeBackend {
    pub fn new(pages: Vec<FakePage>) -> Self {
        Self {
            pages: Arc::new(pages),
            saved: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Entries of the document last saved at `path`.
    pub fn saved_at(&self, path: &Path) -> Option<Vec<OutEntry>> {
        self.saved.lock().unwrap().get(path).cloned()
    }

    /// Pre-seed a saved document, e.g. a temp artifact for resume tests.
    /// Also creates the file on disk so existence checks hold.
    pub fn seed_saved(&self, path: &Path, entries: Vec<OutEntry>) {
        std::fs::write(path, b"fake temp output").unwrap();
        self.saved.lock().unwrap().insert(path.to_path_buf(), entries);
    }
}

impl DocumentBackend for FakeBackend {
    type Source = FakeSource;
    type Output = FakeOutput;

    fn open(&self, path: &Path, _password: Option<&str>) -> Result<FakeSource, ConvertError> {
        if !path.exists() {
            return Err(ConvertError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        Ok(FakeSource {
            pages: Arc::clone(&self.pages),
        })
    }

    fn create_output(&self) -> Result<FakeOutput, ConvertError> {
        Ok(FakeOutput {
            entries: Vec::new(),
            saved: Arc::clone(&self.saved),
        })
    }

    fn open_output(&self, path: &Path) -> Result<FakeOutput, ConvertError> {
        let entries = self
            .saved
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| ConvertError::CorruptPdf {
                path: path.to_path_buf(),
                detail: "no saved document at path".to_string(),
            })?;
        Ok(FakeOutput {
            entries,
            saved: Arc::clone(&self.saved),
        })
    }
}

pub struct FakeSource {
    pages: Arc<Vec<FakePage>>,
}

impl SourceDocument for FakeSource {
    fn page_count(&self) -> u32 {
        self.pages.len() as u32
    }

    fn page_geometry(&self, index: u32) -> Result<PageGeometry, PageFailure> {
        if index as usize >= self.pages.len() {
            return Err(PageFailure::RenderFailed {
                page: index,
                detail: "page out of range".to_string(),
            });
        }
        Ok(PageGeometry {
            width: 100.0,
            height: 140.0,
        })
    }

    fn page_text(&self, index: u32) -> String {
        self.pages
            .get(index as usize)
            .map(|p| p.text.clone())
            .unwrap_or_default()
    }

    fn render_page(&self, index: u32, _scale: f32) -> Result<DynamicImage, PageFailure> {
        let page = self
            .pages
            .get(index as usize)
            .ok_or_else(|| PageFailure::RenderFailed {
                page: index,
                detail: "page out of range".to_string(),
            })?;
        if page.fail_render {
            return Err(PageFailure::RenderFailed {
                page: index,
                detail: "scripted render failure".to_string(),
            });
        }

        let width = INDEX_WIDTH_BASE + index;
        let image = if page.blank {
            GrayImage::from_pixel(width, 40, Luma([255u8]))
        } else {
            // High-contrast stripes keep the blank detector far above any
            // reasonable threshold.
            GrayImage::from_fn(width, 40, |x, _| {
                if x % 2 == 0 {
                    Luma([0u8])
                } else {
                    Luma([255u8])
                }
            })
        };
        Ok(DynamicImage::ImageLuma8(image))
    }
}

pub struct FakeOutput {
    entries: Vec<OutEntry>,
    saved: SavedDocs,
}

impl OutputDocument for FakeOutput {
    type Source = FakeSource;

    fn page_count(&self) -> u32 {
        self.entries.len() as u32
    }

    fn append_recognized_page(
        &mut self,
        _geometry: PageGeometry,
        image: &DynamicImage,
        _jpeg_quality: u8,
        spans: &[TextSpan],
    ) -> Result<(), PageFailure> {
        let index = image.width() - INDEX_WIDTH_BASE;
        self.entries.push(OutEntry::Recognized {
            index,
            spans: spans.len(),
        });
        Ok(())
    }

    fn copy_page_from(&mut self, _source: &FakeSource, index: u32) -> Result<(), PageFailure> {
        self.entries.push(OutEntry::Copied(index));
        Ok(())
    }

    fn reorder(&mut self, order: &[u32]) -> Result<(), ConvertError> {
        self.entries = order
            .iter()
            .map(|&pos| self.entries[pos as usize].clone())
            .collect();
        Ok(())
    }

    fn save(&mut self, path: &Path, _compact: bool) -> Result<(), ConvertError> {
        // A marker file keeps filesystem existence checks honest.
        std::fs::write(path, b"fake saved output").map_err(|source| {
            ConvertError::OutputWriteFailed {
                path: path.to_path_buf(),
                source,
            }
        })?;
        self.saved
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), self.entries.clone());
        Ok(())
    }
}

/// Engine whose per-page behaviour is scripted by the test.
#[derive(Default)]
pub struct ScriptedEngine {
    languages: Vec<String>,
    fail_counts: Mutex<HashMap<u32, u32>>,
    always_fail: HashSet<u32>,
    calls: Mutex<Vec<u32>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self {
            languages: vec!["eng".to_string()],
            ..Self::default()
        }
    }

    /// Fail the first `n` recognition attempts for `page`, then succeed.
    pub fn fail_times(self, page: u32, n: u32) -> Self {
        self.fail_counts.lock().unwrap().insert(page, n);
        self
    }

    /// Fail every recognition attempt for `page`.
    pub fn always_fail(mut self, page: u32) -> Self {
        self.always_fail.insert(page);
        self
    }

    /// Every page index passed to `recognize`, in call order.
    pub fn calls(&self) -> Vec<u32> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl OcrEngine for ScriptedEngine {
    async fn recognize(
        &self,
        page: u32,
        _image: &DynamicImage,
    ) -> Result<Vec<TextRegion>, PageFailure> {
        self.calls.lock().unwrap().push(page);

        if self.always_fail.contains(&page) {
            return Err(PageFailure::RecognitionFailed {
                page,
                detail: "scripted failure".to_string(),
            });
        }
        if let Some(remaining) = self.fail_counts.lock().unwrap().get_mut(&page) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(PageFailure::RecognitionFailed {
                    page,
                    detail: "scripted transient failure".to_string(),
                });
            }
        }

        Ok(vec![TextRegion::from_rect(
            format!("recognized text for page {page}"),
            10.0,
            10.0,
            120.0,
            20.0,
            0.9,
        )])
    }

    fn languages(&self) -> &[String] {
        &self.languages
    }
}
