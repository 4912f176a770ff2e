//! Render stage: rasterise and classify pages ahead of recognition.
//!
//! Runs inside `spawn_blocking` — the PDF rasteriser is a blocking C
//! library and must not stall the async executor. The stage opens its own
//! source-document handle and owns it exclusively; the assembly stage never
//! sees it.
//!
//! The queue push is a bounded retry loop, not a blocking send: if the
//! consumer stalls (slow recognition, cancellation mid-drain) the producer
//! gives up after `queue_push_retry_limit × queue_push_retry_ms` and
//! abandons the page, counting a stall event. The final integrity check in
//! the coordinator fills any resulting gap, so an abandoned push degrades a
//! page to a fallback copy instead of deadlocking the run.

use crate::config::ConversionConfig;
use crate::document::{DocumentBackend, PageGeometry, SourceDocument, PAGE_TEXT_CHARS_THRESHOLD};
use crate::pipeline::{pool, CancelFlag};
use image::DynamicImage;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Render stage abandons zoom reduction below this floor.
const MIN_ZOOM: f32 = 1.0;

/// Available-memory floor under which the render zoom is degraded.
const LOW_MEMORY_BYTES: u64 = 500 * 1024 * 1024;

/// Classification of one rendered page.
#[derive(Debug, Clone, PartialEq)]
pub enum PageKind {
    /// Needs recognition.
    Normal,
    /// Edge magnitude below the blank threshold — copy through.
    BlankSkip,
    /// Page already carries extractable text — copy through.
    TextSkip,
    /// Rasterisation failed; the page goes straight to fallback copy.
    RenderError(String),
}

/// One unit flowing through the bounded queue.
///
/// Exclusively owned by the render stage until queued, then by the
/// consumer until recognized or discarded.
#[derive(Debug)]
pub struct RenderedPage {
    /// 0-indexed source page.
    pub index: u32,
    /// Raster image; `None` for skip and error pages, which are copied
    /// verbatim and never need their pixels.
    pub image: Option<DynamicImage>,
    pub geometry: PageGeometry,
    /// The scale actually used for rendering. May be lower than requested
    /// due to adaptive capping — all coordinate conversion downstream must
    /// use this value, never the requested zoom.
    pub actual_scale: f32,
    pub kind: PageKind,
}

/// Handle to a spawned render stage.
pub struct RenderStage {
    pub rx: mpsc::Receiver<RenderedPage>,
    pub join: tokio::task::JoinHandle<Result<(), String>>,
    stalls: Arc<AtomicU32>,
}

impl RenderStage {
    /// Queue-stall events counted so far.
    pub fn stall_events(&self) -> u32 {
        self.stalls.load(Ordering::SeqCst)
    }
}

/// Spawn the background render stage.
///
/// Pages in `already_done` (loaded from a checkpoint) are never rendered —
/// resume must not redo completed work. Iteration starts at `start_page`
/// and runs in index order to the end of the document.
pub fn spawn<B: DocumentBackend>(
    backend: Arc<B>,
    input: PathBuf,
    config: &ConversionConfig,
    already_done: BTreeSet<u32>,
    start_page: u32,
    cancel: CancelFlag,
) -> RenderStage {
    let (tx, rx) = mpsc::channel::<RenderedPage>(config.prefetch_pages);
    let stalls = Arc::new(AtomicU32::new(0));

    let stalls_task = Arc::clone(&stalls);
    let password = config.password.clone();
    let base_zoom = config.base_zoom();
    let max_pixels = config.max_pixels;
    let max_side = config.max_side;
    let blank_threshold = config.blank_page_threshold;
    let skip_existing = config.skip_existing_text;
    let retry_limit = config.queue_push_retry_limit;
    let retry_ms = config.queue_push_retry_ms;

    let join = tokio::task::spawn_blocking(move || {
        let source = backend
            .open(&input, password.as_deref())
            .map_err(|e| format!("render stage failed to open source: {e}"))?;
        let total = source.page_count();

        // Bounded push; false = cancelled or retries exhausted.
        let push = |item: RenderedPage| -> bool {
            let mut retries = 0;
            let mut item = Some(item);
            loop {
                if cancel.is_cancelled() {
                    return false;
                }
                match tx.try_send(item.take().expect("item present")) {
                    Ok(()) => return true,
                    Err(mpsc::error::TrySendError::Full(back)) => {
                        retries += 1;
                        if retries >= retry_limit {
                            stalls_task.fetch_add(1, Ordering::SeqCst);
                            warn!("render queue stalled, abandoning page push");
                            return false;
                        }
                        item = Some(back);
                        std::thread::sleep(std::time::Duration::from_millis(retry_ms));
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => return false,
                }
            }
        };

        for index in start_page..total {
            if cancel.is_cancelled() {
                break;
            }
            if already_done.contains(&index) {
                continue;
            }

            let geometry = match source.page_geometry(index) {
                Ok(g) => g,
                Err(e) => {
                    if !push(RenderedPage {
                        index,
                        image: None,
                        geometry: PageGeometry {
                            width: 0.0,
                            height: 0.0,
                        },
                        actual_scale: 0.0,
                        kind: PageKind::RenderError(e.to_string()),
                    }) {
                        break;
                    }
                    continue;
                }
            };

            if skip_existing && source.page_text_chars(index) > PAGE_TEXT_CHARS_THRESHOLD {
                if !push(RenderedPage {
                    index,
                    image: None,
                    geometry,
                    actual_scale: 0.0,
                    kind: PageKind::TextSkip,
                }) {
                    break;
                }
                continue;
            }

            // Degrade the requested zoom under memory pressure before the
            // adaptive caps apply.
            let requested = match pool::available_memory_bytes() {
                Some(avail) if avail < LOW_MEMORY_BYTES => (base_zoom * 0.8).max(MIN_ZOOM),
                _ => base_zoom,
            };
            let actual_scale = adaptive_scale(geometry, requested, max_pixels, max_side);

            match source.render_page(index, actual_scale) {
                Ok(image) => {
                    let kind = if blank_score(&image) < blank_threshold {
                        PageKind::BlankSkip
                    } else {
                        PageKind::Normal
                    };
                    debug!(
                        page = index,
                        scale = actual_scale,
                        ?kind,
                        "rendered page"
                    );
                    let image = match kind {
                        // Blank pages are copied verbatim; drop the raster
                        // now instead of carrying it through the queue.
                        PageKind::BlankSkip => None,
                        _ => Some(image),
                    };
                    if !push(RenderedPage {
                        index,
                        image,
                        geometry,
                        actual_scale,
                        kind,
                    }) {
                        break;
                    }
                }
                Err(e) => {
                    if !push(RenderedPage {
                        index,
                        image: None,
                        geometry,
                        actual_scale,
                        kind: PageKind::RenderError(e.to_string()),
                    }) {
                        break;
                    }
                }
            }
        }

        // Dropping `tx` closes the channel; the consumer sees end-of-pages.
        Ok(())
    });

    RenderStage { rx, join, stalls }
}

/// Cap the requested render scale to the per-side and total-pixel limits.
///
/// The per-side cap applies first: recognition engines rescale anything
/// past their internal side limit, so pixels beyond it are pure waste. The
/// total-pixel cap then bounds peak raster memory. The returned scale is
/// authoritative for all downstream coordinate conversion.
pub fn adaptive_scale(
    geometry: PageGeometry,
    requested: f32,
    max_pixels: u64,
    max_side: u32,
) -> f32 {
    let mut scale = requested;
    let mut width = geometry.width * scale;
    let mut height = geometry.height * scale;

    let longest = width.max(height);
    if longest > max_side as f32 {
        let factor = max_side as f32 / longest;
        scale *= factor;
        width *= factor;
        height *= factor;
    }

    let pixels = width as f64 * height as f64;
    if pixels > max_pixels as f64 {
        scale *= ((max_pixels as f64 / pixels).sqrt()) as f32;
    }

    scale
}

/// Mean absolute adjacent-pixel difference, averaged over both axes.
///
/// A cheap stand-in for edge detection: a genuinely blank scan has almost
/// no pixel-to-pixel variation, while any content (text, specks, fold
/// lines) produces gradients. Not a content detector — the threshold is
/// tuned so that only near-uniform pages score below it.
pub fn blank_score(image: &DynamicImage) -> f32 {
    let gray = image.to_luma8();
    let (width, height) = gray.dimensions();
    if width < 2 || height < 2 {
        return 0.0;
    }

    let mut sum_x = 0u64;
    let mut sum_y = 0u64;
    for y in 0..height {
        for x in 0..width {
            let v = gray.get_pixel(x, y)[0] as i32;
            if x + 1 < width {
                sum_x += (gray.get_pixel(x + 1, y)[0] as i32 - v).unsigned_abs() as u64;
            }
            if y + 1 < height {
                sum_y += (gray.get_pixel(x, y + 1)[0] as i32 - v).unsigned_abs() as u64;
            }
        }
    }

    let mean_x = sum_x as f32 / (height * (width - 1)) as f32;
    let mean_y = sum_y as f32 / (width * (height - 1)) as f32;
    (mean_x + mean_y) / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    fn geometry(w: f32, h: f32) -> PageGeometry {
        PageGeometry {
            width: w,
            height: h,
        }
    }

    #[test]
    fn adaptive_scale_untouched_when_within_limits() {
        // A4 at 300 DPI: 2480 × 3508 px, well inside both caps.
        let scale = adaptive_scale(geometry(595.0, 842.0), 300.0 / 72.0, 100_000_000, 3800);
        assert!((scale - 300.0 / 72.0).abs() < 1e-6);
    }

    #[test]
    fn adaptive_scale_caps_longest_side() {
        // A0 poster at 300 DPI would be ~14 000 px tall.
        let geom = geometry(2384.0, 3370.0);
        let requested = 300.0 / 72.0;
        let scale = adaptive_scale(geom, requested, u64::MAX, 3800);
        assert!(scale < requested);
        let longest = (geom.width * scale).max(geom.height * scale);
        assert!(longest <= 3800.0 + 1.0, "longest side {longest}");
    }

    #[test]
    fn adaptive_scale_caps_total_pixels() {
        let geom = geometry(1000.0, 1000.0);
        let scale = adaptive_scale(geom, 4.0, 1_000_000, 1_000_000);
        let pixels = (geom.width * scale) as f64 * (geom.height * scale) as f64;
        assert!(pixels <= 1_000_000.0 * 1.01, "pixels {pixels}");
    }

    #[test]
    fn blank_score_low_for_uniform_page() {
        let img = DynamicImage::ImageLuma8(GrayImage::from_pixel(200, 200, Luma([250u8])));
        assert!(blank_score(&img) < 0.01);
    }

    #[test]
    fn blank_score_high_for_striped_page() {
        let img = DynamicImage::ImageLuma8(GrayImage::from_fn(200, 200, |x, _| {
            if x % 2 == 0 {
                Luma([0u8])
            } else {
                Luma([255u8])
            }
        }));
        assert!(blank_score(&img) > 10.0);
    }

    #[test]
    fn blank_score_degenerate_image_counts_as_blank() {
        let img = DynamicImage::ImageLuma8(GrayImage::from_pixel(1, 1, Luma([0u8])));
        assert_eq!(blank_score(&img), 0.0);
    }
}
