//! Configuration types for scanned-PDF → searchable-PDF conversion.
//!
//! All pipeline behaviour is controlled through [`ConversionConfig`], built
//! via its [`ConversionConfigBuilder`]. Keeping every knob in one struct
//! makes it trivial to share configs across stages, serialise them for
//! logging, and diff two runs to understand why their outputs differ.
//!
//! # Design choice: builder over constructor
//! A twenty-field constructor is unreadable and breaks on every new field.
//! The builder pattern lets callers set only what they care about and rely
//! on documented defaults for the rest.

use crate::engine::OcrEngine;
use crate::error::ConvertError;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Configuration for one conversion run.
///
/// Built via [`ConversionConfig::builder()`] or using
/// [`ConversionConfig::default()`].
///
/// # Example
/// ```rust
/// use textlayer::ConversionConfig;
///
/// let config = ConversionConfig::builder()
///     .dpi(300)
///     .workers(2)
///     .languages(["eng", "deu"])
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ConversionConfig {
    /// Rendering DPI for rasterising each page. Range: 72–600. Default: 300.
    ///
    /// 300 DPI is the recognition sweet spot for printed text. Lower values
    /// save memory and time on clean large-type scans; higher values only
    /// help for very small fonts and quickly run into the adaptive caps
    /// below.
    pub dpi: u32,

    /// Total-pixel ceiling for a rendered page. Default: 100 000 000.
    ///
    /// An A0 poster at 300 DPI would otherwise allocate gigabytes of raster.
    /// When a page exceeds this, the scale is reduced isotropically until it
    /// fits. The reduced scale is carried on the rendered page and is
    /// authoritative for all downstream coordinate conversion.
    pub max_pixels: u64,

    /// Per-side pixel ceiling for a rendered page. Default: 3800.
    ///
    /// OCR engines rescale oversized inputs internally (commonly at 4000 px
    /// per side) without telling the caller, which wastes render work while
    /// producing no extra quality. Capping just below that limit keeps every
    /// rendered pixel useful.
    pub max_side: u32,

    /// Minimum confidence for a recognized region to be written into the
    /// text layer. Range 0.0–1.0. Default: 0.5.
    pub min_confidence: f32,

    /// Bounded render-queue depth (pages prefetched ahead of recognition).
    /// Default: 4.
    ///
    /// Deeper prefetch hides render latency behind recognition but holds
    /// more full-page rasters in memory at once.
    pub prefetch_pages: usize,

    /// Blank-page threshold on mean adjacent-pixel gradient. Default: 0.5.
    ///
    /// Pages whose average edge magnitude falls below this are copied
    /// through without recognition. 0.5 is deliberately conservative: a
    /// false "not blank" costs one wasted OCR call, a false "blank" would
    /// silently discard content. Tune against your own corpus.
    pub blank_page_threshold: f32,

    /// Skip pages that already carry extractable text. Default: true.
    pub skip_existing_text: bool,

    /// Number of OCR worker processes. Default: 1.
    ///
    /// 1 = recognition runs in-process on the consumer. >1 = rendered pages
    /// are JPEG-compressed and batched out to a pool of persistent worker
    /// processes, each with its own loaded engine. See
    /// [`crate::pipeline::pool::recommended_workers`] for a sizing hint.
    pub workers: usize,

    /// Page-level recognition retries before falling back. Default: 2.
    pub page_retry_limit: u32,

    /// Initial retry delay in milliseconds (exponential backoff). Default: 500.
    ///
    /// Doubles after each attempt: 500 ms → 1 s → 2 s.
    pub retry_backoff_ms: u64,

    /// Copy the original page (image only, no text layer) after retry
    /// exhaustion instead of failing the run. Default: true.
    pub allow_fallback_copy: bool,

    /// Pages between periodic saves of the temporary output. Default: 10.
    ///
    /// Saving every page would stall the consumer long enough to starve the
    /// render queue; saving rarely loses more work on a crash.
    pub save_interval: u32,

    /// JPEG quality for the embedded page image in the output. Default: 85.
    pub output_jpeg_quality: u8,

    /// JPEG quality for worker-pool image transfer. Default: 95.
    ///
    /// Still roughly 10× smaller than the raw raster, which is what makes
    /// inter-process submission cheap.
    pub transfer_jpeg_quality: u8,

    /// Recognition languages, engine-native codes. Default: `["eng"]`.
    pub languages: Vec<String>,

    /// Engine quality/speed trade-off. Default: [`QualityMode::Balanced`].
    pub quality: QualityMode,

    /// PDF user password for encrypted inputs.
    pub password: Option<String>,

    /// Pre-constructed OCR engine. When set, in-process recognition uses it
    /// directly; when `None`, a tesseract subprocess engine is built from
    /// `languages` and `quality`.
    pub engine: Option<Arc<dyn OcrEngine>>,

    /// Enable checkpoint/resume. Default: true.
    pub enable_checkpoint: bool,

    /// Checkpoint directory override. Default: `~/.textlayer/checkpoints`.
    pub checkpoint_dir: Option<PathBuf>,

    /// Per-recognition-call timeout in seconds. Default: 120.
    pub recognition_timeout_secs: u64,

    /// Whole-document wall-clock timeout in seconds. Default: 1800.
    pub document_timeout_secs: u64,

    /// Graceful pool-shutdown window before workers are killed. Default: 15.
    pub pool_shutdown_timeout_secs: u64,

    /// Bounded-push retry count for the render queue. Default: 120.
    ///
    /// Together with `queue_push_retry_ms` this bounds how long the render
    /// stage waits on a stalled consumer (120 × 500 ms = 60 s — recognition
    /// of a dense page can legitimately take tens of seconds).
    pub queue_push_retry_limit: u32,

    /// Delay between bounded-push retries in milliseconds. Default: 500.
    pub queue_push_retry_ms: u64,

    /// Extra whole-document attempts under degraded profiles. Default: 2.
    pub task_retry_limit: u32,

    /// Override for the worker-process launch command. Default: the current
    /// executable with its hidden worker flag. Tests use this to inject
    /// stub workers.
    pub worker_command: Option<Vec<String>>,

    /// Per-page progress observer. Default: none.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            dpi: 300,
            max_pixels: 100_000_000,
            max_side: 3800,
            min_confidence: 0.5,
            prefetch_pages: 4,
            blank_page_threshold: 0.5,
            skip_existing_text: true,
            workers: 1,
            page_retry_limit: 2,
            retry_backoff_ms: 500,
            allow_fallback_copy: true,
            save_interval: 10,
            output_jpeg_quality: 85,
            transfer_jpeg_quality: 95,
            languages: vec!["eng".to_string()],
            quality: QualityMode::default(),
            password: None,
            engine: None,
            enable_checkpoint: true,
            checkpoint_dir: None,
            recognition_timeout_secs: 120,
            document_timeout_secs: 1800,
            pool_shutdown_timeout_secs: 15,
            queue_push_retry_limit: 120,
            queue_push_retry_ms: 500,
            task_retry_limit: 2,
            worker_command: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ConversionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionConfig")
            .field("dpi", &self.dpi)
            .field("max_pixels", &self.max_pixels)
            .field("max_side", &self.max_side)
            .field("min_confidence", &self.min_confidence)
            .field("prefetch_pages", &self.prefetch_pages)
            .field("blank_page_threshold", &self.blank_page_threshold)
            .field("skip_existing_text", &self.skip_existing_text)
            .field("workers", &self.workers)
            .field("page_retry_limit", &self.page_retry_limit)
            .field("allow_fallback_copy", &self.allow_fallback_copy)
            .field("save_interval", &self.save_interval)
            .field("languages", &self.languages)
            .field("quality", &self.quality)
            .field("engine", &self.engine.as_ref().map(|_| "<dyn OcrEngine>"))
            .field("enable_checkpoint", &self.enable_checkpoint)
            .field("task_retry_limit", &self.task_retry_limit)
            .finish()
    }
}

impl ConversionConfig {
    /// Create a new builder for `ConversionConfig`.
    pub fn builder() -> ConversionConfigBuilder {
        ConversionConfigBuilder {
            config: Self::default(),
        }
    }

    /// Rendering zoom corresponding to `dpi` (PDF native space is 72 DPI).
    pub fn base_zoom(&self) -> f32 {
        self.dpi as f32 / 72.0
    }
}

/// Builder for [`ConversionConfig`].
pub struct ConversionConfigBuilder {
    config: ConversionConfig,
}

impl ConversionConfigBuilder {
    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 600);
        self
    }

    pub fn max_pixels(mut self, px: u64) -> Self {
        self.config.max_pixels = px.max(1_000_000);
        self
    }

    pub fn max_side(mut self, px: u32) -> Self {
        self.config.max_side = px.max(100);
        self
    }

    pub fn min_confidence(mut self, c: f32) -> Self {
        self.config.min_confidence = c.clamp(0.0, 1.0);
        self
    }

    pub fn prefetch_pages(mut self, n: usize) -> Self {
        self.config.prefetch_pages = n.max(1);
        self
    }

    pub fn blank_page_threshold(mut self, t: f32) -> Self {
        self.config.blank_page_threshold = t.max(0.0);
        self
    }

    pub fn skip_existing_text(mut self, v: bool) -> Self {
        self.config.skip_existing_text = v;
        self
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.config.workers = n.max(1);
        self
    }

    pub fn page_retry_limit(mut self, n: u32) -> Self {
        self.config.page_retry_limit = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn allow_fallback_copy(mut self, v: bool) -> Self {
        self.config.allow_fallback_copy = v;
        self
    }

    pub fn save_interval(mut self, n: u32) -> Self {
        self.config.save_interval = n.max(1);
        self
    }

    pub fn output_jpeg_quality(mut self, q: u8) -> Self {
        self.config.output_jpeg_quality = q.clamp(10, 100);
        self
    }

    pub fn transfer_jpeg_quality(mut self, q: u8) -> Self {
        self.config.transfer_jpeg_quality = q.clamp(10, 100);
        self
    }

    pub fn languages<I, S>(mut self, langs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.languages = langs.into_iter().map(Into::into).collect();
        self
    }

    pub fn quality(mut self, q: QualityMode) -> Self {
        self.config.quality = q;
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn engine(mut self, engine: Arc<dyn OcrEngine>) -> Self {
        self.config.engine = Some(engine);
        self
    }

    pub fn enable_checkpoint(mut self, v: bool) -> Self {
        self.config.enable_checkpoint = v;
        self
    }

    pub fn checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.checkpoint_dir = Some(dir.into());
        self
    }

    pub fn recognition_timeout_secs(mut self, secs: u64) -> Self {
        self.config.recognition_timeout_secs = secs.max(1);
        self
    }

    pub fn document_timeout_secs(mut self, secs: u64) -> Self {
        self.config.document_timeout_secs = secs.max(1);
        self
    }

    pub fn pool_shutdown_timeout_secs(mut self, secs: u64) -> Self {
        self.config.pool_shutdown_timeout_secs = secs.max(1);
        self
    }

    pub fn queue_push_retry_limit(mut self, n: u32) -> Self {
        self.config.queue_push_retry_limit = n.max(1);
        self
    }

    pub fn queue_push_retry_ms(mut self, ms: u64) -> Self {
        self.config.queue_push_retry_ms = ms.max(1);
        self
    }

    pub fn task_retry_limit(mut self, n: u32) -> Self {
        self.config.task_retry_limit = n;
        self
    }

    pub fn worker_command<I, S>(mut self, cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.worker_command = Some(cmd.into_iter().map(Into::into).collect());
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ConversionConfig, ConvertError> {
        let c = &self.config;
        if c.dpi < 72 || c.dpi > 600 {
            return Err(ConvertError::InvalidConfig(format!(
                "DPI must be 72–600, got {}",
                c.dpi
            )));
        }
        if c.workers == 0 {
            return Err(ConvertError::InvalidConfig("workers must be ≥ 1".into()));
        }
        if c.languages.is_empty() {
            return Err(ConvertError::InvalidConfig(
                "at least one recognition language is required".into(),
            ));
        }
        if !(0.0..=1.0).contains(&c.min_confidence) {
            return Err(ConvertError::InvalidConfig(format!(
                "min_confidence must be in [0,1], got {}",
                c.min_confidence
            )));
        }
        Ok(self.config)
    }
}

/// Engine quality/speed trade-off.
///
/// Three modes exist because recognition model choice trades accuracy
/// against latency and memory. The document-level retry ladder steps down
/// to [`QualityMode::Fast`] when a run fails under resource pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityMode {
    /// Fastest models, lower accuracy. Good for clean print.
    Fast,
    /// Best quality/speed ratio. (default)
    #[default]
    Balanced,
    /// Highest accuracy, slowest.
    High,
}

impl fmt::Display for QualityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityMode::Fast => write!(f, "fast"),
            QualityMode::Balanced => write!(f, "balanced"),
            QualityMode::High => write!(f, "high"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_clamps_out_of_range_values() {
        let config = ConversionConfig::builder()
            .dpi(1200)
            .workers(0)
            .min_confidence(1.7)
            .build()
            .unwrap();
        assert_eq!(config.dpi, 600);
        assert_eq!(config.workers, 1);
        assert_eq!(config.min_confidence, 1.0);
    }

    #[test]
    fn build_rejects_empty_languages() {
        let err = ConversionConfig::builder()
            .languages(Vec::<String>::new())
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("language"));
    }

    #[test]
    fn base_zoom_follows_dpi() {
        let config = ConversionConfig::builder().dpi(144).build().unwrap();
        assert!((config.base_zoom() - 2.0).abs() < f32::EPSILON);
    }
}
