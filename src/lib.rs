//! # textlayer
//!
//! Convert scanned (image-only) PDFs into searchable PDFs: render each
//! page, recognize its text with an external OCR engine, and embed an
//! invisible, correctly positioned text layer over the original image.
//!
//! ## Why this crate?
//!
//! Recognition itself is a solved, external problem — the engineering
//! that makes a converter dependable on real documents is the pipeline
//! around it: rendering ahead of recognition, spreading recognition over
//! worker processes, surviving crashes, resuming exactly where a previous
//! run stopped, and guaranteeing the final document has every page in
//! order with no silent gaps.
//!
//! ## Pipeline Overview
//!
//! ```text
//! scanned PDF
//!  │
//!  ├─ 1. Render    background stage rasterises + classifies pages
//!  │               (blank / already-textual pages skip recognition)
//!  ├─ 2. Recognize in-process, or batched over a pool of persistent
//!  │               OCR worker processes
//!  ├─ 3. Assemble  image layer + invisible text layer per page,
//!  │               checkpoint after every page
//!  ├─ 4. Verify    page count and ordering validated before final save
//!  └─ searchable PDF
//! ```
//!
//! Interrupted runs resume from a durable checkpoint; pages that defeat
//! recognition are retried with backoff and finally copied through
//! image-only, each such recovery attributed to its page in the outcome.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use textlayer::{convert, CancelFlag, ConversionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConversionConfig::builder()
//!         .dpi(300)
//!         .languages(["eng"])
//!         .build()?;
//!     let outcome = convert(
//!         "scan.pdf".as_ref(),
//!         "scan_ocr.pdf".as_ref(),
//!         &config,
//!         CancelFlag::new(),
//!     )
//!     .await?;
//!     eprintln!(
//!         "{} pages processed, {} skipped, {} recovered",
//!         outcome.processed_pages,
//!         outcome.skipped_pages,
//!         outcome.fallback_pages.len()
//!     );
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `textlayer` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! textlayer = { version = "0.4", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod checkpoint;
pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod export;
pub mod outcome;
pub mod pdfium;
pub mod pipeline;
pub mod progress;
pub mod task;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use checkpoint::{Checkpoint, CheckpointStore, PageOutcome};
pub use config::{ConversionConfig, ConversionConfigBuilder, QualityMode};
pub use document::{DocumentBackend, OutputDocument, PageGeometry, SourceDocument, TextSpan};
pub use engine::{OcrEngine, TesseractEngine, TextRegion};
pub use error::{ConvertError, FailureClass, PageFailure};
pub use outcome::{ProcessOutcome, RunLog, RunStatus};
pub use pipeline::coordinator::Pipeline;
pub use pipeline::pool::{recommended_workers, SystemSnapshot, WorkerPool};
pub use pipeline::CancelFlag;
pub use progress::{ConversionProgress, NoopProgress, ProgressCallback};
pub use task::{convert, convert_with_backend, validate_input};
