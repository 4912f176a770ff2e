//! Error types for the textlayer library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`ConvertError`] — **Fatal**: the conversion cannot proceed at all
//!   (missing input, encrypted PDF, output page count short after gap
//!   filling). Returned as `Err(ConvertError)` from the top-level
//!   `convert*` functions.
//!
//! * [`PageFailure`] — **Non-fatal**: a single page failed (render glitch,
//!   recognition error, worker crash) but the pipeline keeps going. Page
//!   failures are absorbed into retry-then-fallback handling and surface
//!   as structured records in [`crate::outcome::ProcessOutcome`], never as
//!   a propagated error.
//!
//! The separation keeps the pipeline's control flow explicit: a page
//! failure is routed (retry, fall back, record), a fatal error aborts.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the textlayer library.
///
/// Page-level failures use [`PageFailure`] and are recorded in
/// [`crate::outcome::ProcessOutcome`] rather than propagated here.
#[derive(Debug, Error)]
pub enum ConvertError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'")]
    PermissionDenied { path: PathBuf },

    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' is corrupt: {detail}\nTry repairing with: qpdf --decrypt input.pdf output.pdf")]
    CorruptPdf { path: PathBuf, detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF '{path}' is encrypted and requires a password.\nProvide it with --password <PASSWORD>.")]
    PasswordRequired { path: PathBuf },

    /// A password was provided but it is wrong.
    #[error("Wrong password for PDF '{path}'")]
    WrongPassword { path: PathBuf },

    /// The document opened but contains no pages.
    #[error("PDF '{path}' has no pages")]
    EmptyDocument { path: PathBuf },

    // ── Pipeline errors ───────────────────────────────────────────────────
    /// A page exhausted its retries and fallback copying is disabled.
    #[error("Page {page} failed after {attempts} attempts and fallback copy is disabled: {detail}")]
    PageUnrecoverable {
        page: u32,
        attempts: u32,
        detail: String,
    },

    /// The assembled output disagrees with the source page count even
    /// after gap filling.
    #[error("Output page count mismatch: {actual} of {expected} pages")]
    IntegrityFailure { expected: u32, actual: u32 },

    /// Whole-document wall-clock timeout expired.
    #[error("Processing timed out after {secs}s — the file may be damaged or too large for the current profile")]
    DocumentTimeout { secs: u64 },

    /// The worker pool could not be started or lost its workers.
    #[error("OCR worker pool failure: {detail}")]
    WorkerPool { detail: String },

    /// The OCR engine is unusable (binary missing, model load failure).
    #[error("OCR engine unavailable: {detail}")]
    EngineUnavailable { detail: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the output document.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The checkpoint directory could not be created or written.
    #[error("Checkpoint store unavailable at '{path}': {source}")]
    CheckpointStoreUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal failure for a single page.
///
/// Carried through the pipeline as data (`Ok(regions) | Err(PageFailure)`)
/// so the coordinator can classify and route it without unwinding across
/// stage boundaries.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum PageFailure {
    /// Page rasterisation failed.
    #[error("Page {page}: render failed: {detail}")]
    RenderFailed { page: u32, detail: String },

    /// The OCR engine returned an error for this page.
    #[error("Page {page}: recognition failed: {detail}")]
    RecognitionFailed { page: u32, detail: String },

    /// A pool worker died or returned garbage for this page.
    #[error("Page {page}: worker failure: {detail}")]
    WorkerFailed { page: u32, detail: String },

    /// Recognition exceeded its per-call timeout.
    #[error("Page {page}: recognition timed out after {secs}s")]
    Timeout { page: u32, secs: u64 },
}

impl PageFailure {
    /// 0-indexed page this failure belongs to.
    pub fn page(&self) -> u32 {
        match self {
            PageFailure::RenderFailed { page, .. }
            | PageFailure::RecognitionFailed { page, .. }
            | PageFailure::WorkerFailed { page, .. }
            | PageFailure::Timeout { page, .. } => *page,
        }
    }
}

/// Coarse classification used by the document-level retry ladder.
///
/// Decides whether a failed run is worth re-attempting under a degraded
/// profile (see [`crate::task`]) or must abort immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The user asked to stop. Never retried; checkpoint is preserved.
    Cancelled,
    /// Input-shaped problems a retry cannot fix (missing file, bad
    /// password, corrupt document, permissions).
    NonRetryable,
    /// Resource-shaped problems that often clear under a lighter profile
    /// (timeout, worker crash, memory pressure).
    Retryable,
}

impl ConvertError {
    /// Classify this error for the document-level retry ladder.
    pub fn classify(&self) -> FailureClass {
        match self {
            ConvertError::FileNotFound { .. }
            | ConvertError::PermissionDenied { .. }
            | ConvertError::CorruptPdf { .. }
            | ConvertError::PasswordRequired { .. }
            | ConvertError::WrongPassword { .. }
            | ConvertError::EmptyDocument { .. }
            | ConvertError::InvalidConfig(_)
            | ConvertError::CheckpointStoreUnavailable { .. } => FailureClass::NonRetryable,

            ConvertError::DocumentTimeout { .. }
            | ConvertError::WorkerPool { .. }
            | ConvertError::EngineUnavailable { .. }
            | ConvertError::IntegrityFailure { .. }
            | ConvertError::PageUnrecoverable { .. }
            | ConvertError::OutputWriteFailed { .. }
            | ConvertError::Internal(_) => FailureClass::Retryable,
        }
    }
}
