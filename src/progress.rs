//! Progress-callback trait for per-page conversion events.
//!
//! Inject an `Arc<dyn ConversionProgress>` via
//! [`crate::config::ConversionConfigBuilder::progress_callback`] to receive
//! events as the pipeline processes each page.
//!
//! # Why callbacks instead of channels?
//!
//! The callback approach is the least-invasive integration point: callers
//! can forward events to a channel, a WebSocket, a database record, or a
//! terminal progress bar without the library knowing anything about how the
//! host application communicates. The trait is `Send + Sync` because the
//! pipeline invokes it from both the assembly task and (on fallback paths)
//! retry handling. Implementations must be cheap and non-blocking — the
//! callback fires on every page transition and a slow observer would starve
//! the render queue.

use std::sync::Arc;

/// Called by the pipeline as it processes each page.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. `current_page` is 1-indexed (display convention);
/// all internal pipeline state is 0-indexed.
pub trait ConversionProgress: Send + Sync {
    /// Called once when the run starts, after the page count is known.
    ///
    /// `resume_from` is the 0-indexed first unprocessed page when resuming
    /// from a checkpoint, or 0 on a fresh run.
    fn on_start(&self, total_pages: u32, resume_from: u32) {
        let _ = (total_pages, resume_from);
    }

    /// Called on every page transition (completed, skipped, or fallback).
    ///
    /// # Arguments
    /// * `current_page` — 1-indexed page number just resolved
    /// * `total_pages`  — total pages in the document
    fn on_page(&self, current_page: u32, total_pages: u32) {
        let _ = (current_page, total_pages);
    }

    /// Called when a page exhausts retries and is recovered by a fallback
    /// copy of the original page image.
    fn on_page_fallback(&self, current_page: u32, total_pages: u32, reason: &str) {
        let _ = (current_page, total_pages, reason);
    }

    /// Called once after the run finishes, whatever its status.
    fn on_finish(&self, total_pages: u32, processed: u32, skipped: u32) {
        let _ = (total_pages, processed, skipped);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgress;

impl ConversionProgress for NoopProgress {}

/// Convenience alias matching the type stored in
/// [`crate::config::ConversionConfig`].
pub type ProgressCallback = Arc<dyn ConversionProgress>;
