//! Per-document run summary and the run-history log.
//!
//! [`ProcessOutcome`] is the contract consumed by the CLI (and any GUI or
//! API layer built on top of the library): it records what happened to
//! every page — processed, skipped, recovered by fallback — plus retry and
//! queue-stall statistics, so an operator can tell a fully OCR'd document
//! apart from one with image-only recovered pages.
//!
//! The outcome is built incrementally while the run executes and is
//! immutable once returned. [`RunLog`] appends finalized outcomes as JSON
//! lines to a daily history file; a logging failure never fails the run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Terminal status of one conversion run.
///
/// Cancellation is deliberately distinct from failure: a cancelled run
/// keeps its checkpoint and resumes cleanly, a failed run is a candidate
/// for the degraded-profile retry ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Succeeded,
    Cancelled,
    Failed,
}

impl RunStatus {
    pub fn is_success(self) -> bool {
        matches!(self, RunStatus::Succeeded)
    }
}

/// Summary of one document conversion run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessOutcome {
    pub status: RunStatus,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub total_pages: u32,
    /// Pages that went through recognition and carry a text layer.
    pub processed_pages: u32,
    /// Pages copied through without recognition (blank or already textual).
    pub skipped_pages: u32,
    /// Human-readable error and warning records accumulated during the run.
    pub errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub elapsed_seconds: f64,
    /// True when the run picked up a prior checkpoint.
    pub resumed_from_checkpoint: bool,
    /// 0-indexed first page processed by this run when resuming.
    pub resumed_from_page: u32,
    /// 1-indexed pages recovered by an image-only fallback copy.
    pub fallback_pages: Vec<u32>,
    /// Recognition retries per 1-indexed page (pages with ≥1 retry only).
    pub page_retry_counts: BTreeMap<u32, u32>,
    /// Times the render stage gave up a bounded queue push.
    pub queue_stall_events: u32,
}

impl ProcessOutcome {
    pub(crate) fn started(input: &Path, output: &Path) -> Self {
        Self {
            status: RunStatus::Failed,
            input_path: input.to_path_buf(),
            output_path: output.to_path_buf(),
            total_pages: 0,
            processed_pages: 0,
            skipped_pages: 0,
            errors: Vec::new(),
            started_at: Utc::now(),
            elapsed_seconds: 0.0,
            resumed_from_checkpoint: false,
            resumed_from_page: 0,
            fallback_pages: Vec::new(),
            page_retry_counts: BTreeMap::new(),
            queue_stall_events: 0,
        }
    }

    /// Record one recognition retry for a 0-indexed page.
    pub(crate) fn record_retry(&mut self, page_index: u32) {
        *self.page_retry_counts.entry(page_index + 1).or_insert(0) += 1;
    }

    /// Record an image-only fallback copy for a 0-indexed page.
    pub(crate) fn record_fallback(&mut self, page_index: u32, reason: &str) {
        let display = page_index + 1;
        if !self.fallback_pages.contains(&display) {
            self.fallback_pages.push(display);
            self.fallback_pages.sort_unstable();
        }
        self.errors
            .push(format!("Page {display}: recovered with image-only copy ({reason})"));
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Average seconds per recognized page, 0.0 when nothing was processed.
    pub fn per_page_seconds(&self) -> f64 {
        if self.processed_pages > 0 {
            self.elapsed_seconds / self.processed_pages as f64
        } else {
            0.0
        }
    }
}

/// Append-only JSONL history of finished runs.
///
/// One file per day (`run_YYYYMMDD.jsonl`) under the log directory,
/// mirroring the checkpoint store's layout next to it.
pub struct RunLog {
    log_dir: PathBuf,
}

impl RunLog {
    /// Default log directory: `~/.textlayer/logs`.
    pub fn default_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".textlayer")
            .join("logs")
    }

    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
        }
    }

    /// Append one finalized outcome. Errors are swallowed by callers on
    /// purpose — history is best-effort.
    pub fn append(&self, outcome: &ProcessOutcome) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.log_dir)?;
        let file_name = format!("run_{}.jsonl", Utc::now().format("%Y%m%d"));
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_dir.join(file_name))?;
        let line = serde_json::to_string(outcome)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        writeln!(file, "{line}")
    }
}
