//! Top-level conversion entry points and whole-document recovery.
//!
//! A failed run is re-attempted under progressively lighter profiles
//! because most real-world failures on end-user machines are
//! resource-exhaustion-shaped: too many workers for the available memory,
//! a render too large for the page, an engine that wedged under load.
//! Stepping down (fewer workers → single process → lower resolution and
//! fast quality) converts many of those into successes.
//!
//! Failure classification gates the ladder: input-shaped errors (missing
//! file, wrong password, corrupt document) abort immediately — no profile
//! fixes a bad input — and cancellation is terminal by definition. The
//! checkpoint makes re-attempts cheap: an attempt with unchanged render
//! parameters resumes where the failed one stopped instead of redoing its
//! pages.

use crate::config::{ConversionConfig, QualityMode};
use crate::document::DocumentBackend;
use crate::error::{ConvertError, FailureClass};
use crate::outcome::{ProcessOutcome, RunLog, RunStatus};
use crate::pipeline::coordinator::Pipeline;
use crate::pipeline::CancelFlag;
use std::path::Path;
use std::sync::Arc;
use tokio::time::{timeout, Duration};
use tracing::{info, warn};

/// Minimum DPI the degraded ladder will step down to.
const DEGRADED_DPI_FLOOR: u32 = 120;

/// Convert one scanned PDF into a searchable PDF using the default
/// (pdfium-backed) document collaborator.
///
/// Equivalent to [`convert_with_backend`] with
/// [`crate::pdfium::PdfiumBackend`].
pub async fn convert(
    input: &Path,
    output: &Path,
    config: &ConversionConfig,
    cancel: CancelFlag,
) -> Result<ProcessOutcome, ConvertError> {
    convert_with_backend(Arc::new(crate::pdfium::PdfiumBackend::new()), input, output, config, cancel)
        .await
}

/// Convert with an explicit document backend (tests inject fakes here).
///
/// Wraps each attempt in the document wall-clock timeout and applies the
/// degraded-profile retry ladder. Every finished run — succeeded,
/// cancelled, or exhausted — is appended to the run-history log,
/// best-effort.
pub async fn convert_with_backend<B: DocumentBackend>(
    backend: Arc<B>,
    input: &Path,
    output: &Path,
    config: &ConversionConfig,
    cancel: CancelFlag,
) -> Result<ProcessOutcome, ConvertError> {
    let attempts = config.task_retry_limit + 1;
    let mut profile = config.clone();

    for attempt in 0..attempts {
        if attempt > 0 {
            profile = degrade(&profile, attempt);
            info!(
                "document retry {attempt}/{}: workers={}, dpi={}, quality={}",
                attempts - 1,
                profile.workers,
                profile.dpi,
                profile.quality
            );
        }

        let pipeline = Pipeline::new(Arc::clone(&backend), profile.clone());
        let run = pipeline.process_file(input, output, cancel.clone());
        let result = match timeout(Duration::from_secs(profile.document_timeout_secs), run).await
        {
            Ok(result) => result,
            Err(_) => Err(ConvertError::DocumentTimeout {
                secs: profile.document_timeout_secs,
            }),
        };

        match result {
            Ok(outcome) => {
                log_history(&outcome);
                return Ok(outcome);
            }
            Err(e) => {
                let class = e.classify();
                let is_last = attempt + 1 >= attempts;
                match class {
                    FailureClass::Retryable if !is_last && !cancel.is_cancelled() => {
                        warn!("attempt {} failed ({e}), stepping down profile", attempt + 1);
                    }
                    _ => {
                        log_failure(input, output, &e);
                        return Err(e);
                    }
                }
            }
        }
    }

    unreachable!("retry loop always returns")
}

/// Step the profile down one notch.
///
/// Attempt 1 drops to a single process (clears worker-pool memory and
/// device contention); attempt 2 additionally lowers the resolution and
/// switches to the fast engine models. Changing the DPI invalidates the
/// prior checkpoint by design — pages rendered at different resolutions
/// cannot share one output document.
fn degrade(profile: &ConversionConfig, attempt: u32) -> ConversionConfig {
    let mut next = profile.clone();
    next.workers = 1;
    next.worker_command = None;
    if attempt >= 2 {
        next.dpi = (profile.dpi * 3 / 4).max(DEGRADED_DPI_FLOOR);
        next.quality = QualityMode::Fast;
        // A prebuilt engine carries the old quality; rebuild from config.
        next.engine = None;
    }
    next
}

/// Front-door input check for queue-style callers: exists, opens, and has
/// at least one page. Produces the same classified errors a full run
/// would, so callers can reject bad files before queueing them.
pub fn validate_input<B: DocumentBackend>(
    backend: &B,
    input: &Path,
    password: Option<&str>,
) -> Result<u32, ConvertError> {
    use crate::document::SourceDocument;

    if !input.exists() {
        return Err(ConvertError::FileNotFound {
            path: input.to_path_buf(),
        });
    }
    let source = backend.open(input, password)?;
    let pages = source.page_count();
    if pages == 0 {
        return Err(ConvertError::EmptyDocument {
            path: input.to_path_buf(),
        });
    }
    Ok(pages)
}

fn log_history(outcome: &ProcessOutcome) {
    let log = RunLog::new(RunLog::default_dir());
    if let Err(e) = log.append(outcome) {
        warn!("run history append failed: {e}");
    }
}

fn log_failure(input: &Path, output: &Path, error: &ConvertError) {
    let mut outcome = ProcessOutcome::started(input, output);
    outcome.status = RunStatus::Failed;
    outcome.errors.push(error.to_string());
    log_history(&outcome);
}
