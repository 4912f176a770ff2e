//! CLI binary for textlayer.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `ConversionConfig` and prints results. Also hosts the hidden
//! `--ocr-worker` mode that the worker pool launches as child processes.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use textlayer::engine::tesseract::{TesseractConfig, TesseractEngine};
use textlayer::{
    convert, export, pdfium::PdfiumBackend, pipeline::pool, validate_input, CancelFlag,
    CheckpointStore, ConversionConfig, ConversionProgress, ProgressCallback, QualityMode,
    RunStatus,
};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: a live bar plus per-event log lines.
/// Page transitions can arrive for non-consecutive indices (skips emitted
/// eagerly, batches completing), so the bar tracks a completion counter
/// rather than the page number itself.
struct CliProgress {
    bar: ProgressBar,
    completed: AtomicU32,
}

impl CliProgress {
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0); // length set in on_start

        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Opening PDF…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            completed: AtomicU32::new(0),
        })
    }

    fn activate_bar(&self, total: u32) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Converting");
        self.bar.reset_eta();
    }
}

impl ConversionProgress for CliProgress {
    fn on_start(&self, total_pages: u32, resume_from: u32) {
        self.activate_bar(total_pages);
        if resume_from > 0 {
            self.completed.store(resume_from, Ordering::SeqCst);
            self.bar.set_position(resume_from as u64);
            self.bar.println(format!(
                "{} {}",
                cyan("◆"),
                bold(&format!(
                    "Resuming from page {} of {total_pages}…",
                    resume_from + 1
                ))
            ));
        } else {
            self.bar.println(format!(
                "{} {}",
                cyan("◆"),
                bold(&format!("Converting {total_pages} pages…"))
            ));
        }
    }

    fn on_page(&self, page: u32, _total: u32) {
        let done = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        self.bar.set_position(done as u64);
        self.bar.set_message(format!("page {page}"));
    }

    fn on_page_fallback(&self, page: u32, _total: u32, reason: &str) {
        let msg = if reason.chars().count() > 80 {
            let truncated: String = reason.chars().take(79).collect();
            format!("{truncated}\u{2026}")
        } else {
            reason.to_string()
        };
        self.bar.println(format!(
            "  {} Page {:>3}  {}",
            red("✗"),
            page,
            red(&format!("image-only copy: {msg}")),
        ));
    }

    fn on_finish(&self, total_pages: u32, processed: u32, skipped: u32) {
        self.bar.finish_and_clear();
        let recovered = total_pages.saturating_sub(processed + skipped);
        if recovered == 0 {
            eprintln!(
                "{} {} pages converted ({} skipped)",
                green("✔"),
                bold(&processed.to_string()),
                skipped
            );
        } else {
            eprintln!(
                "{} {}/{} pages converted  ({} skipped, {} image-only)",
                cyan("⚠"),
                bold(&processed.to_string()),
                total_pages,
                skipped,
                red(&recovered.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Basic conversion (writes scan_ocr.pdf next to the input)
  textlayer scan.pdf

  # Explicit output path, German + English recognition
  textlayer scan.pdf -o searchable.pdf --languages deu,eng

  # Two OCR worker processes, fast models
  textlayer scan.pdf --workers 2 --quality fast

  # Auto-size the worker pool for this machine
  textlayer scan.pdf --workers 0

  # Resume an interrupted run (automatic — just run the same command again)
  textlayer scan.pdf

  # Start over, ignoring any previous progress
  textlayer scan.pdf --no-checkpoint

  # Also dump the recognized text
  textlayer scan.pdf --export-txt scan.txt

RECOGNITION:
  Recognition uses the `tesseract` binary found on PATH (override with
  TESSERACT_PATH). Install language packs for every code you pass to
  --languages.

CHECKPOINTS:
  Progress is saved to ~/.textlayer/checkpoints after every page. An
  interrupted run resumes automatically if the input file, resolution, and
  languages are unchanged. Stale checkpoints older than 24 hours are
  cleaned up at startup.

ENVIRONMENT VARIABLES:
  TESSERACT_PATH     Path to the tesseract binary
  PDFIUM_LIB_PATH    Path to an existing libpdfium — skips discovery
"#;

/// Make scanned PDFs searchable by embedding an invisible OCR text layer.
#[derive(Parser, Debug)]
#[command(
    name = "textlayer",
    version,
    about = "Make scanned PDFs searchable by embedding an invisible OCR text layer",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Input scanned PDF. Not required in worker mode.
    input: Option<PathBuf>,

    /// Output path. Defaults to `<input>_ocr.pdf` next to the input.
    #[arg(short, long, env = "TEXTLAYER_OUTPUT")]
    output: Option<PathBuf>,

    /// Rendering DPI (72–600).
    #[arg(long, env = "TEXTLAYER_DPI", default_value_t = 300,
          value_parser = clap::value_parser!(u32).range(72..=600))]
    dpi: u32,

    /// OCR worker processes. 1 = in-process, 0 = auto-size for this machine.
    #[arg(short, long, env = "TEXTLAYER_WORKERS", default_value_t = 1)]
    workers: usize,

    /// Recognition languages, comma-separated engine codes.
    #[arg(long, env = "TEXTLAYER_LANGUAGES", default_value = "eng", value_delimiter = ',')]
    languages: Vec<String>,

    /// Engine quality mode.
    #[arg(long, env = "TEXTLAYER_QUALITY", value_enum, default_value = "balanced")]
    quality: QualityArg,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "TEXTLAYER_PASSWORD")]
    password: Option<String>,

    /// Recognize pages even when they already contain extractable text.
    #[arg(long, env = "TEXTLAYER_NO_SKIP_EXISTING")]
    no_skip_existing: bool,

    /// Blank-page detection threshold (mean edge magnitude).
    #[arg(long, env = "TEXTLAYER_BLANK_THRESHOLD", default_value_t = 0.5)]
    blank_threshold: f32,

    /// Recognition retries per page before falling back.
    #[arg(long, env = "TEXTLAYER_PAGE_RETRIES", default_value_t = 2)]
    page_retries: u32,

    /// Fail the run instead of copying the original page after retry
    /// exhaustion.
    #[arg(long, env = "TEXTLAYER_NO_FALLBACK")]
    no_fallback: bool,

    /// Pages prefetched ahead of recognition.
    #[arg(long, env = "TEXTLAYER_PREFETCH", default_value_t = 4)]
    prefetch: usize,

    /// Disable checkpoint/resume for this run.
    #[arg(long, env = "TEXTLAYER_NO_CHECKPOINT")]
    no_checkpoint: bool,

    /// Checkpoint directory override.
    #[arg(long, env = "TEXTLAYER_CHECKPOINT_DIR")]
    checkpoint_dir: Option<PathBuf>,

    /// Whole-document timeout in seconds.
    #[arg(long, env = "TEXTLAYER_TIMEOUT", default_value_t = 1800)]
    timeout: u64,

    /// Also export the recognized text to this file after conversion.
    #[arg(long, env = "TEXTLAYER_EXPORT_TXT")]
    export_txt: Option<PathBuf>,

    /// Print the outcome summary as JSON instead of human-readable text.
    #[arg(long, env = "TEXTLAYER_JSON")]
    json: bool,

    /// Disable the progress bar.
    #[arg(long, env = "TEXTLAYER_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "TEXTLAYER_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "TEXTLAYER_QUIET")]
    quiet: bool,

    /// Serve OCR requests over stdin/stdout (used by the worker pool).
    #[arg(long, hide = true)]
    ocr_worker: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum QualityArg {
    Fast,
    Balanced,
    High,
}

impl From<QualityArg> for QualityMode {
    fn from(v: QualityArg) -> Self {
        match v {
            QualityArg::Fast => QualityMode::Fast,
            QualityArg::Balanced => QualityMode::Balanced,
            QualityArg::High => QualityMode::High,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Worker mode: serve recognition requests and exit ─────────────────
    if cli.ocr_worker {
        // Engine construction is the warm-up step — it happens exactly once
        // per worker process, before the ready handshake.
        let engine = TesseractEngine::new(TesseractConfig {
            languages: cli.languages.clone(),
            quality: cli.quality.into(),
            program: None,
            timeout_secs: 120,
        });
        pool::serve_worker(Arc::new(engine))
            .await
            .context("worker loop failed")?;
        return Ok(());
    }

    // ── Logging setup ────────────────────────────────────────────────────
    // Suppress INFO-level library logs when the progress bar is active;
    // the bar provides the feedback that matters.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let input = cli
        .input
        .clone()
        .context("an input PDF path is required")?;
    let output = cli.output.clone().unwrap_or_else(|| {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "output".to_string());
        input.with_file_name(format!("{stem}_ocr.pdf"))
    });

    // ── Startup maintenance: reclaim state orphaned by crashes ───────────
    let checkpoint_dir = cli
        .checkpoint_dir
        .clone()
        .unwrap_or_else(CheckpointStore::default_dir);
    if !cli.no_checkpoint {
        if let Ok(store) = CheckpointStore::open(&checkpoint_dir) {
            store.sweep(chrono::Duration::hours(24));
        }
    }

    // ── Early input validation for a friendly error before any work ──────
    let backend = PdfiumBackend::new();
    let pages = validate_input(&backend, &input, cli.password.as_deref())
        .context("input validation failed")?;
    tracing::debug!("input has {pages} pages");

    if !cli.no_skip_existing && !cli.quiet {
        use textlayer::document::{has_existing_text, DocumentBackend};
        if let Ok(source) = backend.open(&input, cli.password.as_deref()) {
            if has_existing_text(&source) {
                eprintln!(
                    "{} input already contains extractable text — textual pages will be copied through",
                    dim("·")
                );
            }
        }
    }

    // ── Build config ─────────────────────────────────────────────────────
    let workers = if cli.workers == 0 {
        let snapshot = pool::SystemSnapshot::detect();
        let recommended = pool::recommended_workers(&snapshot);
        if !cli.quiet {
            eprintln!(
                "{} auto-sized worker pool: {} ({} cores)",
                dim("·"),
                recommended,
                snapshot.physical_cores
            );
        }
        recommended
    } else {
        cli.workers
    };

    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgress::new_dynamic() as ProgressCallback)
    } else {
        None
    };

    let mut builder = ConversionConfig::builder()
        .dpi(cli.dpi)
        .workers(workers)
        .languages(cli.languages.clone())
        .quality(cli.quality.into())
        .skip_existing_text(!cli.no_skip_existing)
        .blank_page_threshold(cli.blank_threshold)
        .page_retry_limit(cli.page_retries)
        .allow_fallback_copy(!cli.no_fallback)
        .prefetch_pages(cli.prefetch)
        .enable_checkpoint(!cli.no_checkpoint)
        .checkpoint_dir(&checkpoint_dir)
        .document_timeout_secs(cli.timeout);
    if let Some(pwd) = &cli.password {
        builder = builder.password(pwd.clone());
    }
    if let Some(cb) = progress_cb {
        builder = builder.progress_callback(cb);
    }
    let config = builder.build().context("invalid configuration")?;

    // ── Cancellation: first Ctrl-C stops at the next page boundary ───────
    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\n{} stopping at the next page — progress will be saved", cyan("◆"));
                cancel.cancel();
            }
        });
    }

    // ── Run ──────────────────────────────────────────────────────────────
    let outcome = convert(&input, &output, &config, cancel)
        .await
        .context("conversion failed")?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    match outcome.status {
        RunStatus::Cancelled => {
            eprintln!(
                "{} cancelled — rerun the same command to resume from page {}",
                cyan("◆"),
                outcome.processed_pages + outcome.skipped_pages + 1
            );
            std::process::exit(130);
        }
        RunStatus::Succeeded => {
            if !cli.quiet {
                eprintln!(
                    "{}  {} pages in {:.1}s  →  {}",
                    if outcome.fallback_pages.is_empty() {
                        green("✔")
                    } else {
                        cyan("⚠")
                    },
                    outcome.total_pages,
                    outcome.elapsed_seconds,
                    bold(&output.display().to_string()),
                );
                if !outcome.fallback_pages.is_empty() {
                    eprintln!(
                        "   {} page(s) kept image-only: {}",
                        outcome.fallback_pages.len(),
                        dim(&format!("{:?}", outcome.fallback_pages)),
                    );
                }
                if outcome.queue_stall_events > 0 {
                    eprintln!(
                        "   {} queue stall event(s) — consider a deeper --prefetch",
                        outcome.queue_stall_events
                    );
                }
            }
        }
        RunStatus::Failed => unreachable!("failed runs return Err"),
    }

    // ── Optional text export ─────────────────────────────────────────────
    if let Some(txt_path) = &cli.export_txt {
        export::export_text(&backend, &output, txt_path).context("text export failed")?;
        if !cli.quiet {
            eprintln!("   text exported to {}", bold(&txt_path.display().to_string()));
        }
    }

    Ok(())
}
