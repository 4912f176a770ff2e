//! End-to-end pipeline scenarios against in-memory collaborators.

mod common;

use common::{FakeBackend, FakePage, OutEntry, ScriptedEngine};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use textlayer::checkpoint::{CheckpointStore, PageOutcome};
use textlayer::progress::ConversionProgress;
use textlayer::{convert_with_backend, CancelFlag, ConversionConfig, RunStatus};

struct Scenario {
    _dir: TempDir,
    input: PathBuf,
    output: PathBuf,
    checkpoint_dir: PathBuf,
    backend: Arc<FakeBackend>,
}

fn scenario(pages: Vec<FakePage>) -> Scenario {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("scan.pdf");
    std::fs::write(&input, b"%PDF-1.4 scripted input bytes").unwrap();
    let output = dir.path().join("scan_ocr.pdf");
    let checkpoint_dir = dir.path().join("checkpoints");
    let backend = Arc::new(FakeBackend::new(pages));
    Scenario {
        _dir: dir,
        input,
        output,
        checkpoint_dir,
        backend,
    }
}

fn config_with(engine: Arc<ScriptedEngine>, checkpoint_dir: &Path) -> ConversionConfig {
    ConversionConfig::builder()
        .engine(engine)
        .checkpoint_dir(checkpoint_dir)
        .retry_backoff_ms(1)
        .page_retry_limit(2)
        .task_retry_limit(0)
        .build()
        .unwrap()
}

fn output_indices(entries: &[OutEntry]) -> Vec<u32> {
    entries.iter().map(|e| e.index()).collect()
}

#[tokio::test]
async fn mixed_page_kinds_produce_complete_ordered_output() {
    let s = scenario(vec![
        FakePage::normal(),  // 0: recognized
        FakePage::blank(),   // 1: blank skip
        FakePage::textual(), // 2: existing-text skip
        FakePage::normal(),  // 3: recognized
        FakePage::broken(),  // 4: render error → fallback copy
        FakePage::normal(),  // 5: recognized
    ]);
    let engine = Arc::new(ScriptedEngine::new());
    let config = config_with(Arc::clone(&engine), &s.checkpoint_dir);

    let outcome = convert_with_backend(
        Arc::clone(&s.backend),
        &s.input,
        &s.output,
        &config,
        CancelFlag::new(),
    )
    .await
    .unwrap();

    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert_eq!(outcome.total_pages, 6);
    assert_eq!(outcome.processed_pages, 3);
    assert_eq!(outcome.skipped_pages, 2);
    assert_eq!(outcome.fallback_pages, vec![5]); // 1-indexed page 5 = index 4
    assert_eq!(outcome.queue_stall_events, 0);

    let entries = s.backend.saved_at(&s.output).expect("final output saved");
    assert_eq!(output_indices(&entries), vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(entries[1], OutEntry::Copied(1));
    assert_eq!(entries[2], OutEntry::Copied(2));
    assert_eq!(entries[4], OutEntry::Copied(4));
    // Recognized pages carry a text layer.
    assert!(matches!(entries[0], OutEntry::Recognized { spans: 1, .. }));

    // Only normal pages ever reached the engine.
    assert_eq!(engine.calls(), vec![0, 3, 5]);

    // Successful runs leave no checkpoint behind.
    let store = CheckpointStore::open(&s.checkpoint_dir).unwrap();
    assert!(store.load(&s.input).is_none());
}

#[tokio::test]
async fn all_blank_document_succeeds_with_full_page_count() {
    let s = scenario(vec![FakePage::blank(), FakePage::blank(), FakePage::blank()]);
    let engine = Arc::new(ScriptedEngine::new());
    let config = config_with(Arc::clone(&engine), &s.checkpoint_dir);

    let outcome = convert_with_backend(
        Arc::clone(&s.backend),
        &s.input,
        &s.output,
        &config,
        CancelFlag::new(),
    )
    .await
    .unwrap();

    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert_eq!(outcome.processed_pages, 0);
    assert_eq!(outcome.skipped_pages, 3);
    assert!(engine.calls().is_empty());

    let entries = s.backend.saved_at(&s.output).unwrap();
    assert_eq!(output_indices(&entries), vec![0, 1, 2]);
}

#[tokio::test]
async fn resume_processes_only_uncovered_pages() {
    let s = scenario((0..10).map(|_| FakePage::normal()).collect());
    let engine = Arc::new(ScriptedEngine::new());
    let config = config_with(Arc::clone(&engine), &s.checkpoint_dir);

    // A prior run completed pages 3 and 7 before stopping.
    let store = CheckpointStore::open(&s.checkpoint_dir).unwrap();
    let mut cp = store
        .create(&s.input, &s.output, 10, config.dpi, &config.languages)
        .unwrap();
    store.mark(&mut cp, 3, PageOutcome::Completed).unwrap();
    store.mark(&mut cp, 7, PageOutcome::Completed).unwrap();
    s.backend.seed_saved(
        &cp.temp_output_path,
        vec![OutEntry::Copied(3), OutEntry::Copied(7)],
    );

    let outcome = convert_with_backend(
        Arc::clone(&s.backend),
        &s.input,
        &s.output,
        &config,
        CancelFlag::new(),
    )
    .await
    .unwrap();

    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert!(outcome.resumed_from_checkpoint);
    assert_eq!(outcome.resumed_from_page, 0);

    // Exactly the uncovered pages were recognized, in index order; pages 3
    // and 7 were never touched again.
    assert_eq!(engine.calls(), vec![0, 1, 2, 4, 5, 6, 8, 9]);

    let entries = s.backend.saved_at(&s.output).unwrap();
    assert_eq!(output_indices(&entries), (0..10).collect::<Vec<_>>());
    assert_eq!(entries[3], OutEntry::Copied(3));
    assert_eq!(entries[7], OutEntry::Copied(7));
}

#[tokio::test]
async fn transient_failures_retry_then_succeed_without_fallback() {
    let s = scenario(vec![FakePage::normal()]);
    let engine = Arc::new(ScriptedEngine::new().fail_times(0, 2));
    let config = config_with(Arc::clone(&engine), &s.checkpoint_dir);

    let outcome = convert_with_backend(
        Arc::clone(&s.backend),
        &s.input,
        &s.output,
        &config,
        CancelFlag::new(),
    )
    .await
    .unwrap();

    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert!(outcome.fallback_pages.is_empty());
    assert_eq!(outcome.page_retry_counts.get(&1), Some(&2));
    assert_eq!(engine.calls().len(), 3);

    let entries = s.backend.saved_at(&s.output).unwrap();
    assert!(matches!(entries[0], OutEntry::Recognized { spans: 1, .. }));
}

#[tokio::test]
async fn retry_exhaustion_falls_back_to_image_only_copy() {
    let s = scenario(vec![FakePage::normal(), FakePage::normal()]);
    let engine = Arc::new(ScriptedEngine::new().always_fail(1));
    let config = config_with(Arc::clone(&engine), &s.checkpoint_dir);

    let outcome = convert_with_backend(
        Arc::clone(&s.backend),
        &s.input,
        &s.output,
        &config,
        CancelFlag::new(),
    )
    .await
    .unwrap();

    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert_eq!(outcome.fallback_pages, vec![2]);
    // page_retry_limit 2 → three attempts, every failure recorded.
    assert_eq!(outcome.page_retry_counts.get(&2), Some(&3));

    let entries = s.backend.saved_at(&s.output).unwrap();
    assert_eq!(output_indices(&entries), vec![0, 1]);
    // The recovered page has no text layer.
    assert_eq!(entries[1], OutEntry::Copied(1));
    assert!(matches!(entries[0], OutEntry::Recognized { .. }));
}

#[tokio::test]
async fn disabled_fallback_fails_the_run_and_keeps_the_checkpoint() {
    let s = scenario(vec![FakePage::normal(), FakePage::normal()]);
    let engine = Arc::new(ScriptedEngine::new().always_fail(1));
    let config = ConversionConfig::builder()
        .engine(Arc::clone(&engine) as Arc<dyn textlayer::OcrEngine>)
        .checkpoint_dir(&s.checkpoint_dir)
        .retry_backoff_ms(1)
        .page_retry_limit(1)
        .task_retry_limit(0)
        .allow_fallback_copy(false)
        .build()
        .unwrap();

    let err = convert_with_backend(
        Arc::clone(&s.backend),
        &s.input,
        &s.output,
        &config,
        CancelFlag::new(),
    )
    .await
    .unwrap_err();

    assert!(err.to_string().contains("fallback copy is disabled"));

    // Progress survives for a later resume: page 0 is already completed.
    let store = CheckpointStore::open(&s.checkpoint_dir).unwrap();
    let cp = store.load(&s.input).expect("checkpoint preserved");
    assert!(cp.completed_pages.contains(&0));
    // The final output was never written.
    assert!(s.backend.saved_at(&s.output).is_none());
}

/// Progress observer that requests cancellation after N page transitions.
struct CancelAfter {
    cancel: CancelFlag,
    after: u32,
    seen: AtomicU32,
}

impl ConversionProgress for CancelAfter {
    fn on_page(&self, _current: u32, _total: u32) {
        if self.seen.fetch_add(1, Ordering::SeqCst) + 1 >= self.after {
            self.cancel.cancel();
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_saves_progress_and_resumes_cleanly() {
    let s = scenario((0..5).map(|_| FakePage::normal()).collect());
    let cancel = CancelFlag::new();

    let engine = Arc::new(ScriptedEngine::new());
    let mut config = config_with(Arc::clone(&engine), &s.checkpoint_dir);
    config.progress_callback = Some(Arc::new(CancelAfter {
        cancel: cancel.clone(),
        after: 2,
        seen: AtomicU32::new(0),
    }));

    let outcome = convert_with_backend(
        Arc::clone(&s.backend),
        &s.input,
        &s.output,
        &config,
        cancel,
    )
    .await
    .unwrap();

    // Cancellation is a distinct terminal state, not a failure.
    assert_eq!(outcome.status, RunStatus::Cancelled);
    assert!(s.backend.saved_at(&s.output).is_none());

    let store = CheckpointStore::open(&s.checkpoint_dir).unwrap();
    let cp = store.load(&s.input).expect("checkpoint preserved");
    let covered = cp.completed_pages.len();
    assert!(covered >= 2, "at least the two observed pages are covered");

    // Second run (no cancellation) finishes the document without redoing
    // the covered pages.
    let engine2 = Arc::new(ScriptedEngine::new());
    let config2 = config_with(Arc::clone(&engine2), &s.checkpoint_dir);
    let outcome2 = convert_with_backend(
        Arc::clone(&s.backend),
        &s.input,
        &s.output,
        &config2,
        CancelFlag::new(),
    )
    .await
    .unwrap();

    assert_eq!(outcome2.status, RunStatus::Succeeded);
    assert!(outcome2.resumed_from_checkpoint);
    for page in engine2.calls() {
        assert!(
            !cp.completed_pages.contains(&page),
            "page {page} was reprocessed after resume"
        );
    }

    let entries = s.backend.saved_at(&s.output).unwrap();
    assert_eq!(output_indices(&entries), vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn checkpoint_disabled_still_produces_complete_output() {
    let s = scenario(vec![FakePage::normal(), FakePage::blank()]);
    let engine = Arc::new(ScriptedEngine::new());
    let config = ConversionConfig::builder()
        .engine(Arc::clone(&engine) as Arc<dyn textlayer::OcrEngine>)
        .enable_checkpoint(false)
        .retry_backoff_ms(1)
        .task_retry_limit(0)
        .build()
        .unwrap();

    let outcome = convert_with_backend(
        Arc::clone(&s.backend),
        &s.input,
        &s.output,
        &config,
        CancelFlag::new(),
    )
    .await
    .unwrap();

    assert_eq!(outcome.status, RunStatus::Succeeded);
    let entries = s.backend.saved_at(&s.output).unwrap();
    assert_eq!(output_indices(&entries), vec![0, 1]);
    assert!(!s.checkpoint_dir.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn pooled_run_interleaves_skips_and_batches_in_index_order() {
    let s = scenario(vec![
        FakePage::normal(),  // 0
        FakePage::blank(),   // 1 — emitted eagerly, ahead of batch results
        FakePage::normal(),  // 2
        FakePage::textual(), // 3
        FakePage::normal(),  // 4
        FakePage::blank(),   // 5
        FakePage::normal(),  // 6
    ]);

    // Real worker processes: this binary in worker mode. Recognition may
    // succeed (tesseract installed) or fail per task (not installed); the
    // ordering and integrity guarantees must hold either way.
    let config = ConversionConfig::builder()
        .workers(2)
        .worker_command([env!("CARGO_BIN_EXE_textlayer"), "--ocr-worker"])
        .checkpoint_dir(&s.checkpoint_dir)
        .page_retry_limit(0)
        .retry_backoff_ms(1)
        .task_retry_limit(0)
        .build()
        .unwrap();

    let outcome = convert_with_backend(
        Arc::clone(&s.backend),
        &s.input,
        &s.output,
        &config,
        CancelFlag::new(),
    )
    .await
    .unwrap();

    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert_eq!(outcome.total_pages, 7);
    assert_eq!(outcome.skipped_pages, 3);

    let entries = s.backend.saved_at(&s.output).unwrap();
    // Every source page appears exactly once, in ascending order, no
    // matter how batch completion interleaved with eager skip copies.
    assert_eq!(output_indices(&entries), (0..7).collect::<Vec<_>>());
    assert_eq!(entries[1], OutEntry::Copied(1));
    assert_eq!(entries[3], OutEntry::Copied(3));
    assert_eq!(entries[5], OutEntry::Copied(5));
}
