//! Pipeline coordinator: the per-document state machine.
//!
//! Owns everything the render stage must never touch: the checkpoint, the
//! output document, the recognition dispatch, ordering, and integrity
//! policy. Each page makes exactly one terminal transition
//! (`pending → completed | skipped | failed`) and never regresses; the
//! checkpoint is re-persisted after every transition, so a crash at any
//! point resumes without redoing finished pages.
//!
//! ## Ordering
//!
//! In pooled mode, skip-classified pages are emitted eagerly while OCR
//! pages wait for their batch, so insertion order can diverge from index
//! order. The coordinator tracks the actual insertion order and reorders
//! the document to ascending index order before any save that could later
//! be resumed or shipped — periodic temp saves included, which keeps the
//! ordering assumption sound for a resumed temp file.

use crate::checkpoint::{temp_output_path_for, Checkpoint, CheckpointStore, PageOutcome};
use crate::config::ConversionConfig;
use crate::document::{DocumentBackend, OutputDocument, SourceDocument};
use crate::engine::TextRegion;
use crate::error::{ConvertError, PageFailure};
use crate::outcome::{ProcessOutcome, RunStatus};
use crate::pipeline::dispatch::Dispatch;
use crate::pipeline::pool::{self, OcrTask};
use crate::pipeline::render::{self, PageKind, RenderStage, RenderedPage};
use crate::pipeline::{layout, CancelFlag};
use image::DynamicImage;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

/// Wait for the render stage to wind down after the consumer stops.
const RENDER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Converts one document through the render → recognize → assemble loop.
pub struct Pipeline<B: DocumentBackend> {
    backend: Arc<B>,
    config: ConversionConfig,
}

impl<B: DocumentBackend> Pipeline<B> {
    pub fn new(backend: Arc<B>, config: ConversionConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &ConversionConfig {
        &self.config
    }

    /// Run the full pipeline for one file.
    ///
    /// Returns `Ok` with a [`RunStatus::Succeeded`] or
    /// [`RunStatus::Cancelled`] outcome; fatal problems return `Err` after
    /// persisting whatever progress exists so a later attempt can resume.
    pub async fn process_file(
        &self,
        input: &Path,
        output_path: &Path,
        cancel: CancelFlag,
    ) -> Result<ProcessOutcome, ConvertError> {
        let started = Instant::now();
        let mut outcome = ProcessOutcome::started(input, output_path);

        let source = self.backend.open(input, self.config.password.as_deref())?;
        let total = source.page_count();
        if total == 0 {
            return Err(ConvertError::EmptyDocument {
                path: input.to_path_buf(),
            });
        }
        outcome.total_pages = total;

        // ── Checkpoint: load-or-create ───────────────────────────────────
        let store = if self.config.enable_checkpoint {
            let dir = self
                .config
                .checkpoint_dir
                .clone()
                .unwrap_or_else(CheckpointStore::default_dir);
            Some(CheckpointStore::open(dir)?)
        } else {
            None
        };

        let mut checkpoint: Option<Checkpoint> = None;
        let mut resumed = false;
        if let Some(store) = &store {
            if let Some(loaded) = store.load(input) {
                if loaded.params_mismatch(total, self.config.dpi, &self.config.languages) {
                    debug!("checkpoint parameters differ from current run, discarding");
                    store.delete(input);
                } else {
                    checkpoint = Some(loaded);
                    resumed = true;
                }
            }
        }

        // ── Output document: reopened temp on resume, else fresh ─────────
        let mut output_doc: Option<B::Output> = None;
        if resumed {
            let cp = checkpoint.as_ref().expect("resumed implies checkpoint");
            let covered = (cp.completed_pages.len()
                + cp.skipped_pages.len()
                + cp.failed_pages.len()) as u32;
            match self.backend.open_output(&cp.temp_output_path) {
                Ok(doc) if doc.page_count() == covered => output_doc = Some(doc),
                Ok(doc) => warn!(
                    "temp output has {} pages but checkpoint covers {} — restarting fresh",
                    doc.page_count(),
                    covered
                ),
                Err(e) => warn!("temp output unreadable ({e}), restarting fresh"),
            }
            if output_doc.is_none() {
                if let Some(store) = &store {
                    store.delete(input);
                }
                checkpoint = None;
                resumed = false;
            }
        }
        if checkpoint.is_none() {
            if let Some(store) = &store {
                checkpoint = Some(store.create(
                    input,
                    output_path,
                    total,
                    self.config.dpi,
                    &self.config.languages,
                )?);
            }
        }
        let output_doc = match output_doc {
            Some(doc) => doc,
            None => self.backend.create_output()?,
        };

        let temp_path = checkpoint
            .as_ref()
            .map(|cp| cp.temp_output_path.clone())
            .unwrap_or_else(|| temp_output_path_for(output_path));

        // ── Resume bookkeeping ───────────────────────────────────────────
        let mut already_done = BTreeSet::new();
        let mut start_page = 0;
        if let Some(cp) = &checkpoint {
            already_done.extend(cp.completed_pages.iter().copied());
            already_done.extend(cp.skipped_pages.iter().copied());
            already_done.extend(cp.failed_pages.iter().copied());
            if resumed {
                start_page = cp.next_page().unwrap_or(total);
                outcome.resumed_from_checkpoint = true;
                outcome.resumed_from_page = start_page;
                outcome.processed_pages = cp.completed_pages.len() as u32;
                outcome.skipped_pages = cp.skipped_pages.len() as u32;
                info!(
                    "resuming from checkpoint: {}/{} pages already done",
                    already_done.len(),
                    total
                );
            }
        }

        if let Some(cb) = &self.config.progress_callback {
            cb.on_start(total, start_page);
        }

        // ── Spawn stages ─────────────────────────────────────────────────
        // Dispatch first: pool workers warm their engines before the first
        // page renders, and a pool that cannot start aborts the run before
        // any background work exists.
        let mut dispatch = Dispatch::from_config(&self.config)?;
        dispatch.start().await?;

        let stage = render::spawn(
            Arc::clone(&self.backend),
            input.to_path_buf(),
            &self.config,
            already_done.clone(),
            start_page,
            cancel.clone(),
        );

        let mut assembly = Assembly {
            config: self.config.clone(),
            source,
            output: output_doc,
            store,
            checkpoint,
            dispatch,
            cancel: cancel.clone(),
            outcome,
            temp_path,
            total,
            insertion_order: already_done.into_iter().collect(),
            pages_since_save: 0,
            pending_skips: Vec::new(),
            batch: BTreeMap::new(),
        };

        let run_result = assembly.run(stage).await;

        // Pool workers never outlive the run, success or not.
        assembly.dispatch.shutdown().await;

        assembly.finish(run_result, output_path, started)
    }
}

/// Mutable state of the assembly (recognition + output) stage.
struct Assembly<B: DocumentBackend> {
    config: ConversionConfig,
    source: B::Source,
    output: B::Output,
    store: Option<CheckpointStore>,
    checkpoint: Option<Checkpoint>,
    dispatch: Dispatch,
    cancel: CancelFlag,
    outcome: ProcessOutcome,
    temp_path: PathBuf,
    total: u32,
    /// Source index of every page currently in the output, in insertion
    /// order. Seeded with the (sorted) resumed pages.
    insertion_order: Vec<u32>,
    pages_since_save: u32,
    /// Skip-classified pages waiting to be copied before the next batch.
    pending_skips: Vec<u32>,
    /// OCR-classified pages accumulating toward a batch submission.
    batch: BTreeMap<u32, RenderedPage>,
}

impl<B: DocumentBackend> Assembly<B> {
    /// Consume the render queue until end-of-pages or cancellation.
    async fn run(&mut self, mut stage: RenderStage) -> Result<(), ConvertError> {
        let capacity = self.dispatch.batch_capacity();

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match stage.rx.recv().await {
                None => {
                    // End of pages: drain whatever is still buffered.
                    if !self.cancel.is_cancelled() {
                        self.flush().await?;
                    }
                    break;
                }
                Some(page) => match &page.kind {
                    PageKind::RenderError(reason) => {
                        let reason = format!("render failed: {reason}");
                        self.fallback_copy(page.index, &reason)?;
                    }
                    PageKind::TextSkip | PageKind::BlankSkip => {
                        self.pending_skips.push(page.index);
                    }
                    PageKind::Normal => {
                        self.batch.insert(page.index, page);
                        if self.batch.len() >= capacity {
                            self.flush().await?;
                        }
                    }
                },
            }
        }

        // Unblock the producer and wait for it to wind down.
        stage.rx.close();
        while stage.rx.recv().await.is_some() {}
        match timeout(RENDER_JOIN_TIMEOUT, &mut stage.join).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(msg))) => self.outcome.errors.push(format!("render error: {msg}")),
            Ok(Err(join_err)) => self
                .outcome
                .errors
                .push(format!("render stage panicked: {join_err}")),
            Err(_) => warn!("render stage did not stop within {:?}", RENDER_JOIN_TIMEOUT),
        }

        let stalls = stage.stall_events();
        self.outcome.queue_stall_events = stalls;
        if stalls > 0 {
            self.outcome
                .errors
                .push(format!("render queue stalled {stalls} time(s)"));
        }
        Ok(())
    }

    /// Emit buffered skips (in order) and then the accumulated batch.
    async fn flush(&mut self) -> Result<(), ConvertError> {
        let skips = std::mem::take(&mut self.pending_skips);
        for index in skips {
            self.copy_skip(index)?;
        }

        if self.batch.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.batch);
        if self.dispatch.is_pooled() {
            self.process_batch_pooled(batch).await
        } else {
            self.process_batch_sequential(batch).await
        }
    }

    async fn process_batch_sequential(
        &mut self,
        batch: BTreeMap<u32, RenderedPage>,
    ) -> Result<(), ConvertError> {
        for (index, page) in batch {
            if self.cancel.is_cancelled() {
                break;
            }
            let Some(image) = page.image.as_ref() else {
                self.fallback_copy(index, "rendered image unavailable")?;
                continue;
            };
            match self.recognize_with_retry(index, image).await {
                Ok(regions) => {
                    self.emit_recognized(&page, &regions)?;
                }
                Err(e) => {
                    self.fallback_copy(index, &e.to_string())?;
                }
            }
        }
        Ok(())
    }

    async fn process_batch_pooled(
        &mut self,
        batch: BTreeMap<u32, RenderedPage>,
    ) -> Result<(), ConvertError> {
        // Compress everything up front; compression failures are
        // deterministic, so those pages go straight to fallback below.
        let mut tasks = Vec::with_capacity(batch.len());
        let mut compress_failures: BTreeMap<u32, String> = BTreeMap::new();
        for (&index, page) in &batch {
            match &page.image {
                Some(image) => {
                    match pool::compress_for_transfer(image, self.config.transfer_jpeg_quality) {
                        Ok(jpeg) => tasks.push(OcrTask { page: index, jpeg }),
                        Err(e) => {
                            compress_failures.insert(index, e);
                        }
                    }
                }
                None => {
                    compress_failures
                        .insert(index, "rendered image unavailable".to_string());
                }
            }
        }

        let mut results = self.dispatch.recognize_batch(tasks).await?;

        // Assemble strictly in ascending index order regardless of the
        // order the batch completed in.
        for (index, page) in batch {
            if self.cancel.is_cancelled() {
                break;
            }

            if let Some(reason) = compress_failures.remove(&index) {
                self.fallback_copy(index, &format!("image transfer failed: {reason}"))?;
                continue;
            }

            let regions = match results.remove(&index) {
                Some(Ok(regions)) => Some(regions),
                other => {
                    let first_error = match other {
                        Some(Err(detail)) => detail,
                        _ => "no result returned for page".to_string(),
                    };
                    warn!("page {}: pool attempt failed: {first_error}", index + 1);
                    let Some(image) = page.image.as_ref() else {
                        self.fallback_copy(index, &first_error)?;
                        continue;
                    };
                    match self.recognize_with_retry(index, image).await {
                        Ok(regions) => Some(regions),
                        Err(e) => {
                            self.fallback_copy(index, &format!("{first_error}; {e}"))?;
                            None
                        }
                    }
                }
            };

            if let Some(regions) = regions {
                self.emit_recognized(&page, &regions)?;
            }
        }
        Ok(())
    }

    /// Bounded recognition retry with exponential backoff.
    async fn recognize_with_retry(
        &mut self,
        index: u32,
        image: &DynamicImage,
    ) -> Result<Vec<TextRegion>, PageFailure> {
        let mut last: Option<PageFailure> = None;

        for attempt in 0..=self.config.page_retry_limit {
            if self.cancel.is_cancelled() {
                break;
            }
            if attempt > 0 {
                let backoff = self.config.retry_backoff_ms * 2u64.pow(attempt - 1);
                warn!(
                    "page {}: retry {}/{} after {}ms",
                    index + 1,
                    attempt,
                    self.config.page_retry_limit,
                    backoff
                );
                sleep(Duration::from_millis(backoff)).await;
            }

            match self
                .dispatch
                .recognize_one(index, image, self.config.transfer_jpeg_quality)
                .await
            {
                Ok(regions) => return Ok(regions),
                Err(e) => {
                    self.outcome.record_retry(index);
                    last = Some(e);
                }
            }
        }

        Err(last.unwrap_or(PageFailure::RecognitionFailed {
            page: index,
            detail: "cancelled before recognition".to_string(),
        }))
    }

    /// Author one recognized output page (image + invisible text layer).
    /// Authoring failures degrade to a fallback copy, never a crash.
    fn emit_recognized(
        &mut self,
        page: &RenderedPage,
        regions: &[TextRegion],
    ) -> Result<(), ConvertError> {
        let Some(image) = &page.image else {
            return self.fallback_copy(page.index, "rendered image unavailable");
        };
        let spans =
            layout::build_text_layer(regions, page.actual_scale, self.config.min_confidence);

        match self.output.append_recognized_page(
            page.geometry,
            image,
            self.config.output_jpeg_quality,
            &spans,
        ) {
            Ok(()) => {
                self.insertion_order.push(page.index);
                self.outcome.processed_pages += 1;
                self.mark(page.index, PageOutcome::Completed)?;
                self.notify(page.index);
                self.bump_save();
                Ok(())
            }
            Err(e) => self.fallback_copy(page.index, &format!("page authoring failed: {e}")),
        }
    }

    /// Copy a blank or already-textual page through verbatim.
    fn copy_skip(&mut self, index: u32) -> Result<(), ConvertError> {
        self.output
            .copy_page_from(&self.source, index)
            .map_err(|e| ConvertError::Internal(format!("skip copy for page {}: {e}", index + 1)))?;
        self.insertion_order.push(index);
        self.outcome.skipped_pages += 1;
        self.mark(index, PageOutcome::Skipped)?;
        self.notify(index);
        self.bump_save();
        Ok(())
    }

    /// Recover a failed page by copying the original image-only page.
    fn fallback_copy(&mut self, index: u32, reason: &str) -> Result<(), ConvertError> {
        if !self.config.allow_fallback_copy {
            return Err(ConvertError::PageUnrecoverable {
                page: index + 1,
                attempts: self.config.page_retry_limit + 1,
                detail: reason.to_string(),
            });
        }

        self.output.copy_page_from(&self.source, index).map_err(|e| {
            ConvertError::Internal(format!("fallback copy for page {}: {e}", index + 1))
        })?;
        self.insertion_order.push(index);
        self.outcome.record_fallback(index, reason);
        self.mark(index, PageOutcome::Failed)?;
        if let Some(cb) = &self.config.progress_callback {
            cb.on_page_fallback(index + 1, self.total, reason);
        }
        self.notify(index);
        self.bump_save();
        Ok(())
    }

    fn mark(&mut self, index: u32, outcome: PageOutcome) -> Result<(), ConvertError> {
        if let (Some(store), Some(cp)) = (&self.store, &mut self.checkpoint) {
            store.mark(cp, index, outcome)?;
        }
        Ok(())
    }

    fn notify(&self, index: u32) {
        if let Some(cb) = &self.config.progress_callback {
            cb.on_page(index + 1, self.total);
        }
    }

    /// Periodic fast-mode save of the temp output. Saving every page would
    /// stall the consumer long enough to starve the render queue; a failed
    /// temp save costs recovery granularity, not correctness.
    fn bump_save(&mut self) {
        self.pages_since_save += 1;
        if self.pages_since_save < self.config.save_interval {
            return;
        }
        self.pages_since_save = 0;
        ensure_order(&mut self.output, &mut self.insertion_order);
        if let Err(e) = self.output.save(&self.temp_path, false) {
            warn!("periodic temp save failed: {e}");
        }
    }

    /// Persist temp output + checkpoint for a later resume (error and
    /// cancellation paths).
    fn persist_progress(&mut self) {
        ensure_order(&mut self.output, &mut self.insertion_order);
        if let Err(e) = self.output.save(&self.temp_path, false) {
            warn!("progress save failed: {e}");
        }
        if let (Some(store), Some(cp)) = (&self.store, &self.checkpoint) {
            if let Err(e) = store.save(cp) {
                warn!("checkpoint save failed: {e}");
            }
        }
    }

    /// Close out the run: integrity check, final save, cleanup.
    fn finish(
        mut self,
        run_result: Result<(), ConvertError>,
        output_path: &Path,
        started: Instant,
    ) -> Result<ProcessOutcome, ConvertError> {
        match run_result {
            Err(e) => {
                self.persist_progress();
                Err(e)
            }
            Ok(()) if self.cancel.is_cancelled() => {
                self.persist_progress();
                self.outcome.status = RunStatus::Cancelled;
                self.outcome
                    .errors
                    .push("processing cancelled, progress saved".to_string());
                self.outcome.elapsed_seconds = started.elapsed().as_secs_f64();
                if let Some(cb) = &self.config.progress_callback {
                    cb.on_finish(
                        self.outcome.total_pages,
                        self.outcome.processed_pages,
                        self.outcome.skipped_pages,
                    );
                }
                Ok(self.outcome)
            }
            Ok(()) => {
                // ── Integrity: every source page appears exactly once ────
                let present: BTreeSet<u32> = self.insertion_order.iter().copied().collect();
                let missing: Vec<u32> =
                    (0..self.total).filter(|i| !present.contains(i)).collect();
                if !missing.is_empty() {
                    warn!(
                        "{} page(s) missing from output, filling with copies",
                        missing.len()
                    );
                }
                for index in missing {
                    if let Err(e) = self.fallback_copy(index, "missing output page") {
                        self.persist_progress();
                        return Err(e);
                    }
                }

                ensure_order(&mut self.output, &mut self.insertion_order);

                if self.output.page_count() != self.total {
                    self.persist_progress();
                    return Err(ConvertError::IntegrityFailure {
                        expected: self.total,
                        actual: self.output.page_count(),
                    });
                }

                // Final artifact gets the compacting save.
                self.output.save(output_path, true)?;

                if let (Some(store), Some(cp)) = (&self.store, &self.checkpoint) {
                    store.cleanup(cp);
                }

                self.outcome.status = RunStatus::Succeeded;
                self.outcome.elapsed_seconds = started.elapsed().as_secs_f64();
                info!(
                    "conversion complete: {} processed, {} skipped, {} fallback of {} pages",
                    self.outcome.processed_pages,
                    self.outcome.skipped_pages,
                    self.outcome.fallback_pages.len(),
                    self.total
                );
                if let Some(cb) = &self.config.progress_callback {
                    cb.on_finish(
                        self.outcome.total_pages,
                        self.outcome.processed_pages,
                        self.outcome.skipped_pages,
                    );
                }
                Ok(self.outcome)
            }
        }
    }
}

/// Permutation that sorts `order` ascending: element `k` of the result is
/// the current position of the page that belongs at position `k`.
fn sort_permutation(order: &[u32]) -> Vec<u32> {
    let mut perm: Vec<u32> = (0..order.len() as u32).collect();
    perm.sort_by_key(|&pos| order[pos as usize]);
    perm
}

/// Reorder the output document to ascending source-index order when the
/// tracked insertion order has diverged from it.
fn ensure_order<O: OutputDocument>(output: &mut O, order: &mut Vec<u32>) {
    if order.windows(2).all(|w| w[0] <= w[1]) {
        return;
    }
    if order.len() != output.page_count() as usize {
        // Counts out of sync means an insertion failed mid-way; the final
        // integrity check reports it — reordering here would scramble.
        warn!(
            "insertion order tracks {} pages but output has {} — skipping reorder",
            order.len(),
            output.page_count()
        );
        return;
    }
    match output.reorder(&sort_permutation(order)) {
        Ok(()) => order.sort_unstable(),
        Err(e) => warn!("page reorder failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_permutation_maps_positions_to_sorted_order() {
        // Pages inserted as [1, 0, 2]: position 1 holds page 0 and must
        // come first, then position 0 (page 1), then position 2.
        assert_eq!(sort_permutation(&[1, 0, 2]), vec![1, 0, 2]);
        assert_eq!(sort_permutation(&[2, 0, 1]), vec![1, 2, 0]);
        assert_eq!(sort_permutation(&[0, 1, 2]), vec![0, 1, 2]);
    }

    #[test]
    fn sort_permutation_handles_empty() {
        assert!(sort_permutation(&[]).is_empty());
    }
}
