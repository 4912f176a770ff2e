//! Recognition dispatch: one coordinator, two execution strategies.
//!
//! Modelled as a small closed variant selected once at pipeline
//! construction — not runtime type inspection. `InProcess` calls the
//! engine directly on the consumer; `Pooled` compresses pages and batches
//! them out to persistent worker processes.

use crate::config::ConversionConfig;
use crate::engine::tesseract::{TesseractConfig, TesseractEngine};
use crate::engine::{OcrEngine, TextRegion};
use crate::error::{ConvertError, PageFailure};
use crate::pipeline::pool::{self, OcrTask, WorkerPool};
use image::DynamicImage;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Recognition execution strategy.
pub enum Dispatch {
    /// Sequential recognition on the pipeline's consumer task.
    InProcess(Arc<dyn OcrEngine>),
    /// Batched recognition across a pool of worker processes.
    Pooled(WorkerPool),
}

impl Dispatch {
    /// Select the strategy from the configured worker count.
    pub fn from_config(config: &ConversionConfig) -> Result<Self, ConvertError> {
        if config.workers <= 1 {
            let engine: Arc<dyn OcrEngine> = match &config.engine {
                Some(engine) => Arc::clone(engine),
                None => Arc::new(TesseractEngine::new(TesseractConfig {
                    languages: config.languages.clone(),
                    quality: config.quality,
                    program: None,
                    timeout_secs: config.recognition_timeout_secs,
                })),
            };
            return Ok(Dispatch::InProcess(engine));
        }

        let command = match &config.worker_command {
            Some(command) => command.clone(),
            None => default_worker_command(config)?,
        };
        Ok(Dispatch::Pooled(WorkerPool::new(
            command,
            config.workers,
            Duration::from_secs(config.pool_shutdown_timeout_secs),
            Duration::from_secs(config.recognition_timeout_secs),
        )))
    }

    /// Tasks the assembly stage accumulates before submitting: 1 for the
    /// sequential strategy, `2 × workers` for the pool.
    pub fn batch_capacity(&self) -> usize {
        match self {
            Dispatch::InProcess(_) => 1,
            Dispatch::Pooled(pool) => pool.batch_capacity(),
        }
    }

    pub fn is_pooled(&self) -> bool {
        matches!(self, Dispatch::Pooled(_))
    }

    /// Recognize a single page. Used by the sequential strategy and by the
    /// per-page retry path in both strategies (a pooled retry is a
    /// single-task batch).
    pub async fn recognize_one(
        &mut self,
        page: u32,
        image: &DynamicImage,
        transfer_quality: u8,
    ) -> Result<Vec<TextRegion>, PageFailure> {
        match self {
            Dispatch::InProcess(engine) => engine.recognize(page, image).await,
            Dispatch::Pooled(pool) => {
                let jpeg = pool::compress_for_transfer(image, transfer_quality).map_err(|e| {
                    PageFailure::RecognitionFailed {
                        page,
                        detail: e,
                    }
                })?;
                let mut results = pool
                    .submit_batch(vec![OcrTask { page, jpeg }])
                    .await
                    .map_err(|e| PageFailure::WorkerFailed { page, detail: e })?;
                match results.remove(&page) {
                    Some(Ok(regions)) => Ok(regions),
                    Some(Err(detail)) => Err(PageFailure::WorkerFailed { page, detail }),
                    None => Err(PageFailure::WorkerFailed {
                        page,
                        detail: "no result returned for page".to_string(),
                    }),
                }
            }
        }
    }

    /// Submit a full batch to the pool, returning partial results.
    ///
    /// Only meaningful for the pooled strategy; the sequential strategy
    /// never accumulates more than one task.
    pub async fn recognize_batch(
        &mut self,
        tasks: Vec<OcrTask>,
    ) -> Result<BTreeMap<u32, Result<Vec<TextRegion>, String>>, ConvertError> {
        match self {
            Dispatch::InProcess(_) => Err(ConvertError::Internal(
                "batch dispatch invoked on in-process strategy".to_string(),
            )),
            Dispatch::Pooled(pool) => pool
                .submit_batch(tasks)
                .await
                .map_err(|detail| ConvertError::WorkerPool { detail }),
        }
    }

    /// Start pool workers eagerly so engine load happens before the first
    /// page, not in the middle of the run. No-op for in-process.
    pub async fn start(&mut self) -> Result<(), ConvertError> {
        match self {
            Dispatch::InProcess(_) => Ok(()),
            Dispatch::Pooled(pool) => pool
                .start()
                .await
                .map_err(|detail| ConvertError::WorkerPool { detail }),
        }
    }

    /// Shut down pool workers (graceful, then forced). No-op for
    /// in-process.
    pub async fn shutdown(&mut self) {
        if let Dispatch::Pooled(pool) = self {
            pool.stop().await;
        }
    }
}

/// Default worker launch: this binary re-executed in its hidden worker
/// mode, carrying the engine settings on the command line.
fn default_worker_command(config: &ConversionConfig) -> Result<Vec<String>, ConvertError> {
    let exe = std::env::current_exe()
        .map_err(|e| ConvertError::WorkerPool {
            detail: format!("cannot locate own executable for worker spawn: {e}"),
        })?
        .to_string_lossy()
        .to_string();
    Ok(vec![
        exe,
        "--ocr-worker".to_string(),
        "--languages".to_string(),
        config.languages.join(","),
        "--quality".to_string(),
        config.quality.to_string(),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NullEngine;

    #[async_trait]
    impl OcrEngine for NullEngine {
        async fn recognize(
            &self,
            _page: u32,
            _image: &DynamicImage,
        ) -> Result<Vec<TextRegion>, PageFailure> {
            Ok(Vec::new())
        }

        fn languages(&self) -> &[String] {
            &[]
        }
    }

    #[test]
    fn single_worker_selects_in_process() {
        let config = ConversionConfig::builder()
            .workers(1)
            .engine(Arc::new(NullEngine))
            .build()
            .unwrap();
        let dispatch = Dispatch::from_config(&config).unwrap();
        assert!(!dispatch.is_pooled());
        assert_eq!(dispatch.batch_capacity(), 1);
    }

    #[test]
    fn multi_worker_selects_pool_with_doubled_batch() {
        let config = ConversionConfig::builder()
            .workers(2)
            .worker_command(["stub-worker"])
            .build()
            .unwrap();
        let dispatch = Dispatch::from_config(&config).unwrap();
        assert!(dispatch.is_pooled());
        assert_eq!(dispatch.batch_capacity(), 4);
    }

    #[tokio::test]
    async fn batch_on_in_process_strategy_is_an_error() {
        let config = ConversionConfig::builder()
            .engine(Arc::new(NullEngine))
            .build()
            .unwrap();
        let mut dispatch = Dispatch::from_config(&config).unwrap();
        assert!(dispatch.recognize_batch(Vec::new()).await.is_err());
    }
}
