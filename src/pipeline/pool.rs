//! Worker pool: persistent OCR worker processes.
//!
//! Each worker is a child process (by default this crate's own binary in
//! its hidden worker mode) that loads one OCR engine at startup, announces
//! readiness, and then serves newline-delimited JSON requests over
//! stdin/stdout until EOF. Keeping the processes alive across the whole
//! document amortises the engine's expensive initialisation over many
//! pages.
//!
//! Shutdown is two-phased: close every stdin and wait for clean exits up to
//! a hard timeout, then SIGKILL whatever is left. The kill path exists
//! because OCR runtimes can hang during teardown, and an unbounded wait
//! would freeze the host application. PIDs are snapshotted *before*
//! shutdown begins — the bookkeeping they come from may be cleared while
//! shutdown is in flight. `kill_on_drop` backstops abnormal exits so no
//! worker ever outlives the application.

use crate::engine::{OcrEngine, TextRegion};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::timeout;
use tracing::{debug, warn};

/// How long a worker may take to load its engine and report ready.
const WORKER_READY_TIMEOUT: Duration = Duration::from_secs(120);

/// Reaping window after a force-kill.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Estimated resident memory of one warmed worker.
const PER_WORKER_MEMORY_BYTES: u64 = 1024 * 1024 * 1024;

/// Memory already held by each sibling worker from a prior session.
const SIBLING_WORKER_MEMORY_BYTES: u64 = 3 * 1024 * 1024 * 1024 / 2;

// ── Wire protocol ────────────────────────────────────────────────────────

/// First line a worker writes once its engine is loaded.
#[derive(Debug, Serialize, Deserialize)]
pub struct WorkerHello {
    pub status: String,
}

/// One recognition request: a JPEG-compressed page image.
#[derive(Debug, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub id: u64,
    pub page: u32,
    pub image_b64: String,
}

/// One recognition reply. `regions` and `error` are mutually exclusive.
#[derive(Debug, Serialize, Deserialize)]
pub struct WorkerReply {
    pub id: u64,
    pub page: u32,
    #[serde(default)]
    pub regions: Option<Vec<TextRegion>>,
    #[serde(default)]
    pub error: Option<String>,
}

/// One unit of pool work: a page index plus its JPEG-compressed raster.
#[derive(Debug, Clone)]
pub struct OcrTask {
    pub page: u32,
    pub jpeg: Vec<u8>,
}

// ── Pool ─────────────────────────────────────────────────────────────────

struct PoolWorker {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    pid: Option<u32>,
}

impl PoolWorker {
    /// Run one chunk of tasks sequentially on this worker.
    async fn run_chunk(
        &mut self,
        chunk: Vec<(u64, OcrTask)>,
        task_timeout: Duration,
    ) -> Vec<(u32, Result<Vec<TextRegion>, String>)> {
        let mut results = Vec::with_capacity(chunk.len());

        for (id, task) in chunk {
            let page = task.page;
            let outcome = match timeout(task_timeout, self.run_task(id, &task)).await {
                Ok(result) => result,
                Err(_) => Err(format!(
                    "recognition timed out after {}s",
                    task_timeout.as_secs()
                )),
            };
            results.push((page, outcome));
        }

        results
    }

    async fn run_task(&mut self, id: u64, task: &OcrTask) -> Result<Vec<TextRegion>, String> {
        let request = WorkerRequest {
            id,
            page: task.page,
            image_b64: BASE64.encode(&task.jpeg),
        };
        let mut line =
            serde_json::to_string(&request).map_err(|e| format!("encode request: {e}"))?;
        line.push('\n');

        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| format!("worker stdin closed: {e}"))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| format!("worker stdin flush: {e}"))?;

        loop {
            let reply_line = self
                .stdout
                .next_line()
                .await
                .map_err(|e| format!("worker stdout error: {e}"))?
                .ok_or_else(|| "worker exited mid-task".to_string())?;

            let reply: WorkerReply = serde_json::from_str(&reply_line)
                .map_err(|e| format!("malformed worker reply: {e}"))?;

            // Replies arrive in request order per worker; a mismatched id
            // means an earlier timed-out task's answer finally showed up.
            // Drain it and keep reading.
            if reply.id != id {
                debug!(expected = id, got = reply.id, "discarding stale worker reply");
                continue;
            }

            return match reply.error {
                Some(error) => Err(error),
                None => Ok(reply.regions.unwrap_or_default()),
            };
        }
    }
}

/// Fixed-size pool of persistent OCR worker processes.
pub struct WorkerPool {
    command: Vec<String>,
    size: usize,
    shutdown_timeout: Duration,
    task_timeout: Duration,
    workers: Vec<PoolWorker>,
    next_id: u64,
    started: bool,
}

impl WorkerPool {
    /// Create a pool of `size` workers launched with `command`.
    ///
    /// `command[0]` is the program, the rest its arguments. Workers are not
    /// spawned until [`WorkerPool::start`].
    pub fn new(
        command: Vec<String>,
        size: usize,
        shutdown_timeout: Duration,
        task_timeout: Duration,
    ) -> Self {
        Self {
            command,
            size: size.max(1),
            shutdown_timeout,
            task_timeout,
            workers: Vec::new(),
            next_id: 0,
            started: false,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Batch size that balances pipeline latency against per-submission
    /// overhead: two tasks in flight per worker.
    pub fn batch_capacity(&self) -> usize {
        self.size * 2
    }

    /// Spawn all workers and wait for each to report ready. Idempotent.
    pub async fn start(&mut self) -> Result<(), String> {
        if self.started {
            return Ok(());
        }
        if self.command.is_empty() {
            return Err("empty worker command".to_string());
        }

        for slot in 0..self.size {
            let mut cmd = Command::new(&self.command[0]);
            cmd.args(&self.command[1..])
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit())
                .kill_on_drop(true);

            let mut child = cmd
                .spawn()
                .map_err(|e| format!("spawn worker {slot}: {e}"))?;
            let pid = child.id();
            let stdin = child.stdin.take().ok_or("worker stdin unavailable")?;
            let stdout = child.stdout.take().ok_or("worker stdout unavailable")?;
            let mut stdout = BufReader::new(stdout).lines();

            // Engine load happens before the hello line; a worker that
            // cannot come up poisons the whole pool start.
            let hello = timeout(WORKER_READY_TIMEOUT, stdout.next_line())
                .await
                .map_err(|_| format!("worker {slot} did not become ready"))?
                .map_err(|e| format!("worker {slot} handshake read: {e}"))?
                .ok_or_else(|| format!("worker {slot} exited before ready"))?;
            let hello: WorkerHello = serde_json::from_str(&hello)
                .map_err(|e| format!("worker {slot} bad handshake: {e}"))?;
            if hello.status != "ready" {
                return Err(format!("worker {slot} reported '{}'", hello.status));
            }

            debug!(slot, ?pid, "worker ready");
            self.workers.push(PoolWorker {
                child,
                stdin,
                stdout,
                pid,
            });
        }

        self.started = true;
        Ok(())
    }

    /// Submit a batch and wait for every task to resolve.
    ///
    /// Tasks are distributed round-robin; each worker runs its share
    /// sequentially while workers run in parallel. A per-task failure is
    /// returned as an `Err` entry with a human-readable cause — it never
    /// fails the batch.
    pub async fn submit_batch(
        &mut self,
        tasks: Vec<OcrTask>,
    ) -> Result<BTreeMap<u32, Result<Vec<TextRegion>, String>>, String> {
        if !self.started {
            self.start().await?;
        }
        if tasks.is_empty() {
            return Ok(BTreeMap::new());
        }

        let worker_count = self.workers.len();
        let mut chunks: Vec<Vec<(u64, OcrTask)>> = vec![Vec::new(); worker_count];
        for (i, task) in tasks.into_iter().enumerate() {
            let id = self.next_id;
            self.next_id += 1;
            chunks[i % worker_count].push((id, task));
        }

        let task_timeout = self.task_timeout;
        let futures = self
            .workers
            .iter_mut()
            .zip(chunks)
            .map(|(worker, chunk)| worker.run_chunk(chunk, task_timeout));

        let mut results = BTreeMap::new();
        for chunk_result in futures::future::join_all(futures).await {
            for (page, outcome) in chunk_result {
                results.insert(page, outcome);
            }
        }
        Ok(results)
    }

    /// PIDs of currently tracked workers.
    pub fn worker_pids(&self) -> Vec<u32> {
        self.workers.iter().filter_map(|w| w.pid).collect()
    }

    /// Graceful shutdown with a hard timeout, then force-kill.
    pub async fn stop(&mut self) {
        if self.workers.is_empty() {
            self.started = false;
            return;
        }
        self.started = false;

        // Snapshot before the worker list is consumed below.
        let pids = self.worker_pids();

        let mut children: Vec<Child> = self
            .workers
            .drain(..)
            .map(|worker| {
                let PoolWorker {
                    child,
                    stdin,
                    stdout,
                    ..
                } = worker;
                // EOF on stdin is the shutdown signal.
                drop(stdin);
                drop(stdout);
                child
            })
            .collect();

        let graceful = futures::future::join_all(children.iter_mut().map(|c| c.wait()));
        match timeout(self.shutdown_timeout, graceful).await {
            Ok(_) => debug!("worker pool shut down cleanly"),
            Err(_) => {
                warn!(
                    "pool shutdown hung after {}s — force-killing workers: {:?}",
                    self.shutdown_timeout.as_secs(),
                    pids
                );
                for child in children.iter_mut() {
                    let _ = child.start_kill();
                }
                let reap = futures::future::join_all(children.iter_mut().map(|c| c.wait()));
                let _ = timeout(KILL_REAP_TIMEOUT, reap).await;
            }
        }
    }
}

// ── Worker side ──────────────────────────────────────────────────────────

/// Serve recognition requests over stdin/stdout until EOF.
///
/// This is the body of the hidden worker mode in the CLI binary. The
/// engine is constructed by the caller exactly once per process — the
/// whole point of a persistent pool. A JPEG decode failure is reported as
/// a task error, not a crash.
pub async fn serve_worker(engine: Arc<dyn OcrEngine>) -> std::io::Result<()> {
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    let mut stdout = tokio::io::stdout();

    let hello = serde_json::to_string(&WorkerHello {
        status: "ready".to_string(),
    })?;
    stdout.write_all(hello.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request: WorkerRequest = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                warn!("worker received malformed request: {e}");
                continue;
            }
        };

        let reply = match decode_transfer_image(&request.image_b64) {
            Ok(image) => match engine.recognize(request.page, &image).await {
                Ok(regions) => WorkerReply {
                    id: request.id,
                    page: request.page,
                    regions: Some(regions),
                    error: None,
                },
                Err(e) => WorkerReply {
                    id: request.id,
                    page: request.page,
                    regions: None,
                    error: Some(e.to_string()),
                },
            },
            Err(e) => WorkerReply {
                id: request.id,
                page: request.page,
                regions: None,
                error: Some(e),
            },
        };

        let mut line = serde_json::to_string(&reply)?;
        line.push('\n');
        stdout.write_all(line.as_bytes()).await?;
        stdout.flush().await?;
    }

    Ok(())
}

/// JPEG-compress a rendered page for inter-process transfer.
///
/// Roughly 10× smaller than the raw raster, which is what keeps pool
/// submission cheap relative to recognition itself.
pub fn compress_for_transfer(
    image: &image::DynamicImage,
    quality: u8,
) -> Result<Vec<u8>, String> {
    let mut buf = Vec::new();
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(
        std::io::Cursor::new(&mut buf),
        quality,
    );
    image
        .to_rgb8()
        .write_with_encoder(encoder)
        .map_err(|e| format!("jpeg encode: {e}"))?;
    Ok(buf)
}

fn decode_transfer_image(image_b64: &str) -> Result<image::DynamicImage, String> {
    let bytes = BASE64
        .decode(image_b64)
        .map_err(|e| format!("base64 decode: {e}"))?;
    image::load_from_memory_with_format(&bytes, image::ImageFormat::Jpeg)
        .map_err(|e| format!("jpeg decode: {e}"))
}

// ── Sizing ───────────────────────────────────────────────────────────────

/// What the sizing heuristic needs to know about the machine.
#[derive(Debug, Clone)]
pub struct SystemSnapshot {
    pub physical_cores: usize,
    pub available_memory_bytes: Option<u64>,
    /// OCR workers already running from a prior session.
    pub sibling_workers: u32,
    /// Recognition runs on a GPU — concurrent workers would contend for
    /// one device.
    pub gpu_backed: bool,
}

impl SystemSnapshot {
    pub fn detect() -> Self {
        Self {
            physical_cores: num_cpus::get_physical(),
            available_memory_bytes: available_memory_bytes(),
            sibling_workers: 0,
            gpu_backed: false,
        }
    }
}

/// Recommended worker-process count. A recommendation only — callers may
/// configure any value.
///
/// Reserves one core for the orchestrator/UI, budgets ~1 GiB per new
/// worker after discounting siblings, and hard-caps at 2: marginal
/// throughput beyond that loses to memory pressure on the machines this
/// tool actually runs on.
pub fn recommended_workers(snapshot: &SystemSnapshot) -> usize {
    if snapshot.gpu_backed {
        return 1;
    }

    let cpu_based = snapshot.physical_cores.saturating_sub(1).max(1);

    let memory_based = match snapshot.available_memory_bytes {
        Some(available) => {
            let adjusted = available
                .saturating_sub(snapshot.sibling_workers as u64 * SIBLING_WORKER_MEMORY_BYTES);
            (adjusted / PER_WORKER_MEMORY_BYTES) as usize
        }
        None => cpu_based,
    };

    cpu_based.min(memory_based).min(2).max(1)
}

/// Available system memory, when the platform exposes it cheaply.
#[cfg(target_os = "linux")]
pub(crate) fn available_memory_bytes() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemAvailable:") {
            let kb: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn available_memory_bytes() -> Option<u64> {
    None
}
