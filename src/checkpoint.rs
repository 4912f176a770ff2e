//! Durable per-document progress records enabling resume.
//!
//! One [`Checkpoint`] exists per in-flight conversion, keyed by the input
//! path and a content fingerprint. Every page outcome moves the page index
//! into exactly one of three disjoint sets and re-persists the whole record
//! atomically (write a temp file, rename over the target), so a crash at
//! any instant leaves either the previous or the next consistent state on
//! disk — never a torn file.
//!
//! A checkpoint is only trusted when everything it refers to still holds:
//! the input file's fingerprint matches, the temporary output artifact it
//! points at still exists, and the caller's processing parameters equal the
//! stored ones. Anything else invalidates the record and it is deleted.

use crate::error::ConvertError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// How far into the file the fingerprint reads from each end.
///
/// Hashing a bounded prefix + suffix + the size catches every realistic
/// edit (content changes move bytes, appends change the size) without
/// scanning gigabytes on every resume check.
const FINGERPRINT_WINDOW: u64 = 1024 * 1024;

/// Terminal state of one page, as recorded in the checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOutcome {
    /// Recognition ran and the page carries a text layer.
    Completed,
    /// Copied through without recognition (blank or already textual).
    Skipped,
    /// Retries exhausted; page was recovered by fallback copy.
    Failed,
}

/// Durable progress record for one document conversion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub temp_output_path: PathBuf,
    pub total_pages: u32,
    pub completed_pages: BTreeSet<u32>,
    pub skipped_pages: BTreeSet<u32>,
    pub failed_pages: BTreeSet<u32>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub dpi: u32,
    pub languages: Vec<String>,
    pub input_hash: String,
}

impl Checkpoint {
    /// Smallest page index in `[0, total_pages)` not present in any set,
    /// or `None` when every page is covered.
    pub fn next_page(&self) -> Option<u32> {
        (0..self.total_pages).find(|i| !self.contains(*i))
    }

    /// True when every page index is covered by some set.
    pub fn is_complete(&self) -> bool {
        self.next_page().is_none()
    }

    /// True when `index` is already in any of the three sets.
    pub fn contains(&self, index: u32) -> bool {
        self.completed_pages.contains(&index)
            || self.skipped_pages.contains(&index)
            || self.failed_pages.contains(&index)
    }

    /// Integer percentage of covered pages.
    pub fn progress_percent(&self) -> u32 {
        if self.total_pages == 0 {
            return 0;
        }
        let done =
            self.completed_pages.len() + self.skipped_pages.len() + self.failed_pages.len();
        (done as u32 * 100) / self.total_pages
    }

    /// True when the stored parameters differ from the caller's current
    /// run parameters — resuming with different settings would splice
    /// pages rendered at incompatible resolutions into one document.
    pub fn params_mismatch(&self, total_pages: u32, dpi: u32, languages: &[String]) -> bool {
        self.total_pages != total_pages || self.dpi != dpi || self.languages != languages
    }

    fn insert(&mut self, index: u32, outcome: PageOutcome) {
        // Disjointness: a page never regresses, so an index already present
        // in any set keeps its original outcome.
        if self.contains(index) {
            return;
        }
        match outcome {
            PageOutcome::Completed => self.completed_pages.insert(index),
            PageOutcome::Skipped => self.skipped_pages.insert(index),
            PageOutcome::Failed => self.failed_pages.insert(index),
        };
    }
}

/// Manages checkpoint files in one directory.
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Default store directory: `~/.textlayer/checkpoints`.
    pub fn default_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".textlayer")
            .join("checkpoints")
    }

    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, ConvertError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| ConvertError::CheckpointStoreUnavailable {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    /// Create a fresh checkpoint with empty page sets and persist it.
    pub fn create(
        &self,
        input_path: &Path,
        output_path: &Path,
        total_pages: u32,
        dpi: u32,
        languages: &[String],
    ) -> Result<Checkpoint, ConvertError> {
        let now = Utc::now();
        let checkpoint = Checkpoint {
            input_path: input_path.to_path_buf(),
            output_path: output_path.to_path_buf(),
            temp_output_path: temp_output_path_for(output_path),
            total_pages,
            completed_pages: BTreeSet::new(),
            skipped_pages: BTreeSet::new(),
            failed_pages: BTreeSet::new(),
            started_at: now,
            updated_at: now,
            dpi,
            languages: languages.to_vec(),
            input_hash: fingerprint(input_path).unwrap_or_default(),
        };
        self.save(&checkpoint)?;
        Ok(checkpoint)
    }

    /// Load the checkpoint for `input_path` if one exists and is valid.
    ///
    /// Returns `None` (deleting the stale record) when the file is absent,
    /// unparseable, the input fingerprint has changed, or the temporary
    /// output artifact it refers to no longer exists. Parameter mismatch
    /// is the caller's check (see [`Checkpoint::params_mismatch`]) since
    /// only the caller knows the current run's settings.
    pub fn load(&self, input_path: &Path) -> Option<Checkpoint> {
        let path = self.record_path(input_path);
        if !path.exists() {
            return None;
        }

        let checkpoint: Checkpoint = match fs::read_to_string(&path)
            .ok()
            .and_then(|data| serde_json::from_str(&data).ok())
        {
            Some(cp) => cp,
            None => {
                warn!("checkpoint at {} is unreadable, discarding", path.display());
                self.delete(input_path);
                return None;
            }
        };

        let current_hash = fingerprint(input_path).unwrap_or_default();
        if !current_hash.is_empty()
            && !checkpoint.input_hash.is_empty()
            && current_hash != checkpoint.input_hash
        {
            debug!("input file changed since checkpoint, discarding");
            self.delete(input_path);
            return None;
        }

        if !checkpoint.temp_output_path.exists() {
            debug!("checkpoint temp artifact missing, discarding");
            self.delete(input_path);
            return None;
        }

        Some(checkpoint)
    }

    /// Record a terminal page outcome and persist atomically.
    ///
    /// Idempotent: marking an already-covered page changes nothing except
    /// the `updated_at` stamp.
    pub fn mark(
        &self,
        checkpoint: &mut Checkpoint,
        index: u32,
        outcome: PageOutcome,
    ) -> Result<(), ConvertError> {
        checkpoint.insert(index, outcome);
        self.save(checkpoint)
    }

    /// Persist the full record via temp-write-then-rename.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), ConvertError> {
        let mut checkpoint = checkpoint.clone();
        checkpoint.updated_at = Utc::now();

        let target = self.record_path(&checkpoint.input_path);
        let json = serde_json::to_string_pretty(&checkpoint)
            .map_err(|e| ConvertError::Internal(format!("checkpoint serialize: {e}")))?;

        let tmp = target.with_extension("tmp");
        fs::write(&tmp, json).map_err(|source| ConvertError::CheckpointStoreUnavailable {
            path: self.dir.clone(),
            source,
        })?;
        fs::rename(&tmp, &target).map_err(|source| {
            let _ = fs::remove_file(&tmp);
            ConvertError::CheckpointStoreUnavailable {
                path: self.dir.clone(),
                source,
            }
        })?;
        Ok(())
    }

    /// Delete the checkpoint record for `input_path` (best-effort).
    pub fn delete(&self, input_path: &Path) {
        let _ = fs::remove_file(self.record_path(input_path));
    }

    /// Delete the checkpoint and its temp output after a successful run.
    pub fn cleanup(&self, checkpoint: &Checkpoint) {
        let _ = fs::remove_file(&checkpoint.temp_output_path);
        self.delete(&checkpoint.input_path);
    }

    /// Startup maintenance: delete any checkpoint (and its temp artifact)
    /// not updated within `max_age`, plus anything unparseable. Reclaims
    /// state orphaned by crashes that never reached a clean exit.
    ///
    /// Returns the number of records removed.
    pub fn sweep(&self, max_age: Duration) -> u32 {
        let now = Utc::now();
        let mut cleaned = 0;

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return 0,
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let parsed: Option<Checkpoint> = fs::read_to_string(&path)
                .ok()
                .and_then(|data| serde_json::from_str(&data).ok());

            match parsed {
                Some(checkpoint) => {
                    if now - checkpoint.updated_at > max_age {
                        let _ = fs::remove_file(&checkpoint.temp_output_path);
                        if fs::remove_file(&path).is_ok() {
                            cleaned += 1;
                        }
                    }
                }
                None => {
                    if fs::remove_file(&path).is_ok() {
                        cleaned += 1;
                    }
                }
            }
        }

        if cleaned > 0 {
            debug!("swept {} stale checkpoint(s)", cleaned);
        }
        cleaned
    }

    /// Checkpoint record path for an input file: a short hash of the full
    /// path keeps records unique while the stem keeps them recognisable.
    fn record_path(&self, input_path: &Path) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(input_path.to_string_lossy().as_bytes());
        let digest = hasher.finalize();
        let short: String = digest.iter().take(6).map(|b| format!("{b:02x}")).collect();

        let stem: String = input_path
            .file_stem()
            .map(|s| s.to_string_lossy().chars().take(20).collect())
            .unwrap_or_else(|| "input".to_string());

        self.dir.join(format!("{stem}_{short}.checkpoint.json"))
    }
}

/// Temp output path for a final output path: hidden sibling file so a
/// half-written document never shadows the real output.
pub fn temp_output_path_for(output_path: &Path) -> PathBuf {
    let stem = output_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string());
    let ext = output_path
        .extension()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "pdf".to_string());
    let parent = output_path.parent().unwrap_or_else(|| Path::new("."));
    parent.join(format!(".{stem}_temp.{ext}"))
}

/// Content fingerprint: SHA-256 over the first 1 MiB, the last 1 MiB (when
/// the file is larger than 2 MiB), and the decimal file size.
pub fn fingerprint(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path)?;
    let size = file.metadata()?.len();

    let mut hasher = Sha256::new();
    let mut head = vec![0u8; FINGERPRINT_WINDOW.min(size) as usize];
    file.read_exact(&mut head)?;
    hasher.update(&head);

    if size > 2 * FINGERPRINT_WINDOW {
        file.seek(SeekFrom::End(-(FINGERPRINT_WINDOW as i64)))?;
        let mut tail = vec![0u8; FINGERPRINT_WINDOW as usize];
        file.read_exact(&mut tail)?;
        hasher.update(&tail);
    }

    hasher.update(size.to_string().as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_checkpoint(total: u32) -> Checkpoint {
        let now = Utc::now();
        Checkpoint {
            input_path: "/test.pdf".into(),
            output_path: "/test_ocr.pdf".into(),
            temp_output_path: "/tmp/.test_ocr_temp.pdf".into(),
            total_pages: total,
            completed_pages: BTreeSet::new(),
            skipped_pages: BTreeSet::new(),
            failed_pages: BTreeSet::new(),
            started_at: now,
            updated_at: now,
            dpi: 300,
            languages: vec!["eng".into()],
            input_hash: "abc123".into(),
        }
    }

    fn store_with_input() -> (TempDir, CheckpointStore, PathBuf) {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(dir.path().join("checkpoints")).unwrap();
        let input = dir.path().join("scan.pdf");
        fs::write(&input, b"%PDF-1.4 fake content for fingerprinting").unwrap();
        (dir, store, input)
    }

    #[test]
    fn next_page_skips_covered_indices() {
        let mut cp = sample_checkpoint(10);
        cp.completed_pages.extend([0, 1, 2]);
        cp.skipped_pages.insert(3);
        cp.failed_pages.insert(4);
        assert_eq!(cp.next_page(), Some(5));
        assert!(!cp.is_complete());
    }

    #[test]
    fn complete_when_union_covers_all_pages() {
        let mut cp = sample_checkpoint(3);
        cp.completed_pages.extend([0, 2]);
        cp.skipped_pages.insert(1);
        assert!(cp.is_complete());
        assert_eq!(cp.next_page(), None);
    }

    #[test]
    fn sets_stay_disjoint_under_conflicting_marks() {
        let mut cp = sample_checkpoint(5);
        cp.insert(2, PageOutcome::Completed);
        cp.insert(2, PageOutcome::Failed);
        cp.insert(2, PageOutcome::Skipped);

        assert!(cp.completed_pages.contains(&2));
        assert!(!cp.failed_pages.contains(&2));
        assert!(!cp.skipped_pages.contains(&2));

        // Pairwise disjoint over every set after arbitrary marks.
        cp.insert(3, PageOutcome::Skipped);
        cp.insert(4, PageOutcome::Failed);
        assert!(cp.completed_pages.is_disjoint(&cp.skipped_pages));
        assert!(cp.completed_pages.is_disjoint(&cp.failed_pages));
        assert!(cp.skipped_pages.is_disjoint(&cp.failed_pages));
    }

    #[test]
    fn progress_percent_counts_all_sets() {
        let mut cp = sample_checkpoint(10);
        cp.completed_pages.extend([0, 1, 2, 3]);
        cp.skipped_pages.insert(4);
        assert_eq!(cp.progress_percent(), 50);
    }

    #[test]
    fn save_load_round_trip_preserves_sets_and_params() {
        let (dir, store, input) = store_with_input();
        let output = dir.path().join("scan_ocr.pdf");
        let mut cp = store
            .create(&input, &output, 10, 300, &["eng".into()])
            .unwrap();
        store.mark(&mut cp, 0, PageOutcome::Completed).unwrap();
        store.mark(&mut cp, 1, PageOutcome::Completed).unwrap();
        store.mark(&mut cp, 2, PageOutcome::Skipped).unwrap();
        store.mark(&mut cp, 5, PageOutcome::Failed).unwrap();

        // A valid checkpoint requires its temp artifact on disk.
        fs::write(&cp.temp_output_path, b"partial").unwrap();

        let loaded = store.load(&input).expect("checkpoint should load");
        assert_eq!(loaded.completed_pages, cp.completed_pages);
        assert_eq!(loaded.skipped_pages, cp.skipped_pages);
        assert_eq!(loaded.failed_pages, cp.failed_pages);
        assert_eq!(loaded.total_pages, 10);
        assert_eq!(loaded.dpi, 300);
        assert_eq!(loaded.languages, vec!["eng".to_string()]);
        assert_eq!(loaded.next_page(), Some(3));

        fs::remove_file(&cp.temp_output_path).ok();
    }

    #[test]
    fn load_discards_when_temp_artifact_missing() {
        let (_dir, store, input) = store_with_input();
        let cp = store
            .create(&input, Path::new("/nonexistent/out.pdf"), 5, 300, &["eng".into()])
            .unwrap();
        assert!(!cp.temp_output_path.exists());
        assert!(store.load(&input).is_none());
        // The stale record was deleted, not just rejected.
        assert!(store.load(&input).is_none());
    }

    #[test]
    fn load_discards_when_input_content_changes() {
        let (dir, store, input) = store_with_input();
        let output = dir.path().join("scan_ocr.pdf");
        let cp = store
            .create(&input, &output, 5, 300, &["eng".into()])
            .unwrap();
        fs::write(&cp.temp_output_path, b"partial").unwrap();
        assert!(store.load(&input).is_some());

        fs::write(&input, b"%PDF-1.4 completely different bytes now").unwrap();
        assert!(store.load(&input).is_none());
    }

    #[test]
    fn load_discards_corrupt_record() {
        let (_dir, store, input) = store_with_input();
        store
            .create(&input, Path::new("/out.pdf"), 5, 300, &["eng".into()])
            .unwrap();
        let record = store.record_path(&input);
        fs::write(&record, b"{ not json").unwrap();
        assert!(store.load(&input).is_none());
        assert!(!record.exists());
    }

    #[test]
    fn params_mismatch_detects_setting_changes() {
        let cp = sample_checkpoint(10);
        let langs = vec!["eng".to_string()];
        assert!(!cp.params_mismatch(10, 300, &langs));
        assert!(cp.params_mismatch(11, 300, &langs));
        assert!(cp.params_mismatch(10, 150, &langs));
        assert!(cp.params_mismatch(10, 300, &["deu".to_string()]));
    }

    #[test]
    fn cleanup_removes_record_and_temp_artifact() {
        let (dir, store, input) = store_with_input();
        let output = dir.path().join("scan_ocr.pdf");
        let cp = store
            .create(&input, &output, 3, 300, &["eng".into()])
            .unwrap();
        fs::write(&cp.temp_output_path, b"partial").unwrap();

        store.cleanup(&cp);
        assert!(!cp.temp_output_path.exists());
        assert!(store.load(&input).is_none());
    }

    #[test]
    fn sweep_removes_old_and_unparseable_records() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(dir.path()).unwrap();

        // Stale record: updated_at two days ago.
        let mut stale = sample_checkpoint(10);
        stale.updated_at = Utc::now() - Duration::hours(48);
        let stale_path = dir.path().join("stale.checkpoint.json");
        fs::write(&stale_path, serde_json::to_string(&stale).unwrap()).unwrap();

        // Fresh record: untouched.
        let fresh = sample_checkpoint(10);
        let fresh_path = dir.path().join("fresh.checkpoint.json");
        fs::write(&fresh_path, serde_json::to_string(&fresh).unwrap()).unwrap();

        // Garbage record.
        let garbage_path = dir.path().join("garbage.checkpoint.json");
        fs::write(&garbage_path, b"not json at all").unwrap();

        let cleaned = store.sweep(Duration::hours(24));
        assert_eq!(cleaned, 2);
        assert!(!stale_path.exists());
        assert!(fresh_path.exists());
        assert!(!garbage_path.exists());
    }

    #[test]
    fn fingerprint_changes_with_content_and_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.pdf");

        fs::write(&path, b"aaaa").unwrap();
        let h1 = fingerprint(&path).unwrap();
        fs::write(&path, b"bbbb").unwrap();
        let h2 = fingerprint(&path).unwrap();
        fs::write(&path, b"aaaaa").unwrap();
        let h3 = fingerprint(&path).unwrap();

        assert_ne!(h1, h2);
        assert_ne!(h1, h3);
    }

    #[test]
    fn temp_output_path_is_hidden_sibling() {
        let temp = temp_output_path_for(Path::new("/data/out/scan_ocr.pdf"));
        assert_eq!(temp, PathBuf::from("/data/out/.scan_ocr_temp.pdf"));
    }
}
