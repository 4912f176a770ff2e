//! The page-processing pipeline.
//!
//! Two concurrent stages connected by a bounded queue:
//!
//! ```text
//! source PDF
//!  │
//!  ├─ render stage (spawn_blocking)   rasterise + classify pages ahead
//!  │        │ bounded mpsc (prefetch_pages)
//!  ├─ assembly stage (async)          recognize, build output pages,
//!  │                                  checkpoint, retry, fall back
//!  └─ output PDF
//! ```
//!
//! [`render`] produces tagged [`render::RenderedPage`] items;
//! [`dispatch`] routes recognition in-process or to the worker [`pool`];
//! [`layout`] turns recognition results into positioned invisible text;
//! [`coordinator`] owns the state machine, ordering, and integrity policy.

pub mod coordinator;
pub mod dispatch;
pub mod layout;
pub mod pool;
pub mod render;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared cancellation signal, checked at page boundaries in both stages.
///
/// Cancellation is cooperative: setting the flag never interrupts an
/// in-flight recognition call, it stops the run at the next page boundary
/// with the checkpoint persisted.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the run to stop at the next page boundary.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_flag_is_shared_across_clones() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_cancelled());
        flag.cancel();
        assert!(clone.is_cancelled());
    }
}
