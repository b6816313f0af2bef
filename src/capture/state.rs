use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;

use super::frame::SourceId;

/// Transient health of a source, for operators and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStatus {
    Connecting,
    Streaming,
    Paused,
    Backoff { attempt: u32 },
    Stopped,
}

/// Per-source flags shared by the supervisor, the capture worker and the
/// display router. Only the supervisor changes the pause flag.
#[derive(Debug)]
pub struct SourceState {
    id: SourceId,
    paused: AtomicBool,
    status: ArcSwap<SourceStatus>,
}

impl SourceState {
    pub fn new(id: SourceId) -> Self {
        Self {
            id,
            paused: AtomicBool::new(false),
            status: ArcSwap::from_pointee(SourceStatus::Connecting),
        }
    }

    pub fn id(&self) -> &SourceId {
        &self.id
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Returns the new value.
    pub(crate) fn toggle_paused(&self) -> bool {
        !self.paused.fetch_xor(true, Ordering::AcqRel)
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    pub fn status(&self) -> SourceStatus {
        **self.status.load()
    }

    pub(crate) fn set_status(&self, status: SourceStatus) {
        if self.status() != status {
            self.status.store(Arc::new(status));
        }
    }
}
