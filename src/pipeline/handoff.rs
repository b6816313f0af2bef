//! Bounded hand-off from capture workers to the display router
//!
//! Every source owns a small drop-oldest mailbox of preview frames. The
//! shared flume channel only carries "this mailbox has something" tokens,
//! and a mailbox has at most one token in flight, so the channel never holds
//! more entries than there are sources and producers never wait on a slow
//! consumer. Within one mailbox frames leave in the order they entered.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;
use thiserror::Error;

use crate::capture::{Frame, SourceId};

/// What a worker hands to the display side.
#[derive(Debug, Clone)]
pub enum Preview {
    Live(Arc<Frame>),
    /// Source is paused; show the placeholder
    Blank,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandoffError {
    #[error("display router is gone")]
    Disconnected,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecvError {
    #[error("all capture workers are gone")]
    Disconnected,
    #[error("no preview within the timeout")]
    Timeout,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandoffStats {
    pub written: usize,
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Default)]
struct Stats {
    written: AtomicUsize,
    delivered: AtomicUsize,
    dropped: AtomicUsize,
}

struct Mailbox {
    source: SourceId,
    ring: Mutex<HeapRb<Preview>>,
    /// A token for this mailbox is queued or being drained
    pending: AtomicBool,
    stats: CachePadded<Stats>,
}

/// Creates the shared channel. `max_sources` bounds the token queue.
pub fn channel(max_sources: usize) -> (HandoffHub, HandoffReceiver) {
    let (tx, rx) = flume::bounded(max_sources.max(1));
    (HandoffHub { tx }, HandoffReceiver { rx })
}

/// Producer side factory; hands out one sender per source.
#[derive(Clone)]
pub struct HandoffHub {
    tx: flume::Sender<Arc<Mailbox>>,
}

impl HandoffHub {
    pub fn sender(&self, source: SourceId, depth: usize) -> HandoffSender {
        HandoffSender {
            mailbox: Arc::new(Mailbox {
                source,
                ring: Mutex::new(HeapRb::new(depth.max(1))),
                pending: AtomicBool::new(false),
                stats: CachePadded::new(Stats::default()),
            }),
            tx: self.tx.clone(),
        }
    }
}

pub struct HandoffSender {
    mailbox: Arc<Mailbox>,
    tx: flume::Sender<Arc<Mailbox>>,
}

impl HandoffSender {
    pub fn source(&self) -> &SourceId {
        &self.mailbox.source
    }

    /// Never blocks on the consumer: a full mailbox drops its oldest preview.
    pub fn publish(&self, preview: Preview) -> Result<(), HandoffError> {
        let stats = &self.mailbox.stats;
        let dropped = {
            let mut ring = self.mailbox.ring.lock();
            let dropped = if ring.is_full() { ring.try_pop() } else { None };
            let _ = ring.try_push(preview);
            dropped
        };
        stats.written.fetch_add(1, Ordering::Relaxed);
        if dropped.is_some() {
            stats.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("preview_frames_dropped", "source" => self.mailbox.source.to_string())
                .increment(1);
        }

        if !self.mailbox.pending.swap(true, Ordering::AcqRel) {
            // At most one token per mailbox is queued, so this only waits if
            // more sources exist than the channel was sized for.
            if self.tx.send(Arc::clone(&self.mailbox)).is_err() {
                self.mailbox.pending.store(false, Ordering::Release);
                return Err(HandoffError::Disconnected);
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> HandoffStats {
        let stats = &self.mailbox.stats;
        HandoffStats {
            written: stats.written.load(Ordering::Relaxed),
            delivered: stats.delivered.load(Ordering::Relaxed),
            dropped: stats.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Everything one mailbox held when it was drained, oldest first.
#[derive(Debug)]
pub struct Delivery {
    pub source: SourceId,
    pub previews: Vec<Preview>,
}

/// Consumer side; exactly one exists.
pub struct HandoffReceiver {
    rx: flume::Receiver<Arc<Mailbox>>,
}

impl HandoffReceiver {
    pub fn recv(&self) -> Result<Delivery, RecvError> {
        let mailbox = self.rx.recv().map_err(|_| RecvError::Disconnected)?;
        Ok(Self::drain(&mailbox))
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Delivery, RecvError> {
        let mailbox = self.rx.recv_timeout(timeout).map_err(|e| match e {
            flume::RecvTimeoutError::Timeout => RecvError::Timeout,
            flume::RecvTimeoutError::Disconnected => RecvError::Disconnected,
        })?;
        Ok(Self::drain(&mailbox))
    }

    fn drain(mailbox: &Mailbox) -> Delivery {
        // Clear before draining: a publish racing with us either lands in
        // this drain or queues a fresh token.
        mailbox.pending.store(false, Ordering::Release);
        let previews: Vec<Preview> = {
            let mut ring = mailbox.ring.lock();
            std::iter::from_fn(|| ring.try_pop()).collect()
        };
        mailbox
            .stats
            .delivered
            .fetch_add(previews.len(), Ordering::Relaxed);
        Delivery {
            source: mailbox.source.clone(),
            previews,
        }
    }
}
