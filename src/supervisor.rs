//! Owns every capture worker and the display router
//!
//! The supervisor is the only writer of pause flags and lifecycle
//! transitions. Pausing flips a flag; it never spawns or stops threads, so
//! each source has exactly one worker for its whole life.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{info, warn};

use crate::capture::worker::WorkerParts;
use crate::capture::{
    Backoff, CaptureWorker, FrameSource, SourceId, SourceState, SourceStatus,
};
use crate::display::{DisplayRouter, PreviewBoard};
use crate::pipeline::handoff::{self, HandoffHub};
use crate::pipeline::history::HistoryBuffer;
use crate::session::EventOutlet;
use crate::Config;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("source {0} already has a worker")]
    DuplicateSource(SourceId),

    #[error("unknown source {0}")]
    UnknownSource(SourceId),

    #[error("at most {0} sources are supported")]
    TooManySources(usize),

    #[error("supervisor is shut down")]
    ShutDown,

    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),
}

struct WorkerHandle {
    state: Arc<SourceState>,
    history: Arc<HistoryBuffer>,
    /// Dropping this stops the worker
    stop: Option<flume::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

struct RouterHandle {
    stop: flume::Sender<()>,
    thread: JoinHandle<()>,
}

pub struct Supervisor {
    config: Arc<Config>,
    hub: Mutex<Option<HandoffHub>>,
    board: Arc<PreviewBoard>,
    workers: RwLock<HashMap<SourceId, WorkerHandle>>,
    /// Spawn order, for stable listings
    order: RwLock<Vec<SourceId>>,
    router: Mutex<Option<RouterHandle>>,
    solo: Mutex<Option<SourceId>>,
}

impl Supervisor {
    /// Creates the hand-off channel and starts the display router.
    pub fn start(config: Config, outlet: Arc<dyn EventOutlet>) -> Result<Self, SupervisorError> {
        let (hub, rx) = handoff::channel(config.capture.max_sources);
        let board = Arc::new(PreviewBoard::new(config.display.width, config.display.height));

        let (stop_tx, stop_rx) = flume::bounded(1);
        let router = DisplayRouter::new(rx, Arc::clone(&board), outlet, stop_rx);
        let thread = thread::Builder::new()
            .name("display-router".into())
            .spawn(move || router.run())?;

        info!(
            capacity = config.history.capacity,
            display = ?(config.display.width, config.display.height),
            "supervisor started"
        );

        Ok(Self {
            config: Arc::new(config),
            hub: Mutex::new(Some(hub)),
            board,
            workers: RwLock::new(HashMap::new()),
            order: RwLock::new(Vec::new()),
            router: Mutex::new(Some(RouterHandle {
                stop: stop_tx,
                thread,
            })),
            solo: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn board(&self) -> &Arc<PreviewBoard> {
        &self.board
    }

    /// Starts the single worker for `id`.
    pub fn spawn_source<S: FrameSource>(
        &self,
        id: SourceId,
        uri: impl Into<String>,
        source: S,
    ) -> Result<(), SupervisorError> {
        let mut workers = self.workers.write();
        if workers.contains_key(&id) {
            return Err(SupervisorError::DuplicateSource(id));
        }
        if workers.len() >= self.config.capture.max_sources {
            return Err(SupervisorError::TooManySources(self.config.capture.max_sources));
        }
        let handoff = match self.hub.lock().as_ref() {
            Some(hub) => hub.sender(id.clone(), self.config.capture.handoff_depth),
            None => return Err(SupervisorError::ShutDown),
        };

        let state = Arc::new(SourceState::new(id.clone()));
        let history = Arc::new(HistoryBuffer::new(id.clone(), self.config.history.capacity));
        let (stop_tx, stop_rx) = flume::bounded(1);

        let worker = CaptureWorker::new(
            source,
            WorkerParts {
                uri: uri.into(),
                state: Arc::clone(&state),
                history: Arc::clone(&history),
                handoff,
                display: self.config.display.clone(),
                pause_interval: self.config.capture.pause_interval(),
                backoff: Backoff::new(self.config.backoff.clone()),
                stop: stop_rx,
            },
        );

        self.board.register(Arc::clone(&state));
        let thread = thread::Builder::new()
            .name(format!("capture-{}", id))
            .spawn(move || worker.run())?;

        info!(source = %id, "capture worker spawned");
        workers.insert(
            id.clone(),
            WorkerHandle {
                state,
                history,
                stop: Some(stop_tx),
                thread: Some(thread),
            },
        );
        self.order.write().push(id);
        Ok(())
    }

    pub fn source_ids(&self) -> Vec<SourceId> {
        self.order.read().clone()
    }

    pub fn history(&self, id: &SourceId) -> Option<Arc<HistoryBuffer>> {
        self.workers.read().get(id).map(|w| Arc::clone(&w.history))
    }

    pub fn state(&self, id: &SourceId) -> Option<Arc<SourceState>> {
        self.workers.read().get(id).map(|w| Arc::clone(&w.state))
    }

    pub fn status(&self, id: &SourceId) -> Option<SourceStatus> {
        self.workers.read().get(id).map(|w| w.state.status())
    }

    /// Sources spawned so far; shut-down workers stay listed.
    pub fn worker_count(&self) -> usize {
        self.workers.read().len()
    }

    /// Worker threads still executing.
    pub fn live_workers(&self) -> usize {
        self.workers
            .read()
            .values()
            .filter(|w| w.thread.as_ref().is_some_and(|t| !t.is_finished()))
            .count()
    }

    /// Flips the pause flag of one source; returns the new value. Ends solo
    /// view, so a later `solo` starts fresh instead of resuming everything.
    pub fn toggle_pause(&self, id: &SourceId) -> Result<bool, SupervisorError> {
        let workers = self.workers.read();
        let worker = workers
            .get(id)
            .ok_or_else(|| SupervisorError::UnknownSource(id.clone()))?;
        *self.solo.lock() = None;
        let paused = worker.state.toggle_paused();
        info!(source = %id, paused, "pause toggled");
        Ok(paused)
    }

    /// Flips every source's pause flag.
    pub fn toggle_all(&self) {
        *self.solo.lock() = None;
        for worker in self.workers.read().values() {
            worker.state.toggle_paused();
        }
        info!("pause toggled on all sources");
    }

    /// Pauses every source except `id`. Calling it again for the same
    /// source resumes everything. Returns whether solo view is now active.
    pub fn solo(&self, id: &SourceId) -> Result<bool, SupervisorError> {
        let workers = self.workers.read();
        if !workers.contains_key(id) {
            return Err(SupervisorError::UnknownSource(id.clone()));
        }

        let mut solo = self.solo.lock();
        let leaving = solo.as_ref() == Some(id);
        for (other, worker) in workers.iter() {
            worker.state.set_paused(!leaving && other != id);
        }
        *solo = if leaving { None } else { Some(id.clone()) };
        info!(source = %id, active = !leaving, "solo view");
        Ok(!leaving)
    }

    /// Stops all workers and the router. A worker stuck in a read gets the
    /// configured grace period and is then detached; its stream is closed
    /// whenever that read returns.
    pub fn shutdown(&self) {
        let grace = self.config.capture.shutdown_grace();
        let deadline = Instant::now() + grace;

        // New sources can no longer get a hand-off sender
        self.hub.lock().take();

        let mut threads = Vec::new();
        for (id, worker) in self.workers.write().iter_mut() {
            worker.stop.take();
            if let Some(thread) = worker.thread.take() {
                threads.push((id.clone(), thread));
            }
        }
        for (id, thread) in threads {
            if !join_within(thread, deadline) {
                warn!(source = %id, ?grace, "worker did not stop in time, detaching");
            }
        }

        if let Some(router) = self.router.lock().take() {
            drop(router.stop);
            if !join_within(router.thread, Instant::now() + grace) {
                warn!("display router did not stop in time, detaching");
            }
        }
        info!("supervisor shut down");
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if self.router.lock().is_some() {
            self.shutdown();
        }
    }
}

fn join_within(thread: JoinHandle<()>, deadline: Instant) -> bool {
    while !thread.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
    if thread.join().is_err() {
        warn!("thread panicked before joining");
    }
    true
}
