//! Single consumer of the hand-off channel; keeps one preview slot per source

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use tracing::{debug, info, trace};

use crate::capture::{Frame, SourceId, SourceState};
use crate::pipeline::handoff::{Delivery, HandoffReceiver, Preview, RecvError};
use crate::session::EventOutlet;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

struct PreviewSlot {
    state: Arc<SourceState>,
    current: ArcSwap<Frame>,
}

/// Current preview per source, readable from any thread.
pub struct PreviewBoard {
    blank: Arc<Frame>,
    slots: RwLock<HashMap<SourceId, Arc<PreviewSlot>>>,
}

impl PreviewBoard {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            blank: Arc::new(Frame::blank(width, height)),
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// The shared placeholder shown for paused sources.
    pub fn blank(&self) -> Arc<Frame> {
        Arc::clone(&self.blank)
    }

    pub fn register(&self, state: Arc<SourceState>) {
        let slot = Arc::new(PreviewSlot {
            state: Arc::clone(&state),
            current: ArcSwap::new(Arc::clone(&self.blank)),
        });
        self.slots.write().insert(state.id().clone(), slot);
    }

    pub fn current(&self, source: &SourceId) -> Option<Arc<Frame>> {
        self.slots
            .read()
            .get(source)
            .map(|slot| slot.current.load_full())
    }

    pub fn is_blank(&self, frame: &Arc<Frame>) -> bool {
        Arc::ptr_eq(frame, &self.blank)
    }

    fn slot(&self, source: &SourceId) -> Option<Arc<PreviewSlot>> {
        self.slots.read().get(source).cloned()
    }
}

pub struct DisplayRouter {
    rx: HandoffReceiver,
    board: Arc<PreviewBoard>,
    outlet: Arc<dyn EventOutlet>,
    stop: flume::Receiver<()>,
    /// Newest sequence applied per source
    applied: HashMap<SourceId, u64>,
}

impl DisplayRouter {
    pub fn new(
        rx: HandoffReceiver,
        board: Arc<PreviewBoard>,
        outlet: Arc<dyn EventOutlet>,
        stop: flume::Receiver<()>,
    ) -> Self {
        Self {
            rx,
            board,
            outlet,
            stop,
            applied: HashMap::new(),
        }
    }

    pub fn run(mut self) {
        info!("display router started");
        while !self.stop.is_disconnected() && self.stop.is_empty() {
            match self.rx.recv_timeout(POLL_INTERVAL) {
                Ok(delivery) => self.route(delivery),
                Err(RecvError::Timeout) => {}
                Err(RecvError::Disconnected) => break,
            }
        }
        info!("display router stopped");
    }

    pub(crate) fn route(&mut self, delivery: Delivery) {
        let Some(slot) = self.board.slot(&delivery.source) else {
            debug!(source = %delivery.source, "preview for unregistered source");
            return;
        };

        for preview in delivery.previews {
            // Pause wins over anything already in flight
            let frame = match preview {
                _ if slot.state.is_paused() => self.board.blank(),
                Preview::Blank => self.board.blank(),
                Preview::Live(frame) => {
                    let last = self.applied.get(&delivery.source).copied();
                    if last.is_some_and(|last| frame.sequence() < last) {
                        trace!(source = %delivery.source, "stale preview skipped");
                        continue;
                    }
                    self.applied.insert(delivery.source.clone(), frame.sequence());
                    frame
                }
            };

            if Arc::ptr_eq(&slot.current.load(), &frame) {
                continue;
            }
            slot.current.store(Arc::clone(&frame));
            let paused = self.board.is_blank(&frame);
            self.outlet.on_preview_updated(&delivery.source, &frame, paused);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::handoff;
    use crate::session::tests::RecordingOutlet;

    fn live(seq: u64) -> Preview {
        Preview::Live(Arc::new(Frame::blank(4, 3).with_sequence(seq)))
    }

    struct Fixture {
        router: DisplayRouter,
        board: Arc<PreviewBoard>,
        outlet: Arc<RecordingOutlet>,
        state: Arc<SourceState>,
        _stop: flume::Sender<()>,
    }

    fn fixture() -> Fixture {
        let (_hub, rx) = handoff::channel(2);
        let board = Arc::new(PreviewBoard::new(4, 3));
        let state = Arc::new(SourceState::new(SourceId::new("a")));
        board.register(Arc::clone(&state));
        let outlet = Arc::new(RecordingOutlet::default());
        let (stop_tx, stop_rx) = flume::bounded(1);
        let router = DisplayRouter::new(
            rx,
            Arc::clone(&board),
            Arc::clone(&outlet) as Arc<dyn EventOutlet>,
            stop_rx,
        );
        Fixture {
            router,
            board,
            outlet,
            state,
            _stop: stop_tx,
        }
    }

    fn delivery(previews: Vec<Preview>) -> Delivery {
        Delivery {
            source: SourceId::new("a"),
            previews,
        }
    }

    #[test]
    fn slot_starts_blank_and_follows_live_frames() {
        let mut f = fixture();
        let id = SourceId::new("a");
        assert!(f.board.is_blank(&f.board.current(&id).unwrap()));

        f.router.route(delivery(vec![live(1), live(2)]));
        assert_eq!(f.board.current(&id).unwrap().sequence(), 2);
        assert_eq!(f.outlet.previews(), vec![(id.clone(), Some(1)), (id, Some(2))]);
    }

    #[test]
    fn pause_overrides_delivered_frames() {
        let mut f = fixture();
        let id = SourceId::new("a");
        f.router.route(delivery(vec![live(1)]));

        f.state.set_paused(true);
        f.router.route(delivery(vec![live(2), live(3)]));
        assert!(f.board.is_blank(&f.board.current(&id).unwrap()));
        // one switch to blank, repeats suppressed
        assert_eq!(f.outlet.previews().last(), Some(&(id.clone(), None)));
        assert_eq!(f.outlet.previews().len(), 2);

        f.state.set_paused(false);
        f.router.route(delivery(vec![live(4)]));
        assert_eq!(f.board.current(&id).unwrap().sequence(), 4);
    }

    #[test]
    fn older_sequences_are_never_applied_after_newer() {
        let mut f = fixture();
        f.router.route(delivery(vec![live(5)]));
        f.router.route(delivery(vec![live(3), live(6)]));
        let seqs: Vec<_> = f.outlet.previews().into_iter().map(|(_, s)| s).collect();
        assert_eq!(seqs, vec![Some(5), Some(6)]);
    }

    #[test]
    fn unknown_source_is_ignored() {
        let mut f = fixture();
        f.router.route(Delivery {
            source: SourceId::new("ghost"),
            previews: vec![live(1)],
        });
        assert!(f.outlet.previews().is_empty());
        assert!(f.board.current(&SourceId::new("ghost")).is_none());
    }
}
