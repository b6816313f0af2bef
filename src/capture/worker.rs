//! One capture loop per source

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, trace, warn};

use super::backoff::Backoff;
use super::decoder;
use super::frame::{RawImage, SourceId};
use super::source::{FrameSource, FrameStream, ReadOutcome, SourceError};
use super::state::{SourceState, SourceStatus};
use crate::pipeline::handoff::{HandoffSender, Preview};
use crate::pipeline::history::HistoryBuffer;
use crate::DisplayConfig;

/// What the loop does after one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Continue,
    Sleep(Duration),
}

pub struct CaptureWorker<S: FrameSource> {
    id: SourceId,
    uri: String,
    source: S,
    stream: Option<S::Stream>,
    state: Arc<SourceState>,
    history: Arc<HistoryBuffer>,
    handoff: HandoffSender,
    display: DisplayConfig,
    pause_interval: Duration,
    backoff: Backoff,
    /// Disconnected (or signalled) when the worker must stop
    stop: flume::Receiver<()>,
    router_gone: bool,
}

pub struct WorkerParts {
    pub uri: String,
    pub state: Arc<SourceState>,
    pub history: Arc<HistoryBuffer>,
    pub handoff: HandoffSender,
    pub display: DisplayConfig,
    pub pause_interval: Duration,
    pub backoff: Backoff,
    pub stop: flume::Receiver<()>,
}

impl<S: FrameSource> CaptureWorker<S> {
    pub fn new(source: S, parts: WorkerParts) -> Self {
        Self {
            id: parts.state.id().clone(),
            uri: parts.uri,
            source,
            stream: None,
            state: parts.state,
            history: parts.history,
            handoff: parts.handoff,
            display: parts.display,
            pause_interval: parts.pause_interval,
            backoff: parts.backoff,
            stop: parts.stop,
            router_gone: false,
        }
    }

    /// Runs until the stop channel fires or disconnects. Source failures
    /// never end the loop.
    pub fn run(mut self) {
        info!(source = %self.id, "capture worker started");
        while !self.stop_requested() {
            if let Step::Sleep(delay) = self.step() {
                if self.sleep(delay) {
                    break;
                }
            }
        }
        self.close_stream();
        self.state.set_status(SourceStatus::Stopped);
        info!(source = %self.id, "capture worker stopped");
    }

    #[instrument(level = "trace", skip(self), fields(source = %self.id))]
    pub(crate) fn step(&mut self) -> Step {
        if self.state.is_paused() {
            if self.stream.is_some() {
                debug!(source = %self.id, "paused, releasing stream");
                self.close_stream();
            }
            self.state.set_status(SourceStatus::Paused);
            self.publish(Preview::Blank);
            return Step::Sleep(self.pause_interval);
        }

        let Some(stream) = self.stream.as_mut() else {
            return self.connect();
        };

        match stream.read_frame() {
            Ok(ReadOutcome::Frame(raw)) => {
                match self.ingest(raw) {
                    Ok(()) => self.backoff.reset(),
                    Err(e) => warn!(source = %self.id, "dropping undecodable frame: {}", e),
                }
                Step::Continue
            }
            Ok(ReadOutcome::EndOfStream) => {
                info!(source = %self.id, "end of stream, reconnecting");
                self.reconnect_after_failure()
            }
            Err(e) => {
                warn!(source = %self.id, "read failed, reconnecting: {}", e);
                self.reconnect_after_failure()
            }
        }
    }

    fn connect(&mut self) -> Step {
        self.state.set_status(SourceStatus::Connecting);
        match self.source.open(&self.id, &self.uri) {
            Ok(stream) => {
                info!(source = %self.id, "source opened");
                self.stream = Some(stream);
                self.state.set_status(SourceStatus::Streaming);
                Step::Continue
            }
            Err(e) => {
                warn!(source = %self.id, "open failed: {}", e);
                self.back_off()
            }
        }
    }

    fn reconnect_after_failure(&mut self) -> Step {
        self.close_stream();
        metrics::counter!("source_reconnects", "source" => self.id.to_string()).increment(1);
        self.back_off()
    }

    fn back_off(&mut self) -> Step {
        let delay = self.backoff.next_delay();
        self.state.set_status(SourceStatus::Backoff {
            attempt: self.backoff.attempt(),
        });
        debug!(source = %self.id, ?delay, "backing off");
        Step::Sleep(delay)
    }

    fn ingest(&mut self, raw: RawImage) -> Result<(), SourceError> {
        let captured_at = Instant::now();
        let full = decoder::decode_frame(&raw)?;
        let display = decoder::to_display(&full, self.display.width, self.display.height);

        let entry = self.history.append(
            decoder::into_frame(full, 0, raw.device_timestamp, captured_at),
            decoder::into_frame(display, 0, raw.device_timestamp, captured_at),
        );
        metrics::counter!("frames_captured", "source" => self.id.to_string()).increment(1);
        trace!(source = %self.id, sequence = entry.sample.sequence, "frame appended");

        self.publish(Preview::Live(entry.display));
        Ok(())
    }

    fn publish(&mut self, preview: Preview) {
        match self.handoff.publish(preview) {
            Ok(()) => self.router_gone = false,
            Err(e) if !self.router_gone => {
                debug!(source = %self.id, "preview not delivered: {}", e);
                self.router_gone = true;
            }
            Err(_) => {}
        }
    }

    fn close_stream(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.close();
        }
    }

    fn stop_requested(&self) -> bool {
        self.stop.is_disconnected() || !self.stop.is_empty()
    }

    /// Interruptible sleep; true when a stop arrived meanwhile.
    fn sleep(&self, delay: Duration) -> bool {
        !matches!(
            self.stop.recv_timeout(delay),
            Err(flume::RecvTimeoutError::Timeout)
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::capture::frame::PixelFormat;
    use crate::capture::BackoffConfig;
    use crate::pipeline::handoff::{self, HandoffReceiver};
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted behaviour of a test source.
    #[derive(Debug, Clone)]
    pub(crate) enum Scripted {
        FailOpen,
        Frame(u8),
        Garbage,
        End,
        ReadError,
    }

    #[derive(Default)]
    pub(crate) struct Counters {
        pub opens: AtomicUsize,
        pub reads: AtomicUsize,
        pub closes: AtomicUsize,
    }

    /// Plays a script; once the script runs out it streams frames forever.
    pub(crate) struct ScriptedSource {
        pub script: Arc<parking_lot::Mutex<VecDeque<Scripted>>>,
        pub counters: Arc<Counters>,
        pub size: (u32, u32),
    }

    pub(crate) struct ScriptedStream {
        script: Arc<parking_lot::Mutex<VecDeque<Scripted>>>,
        counters: Arc<Counters>,
        size: (u32, u32),
    }

    impl ScriptedSource {
        pub(crate) fn new(script: Vec<Scripted>, size: (u32, u32)) -> Self {
            Self {
                script: Arc::new(parking_lot::Mutex::new(script.into())),
                counters: Arc::new(Counters::default()),
                size,
            }
        }
    }

    impl FrameSource for ScriptedSource {
        type Stream = ScriptedStream;

        fn open(&mut self, id: &SourceId, _uri: &str) -> Result<ScriptedStream, SourceError> {
            self.counters.opens.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock();
            if matches!(script.front(), Some(Scripted::FailOpen)) {
                script.pop_front();
                return Err(SourceError::Open {
                    id: id.clone(),
                    reason: "refused".into(),
                });
            }
            Ok(ScriptedStream {
                script: Arc::clone(&self.script),
                counters: Arc::clone(&self.counters),
                size: self.size,
            })
        }
    }

    impl FrameStream for ScriptedStream {
        fn read_frame(&mut self) -> Result<ReadOutcome, SourceError> {
            self.counters.reads.fetch_add(1, Ordering::SeqCst);
            let (w, h) = self.size;
            let frame = |value: u8| {
                Ok(ReadOutcome::Frame(RawImage {
                    data: Bytes::from(vec![value; (w * h * 3) as usize]),
                    width: w,
                    height: h,
                    format: PixelFormat::Rgb24,
                    device_timestamp: None,
                }))
            };
            match self.script.lock().pop_front() {
                None => frame(7),
                Some(Scripted::Frame(value)) => frame(value),
                Some(Scripted::Garbage) => Ok(ReadOutcome::Frame(RawImage {
                    data: Bytes::from_static(&[1, 2, 3]),
                    width: w,
                    height: h,
                    format: PixelFormat::Rgb24,
                    device_timestamp: None,
                })),
                Some(Scripted::End) => Ok(ReadOutcome::EndOfStream),
                Some(Scripted::ReadError) | Some(Scripted::FailOpen) => Err(SourceError::Read {
                    id: SourceId::new("scripted"),
                    reason: "connection reset".into(),
                }),
            }
        }

        fn close(&mut self) {
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        worker: CaptureWorker<ScriptedSource>,
        counters: Arc<Counters>,
        state: Arc<SourceState>,
        history: Arc<HistoryBuffer>,
        rx: HandoffReceiver,
        _stop: flume::Sender<()>,
    }

    fn harness(script: Vec<Scripted>) -> Harness {
        let source = ScriptedSource::new(script, (8, 6));
        let counters = Arc::clone(&source.counters);
        let id = SourceId::new("cam");
        let state = Arc::new(SourceState::new(id.clone()));
        let history = Arc::new(HistoryBuffer::new(id.clone(), 4));
        let (hub, rx) = handoff::channel(4);
        let (stop_tx, stop_rx) = flume::bounded(1);
        let worker = CaptureWorker::new(
            source,
            WorkerParts {
                uri: "scripted://cam".into(),
                state: Arc::clone(&state),
                history: Arc::clone(&history),
                handoff: hub.sender(id, 8),
                display: DisplayConfig {
                    width: 4,
                    height: 3,
                },
                pause_interval: Duration::from_millis(100),
                backoff: Backoff::new(BackoffConfig::default()),
                stop: stop_rx,
            },
        );
        Harness {
            worker,
            counters,
            state,
            history,
            rx,
            _stop: stop_tx,
        }
    }

    #[test]
    fn open_failure_backs_off_and_retries() {
        let mut h = harness(vec![Scripted::FailOpen, Scripted::FailOpen, Scripted::Frame(1)]);

        assert_eq!(h.worker.step(), Step::Sleep(Duration::from_secs(1)));
        assert_eq!(h.state.status(), SourceStatus::Backoff { attempt: 1 });
        assert_eq!(h.worker.step(), Step::Sleep(Duration::from_secs(2)));
        assert_eq!(h.worker.step(), Step::Continue);
        assert_eq!(h.state.status(), SourceStatus::Streaming);
        assert_eq!(h.counters.opens.load(Ordering::SeqCst), 3);
        assert!(h.history.is_empty());
    }

    #[test]
    fn frames_land_in_history_and_handoff() {
        let mut h = harness(vec![Scripted::Frame(10), Scripted::Frame(20)]);
        h.worker.step(); // open
        h.worker.step();
        h.worker.step();

        assert_eq!(h.history.resident_sequences(), vec![0, 1]);
        let entry = h.history.latest().unwrap();
        assert_eq!((entry.full.width(), entry.full.height()), (8, 6));
        assert_eq!((entry.display.width(), entry.display.height()), (4, 3));
        assert_eq!(entry.full.data[0], 20);

        let delivery = h.rx.recv_timeout(Duration::from_millis(50)).unwrap();
        let seqs: Vec<u64> = delivery
            .previews
            .iter()
            .filter_map(|p| match p {
                Preview::Live(f) => Some(f.sequence()),
                Preview::Blank => None,
            })
            .collect();
        assert_eq!(seqs, vec![0, 1]);
    }

    #[test]
    fn end_of_stream_closes_and_reconnects() {
        let mut h = harness(vec![Scripted::Frame(1), Scripted::End, Scripted::ReadError]);
        h.worker.step(); // open
        h.worker.step(); // frame
        assert!(matches!(h.worker.step(), Step::Sleep(_))); // end
        assert_eq!(h.counters.closes.load(Ordering::SeqCst), 1);

        assert_eq!(h.worker.step(), Step::Continue); // reopen
        assert!(matches!(h.worker.step(), Step::Sleep(_))); // read error
        assert_eq!(h.counters.closes.load(Ordering::SeqCst), 2);
        assert_eq!(h.counters.opens.load(Ordering::SeqCst), 2);
        assert_eq!(h.history.len(), 1);
    }

    #[test]
    fn successful_frame_resets_backoff() {
        let mut h = harness(vec![Scripted::End, Scripted::Frame(1), Scripted::End]);
        h.worker.step(); // open
        assert_eq!(h.worker.step(), Step::Sleep(Duration::from_secs(1)));
        h.worker.step(); // reopen
        h.worker.step(); // frame
        assert_eq!(h.worker.step(), Step::Sleep(Duration::from_secs(1)));
    }

    #[test]
    fn undecodable_frame_is_skipped_without_reconnect() {
        let mut h = harness(vec![Scripted::Garbage, Scripted::Frame(3)]);
        h.worker.step(); // open
        assert_eq!(h.worker.step(), Step::Continue);
        assert_eq!(h.worker.step(), Step::Continue);
        assert_eq!(h.history.resident_sequences(), vec![0]);
        assert_eq!(h.counters.opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn paused_worker_publishes_blank_and_stops_reading() {
        let mut h = harness(vec![]);
        h.worker.step(); // open
        h.worker.step(); // frame
        let reads = h.counters.reads.load(Ordering::SeqCst);
        h.rx.recv_timeout(Duration::from_millis(50)).unwrap();

        h.state.set_paused(true);
        assert_eq!(h.worker.step(), Step::Sleep(Duration::from_millis(100)));
        assert_eq!(h.worker.step(), Step::Sleep(Duration::from_millis(100)));
        assert_eq!(h.counters.reads.load(Ordering::SeqCst), reads);
        assert_eq!(h.counters.closes.load(Ordering::SeqCst), 1);
        assert_eq!(h.state.status(), SourceStatus::Paused);
        assert_eq!(h.history.len(), 1);

        let delivery = h.rx.recv_timeout(Duration::from_millis(50)).unwrap();
        assert!(delivery
            .previews
            .iter()
            .all(|p| matches!(p, Preview::Blank)));

        h.state.set_paused(false);
        assert_eq!(h.worker.step(), Step::Continue); // reopen
        h.worker.step();
        assert_eq!(h.history.len(), 2);
    }

    #[test]
    fn stop_signal_ends_run() {
        let h = harness(vec![]);
        let Harness {
            worker,
            counters,
            state,
            _stop,
            ..
        } = h;
        let handle = std::thread::spawn(move || worker.run());
        std::thread::sleep(Duration::from_millis(20));
        drop(_stop);
        handle.join().unwrap();
        assert_eq!(state.status(), SourceStatus::Stopped);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    }
}
