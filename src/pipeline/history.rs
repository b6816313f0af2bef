//! Per-source rolling history of full and display resolution frames
//!
//! Two parallel fixed-capacity slot arrays indexed by
//! `sequence % capacity`. Both slots for a sequence are written inside the
//! same critical section, so readers never observe half of a pair.

use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::instrument;

use crate::capture::{Frame, SourceId};

/// Reference to one frame that was resident when the reference was taken.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Sample {
    pub source: SourceId,
    pub sequence: u64,
}

/// A matched (full, display) pair as stored in the buffer.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub sample: Sample,
    pub full: Arc<Frame>,
    pub display: Arc<Frame>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HistoryError {
    #[error("frame {sequence} of source {source_id} has been evicted")]
    NotFound { source_id: SourceId, sequence: u64 },

    #[error("sample belongs to source {got}, buffer holds {expected}")]
    WrongSource { expected: SourceId, got: SourceId },
}

struct Slots {
    full: Box<[Option<Arc<Frame>>]>,
    display: Box<[Option<Arc<Frame>>]>,
    /// Sequence number the next append receives
    next_sequence: u64,
    len: usize,
}

impl Slots {
    fn oldest(&self) -> u64 {
        self.next_sequence - self.len as u64
    }
}

pub struct HistoryBuffer {
    source: SourceId,
    capacity: usize,
    slots: RwLock<Slots>,
}

impl HistoryBuffer {
    /// # Panics
    /// If `capacity` is zero; configuration validation rejects that earlier.
    pub fn new(source: SourceId, capacity: usize) -> Self {
        assert!(capacity > 0, "history capacity must be non-zero");
        Self {
            source,
            capacity,
            slots: RwLock::new(Slots {
                full: vec![None; capacity].into_boxed_slice(),
                display: vec![None; capacity].into_boxed_slice(),
                next_sequence: 0,
                len: 0,
            }),
        }
    }

    pub fn source(&self) -> &SourceId {
        &self.source
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.slots.read().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stores a matched pair under the next sequence number, evicting the
    /// oldest pair once the buffer is full.
    #[instrument(level = "trace", skip_all, fields(source = %self.source))]
    pub fn append(&self, full: Frame, display: Frame) -> HistoryEntry {
        let mut slots = self.slots.write();
        let sequence = slots.next_sequence;
        let idx = (sequence % self.capacity as u64) as usize;

        let full = Arc::new(full.with_sequence(sequence));
        let display = Arc::new(display.with_sequence(sequence));

        let evicted = (
            slots.full[idx].replace(Arc::clone(&full)),
            slots.display[idx].replace(Arc::clone(&display)),
        );
        slots.next_sequence += 1;
        slots.len = (slots.len + 1).min(self.capacity);
        drop(slots);

        // Pixel buffers of evicted frames are freed outside the lock
        drop(evicted);

        HistoryEntry {
            sample: Sample {
                source: self.source.clone(),
                sequence,
            },
            full,
            display,
        }
    }

    pub fn resolve(&self, sample: &Sample) -> Result<HistoryEntry, HistoryError> {
        if sample.source != self.source {
            return Err(HistoryError::WrongSource {
                expected: self.source.clone(),
                got: sample.source.clone(),
            });
        }

        let slots = self.slots.read();
        let not_found = || HistoryError::NotFound {
            source_id: self.source.clone(),
            sequence: sample.sequence,
        };
        if sample.sequence < slots.oldest() || sample.sequence >= slots.next_sequence {
            return Err(not_found());
        }

        let idx = (sample.sequence % self.capacity as u64) as usize;
        match (&slots.full[idx], &slots.display[idx]) {
            (Some(full), Some(display))
                if full.sequence() == sample.sequence && display.sequence() == sample.sequence =>
            {
                Ok(HistoryEntry {
                    sample: sample.clone(),
                    full: Arc::clone(full),
                    display: Arc::clone(display),
                })
            }
            _ => Err(not_found()),
        }
    }

    /// Consistent view of the samples at 1-based offsets `stride, 2*stride,
    /// ...` from the oldest resident frame. Only two integers are read under
    /// the lock; the returned iterator never touches the buffer again.
    pub fn snapshot_samples(&self, stride: usize) -> SampleSnapshot {
        let slots = self.slots.read();
        SampleSnapshot {
            source: self.source.clone(),
            oldest: slots.oldest(),
            resident: slots.len,
            stride: stride.max(1),
            next: 1,
        }
    }

    /// Sequence numbers currently held, oldest first.
    pub fn resident_sequences(&self) -> Vec<u64> {
        let slots = self.slots.read();
        (slots.oldest()..slots.next_sequence).collect()
    }

    pub fn latest(&self) -> Option<HistoryEntry> {
        let sequence = {
            let slots = self.slots.read();
            if slots.len == 0 {
                return None;
            }
            slots.next_sequence - 1
        };
        self.resolve(&Sample {
            source: self.source.clone(),
            sequence,
        })
        .ok()
    }
}

/// One sampled reference and its 1-based offset from the oldest frame at
/// snapshot time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotSample {
    pub offset: usize,
    pub sample: Sample,
}

/// Lazy, finite, restartable (clone it) sequence of samples.
#[derive(Debug, Clone)]
pub struct SampleSnapshot {
    source: SourceId,
    oldest: u64,
    resident: usize,
    stride: usize,
    /// Multiple of `stride` produced next
    next: usize,
}

impl Iterator for SampleSnapshot {
    type Item = SnapshotSample;

    fn next(&mut self) -> Option<SnapshotSample> {
        let offset = self.next * self.stride;
        if offset > self.resident {
            return None;
        }
        self.next += 1;
        Some(SnapshotSample {
            offset,
            sample: Sample {
                source: self.source.clone(),
                sequence: self.oldest + offset as u64 - 1,
            },
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.resident / self.stride + 1).saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for SampleSnapshot {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn frame(width: u32, tag: u8) -> Frame {
        Frame::blank(width, 1).with_sequence(tag as u64)
    }

    fn filled(capacity: usize, count: usize) -> HistoryBuffer {
        let buffer = HistoryBuffer::new(SourceId::new("cam"), capacity);
        for i in 0..count {
            buffer.append(frame(4, i as u8), frame(2, i as u8));
        }
        buffer
    }

    #[test]
    fn evicts_oldest_first() {
        let buffer = filled(5, 12);
        assert_eq!(buffer.len(), 5);
        assert_eq!(buffer.resident_sequences(), vec![7, 8, 9, 10, 11]);
    }

    #[test]
    fn append_assigns_increasing_sequences() {
        let buffer = HistoryBuffer::new(SourceId::new("cam"), 3);
        let seqs: Vec<u64> = (0..7)
            .map(|_| buffer.append(frame(4, 99), frame(2, 99)).sample.sequence)
            .collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(buffer.latest().unwrap().sample.sequence, 6);
    }

    #[test]
    fn resolve_returns_matched_pair() {
        let buffer = filled(4, 6);
        for seq in 2..6 {
            let entry = buffer
                .resolve(&Sample {
                    source: SourceId::new("cam"),
                    sequence: seq,
                })
                .unwrap();
            assert_eq!(entry.full.sequence(), seq);
            assert_eq!(entry.display.sequence(), seq);
            assert_eq!(entry.full.width(), 4);
            assert_eq!(entry.display.width(), 2);
        }
    }

    #[test]
    fn evicted_and_future_samples_are_not_found() {
        let buffer = filled(4, 6);
        for seq in [0, 1, 6, 100] {
            let err = buffer
                .resolve(&Sample {
                    source: SourceId::new("cam"),
                    sequence: seq,
                })
                .unwrap_err();
            assert!(matches!(err, HistoryError::NotFound { .. }));
        }
    }

    #[test]
    fn foreign_sample_is_rejected() {
        let buffer = filled(4, 2);
        let err = buffer
            .resolve(&Sample {
                source: SourceId::new("other"),
                sequence: 1,
            })
            .unwrap_err();
        assert!(matches!(err, HistoryError::WrongSource { .. }));
    }

    #[test]
    fn fewer_than_stride_yields_nothing() {
        let buffer = filled(50, 4);
        assert_eq!(buffer.snapshot_samples(5).count(), 0);
        assert_eq!(HistoryBuffer::new(SourceId::new("x"), 3).snapshot_samples(1).count(), 0);
    }

    #[test]
    fn snapshot_count_is_floor_of_len_over_stride() {
        for (count, stride, expected) in [(37, 5, 7), (35, 5, 7), (50, 5, 10), (9, 3, 3), (80, 7, 7)] {
            let buffer = filled(50, count);
            let snapshot = buffer.snapshot_samples(stride);
            assert_eq!(snapshot.len(), expected);
            assert_eq!(snapshot.count(), expected, "{count} frames, stride {stride}");
        }
    }

    #[test]
    fn snapshot_offsets_count_from_oldest() {
        let buffer = filled(10, 13);
        let samples: Vec<SnapshotSample> = buffer.snapshot_samples(4).collect();
        let offsets: Vec<usize> = samples.iter().map(|s| s.offset).collect();
        let seqs: Vec<u64> = samples.iter().map(|s| s.sample.sequence).collect();
        assert_eq!(offsets, vec![4, 8]);
        // oldest resident is 3
        assert_eq!(seqs, vec![6, 10]);
    }

    #[test]
    fn snapshot_is_restartable_and_detached() {
        let buffer = filled(10, 10);
        let snapshot = buffer.snapshot_samples(5);
        let first: Vec<_> = snapshot.clone().collect();

        buffer.append(frame(4, 0), frame(2, 0));

        let again: Vec<_> = snapshot.collect();
        assert_eq!(first, again);
        // The first sample (sequence 4) is still resident; sequence 0 was evicted.
        assert!(buffer.resolve(&first[0].sample).is_ok());
    }

    #[test]
    fn concurrent_readers_never_see_torn_pairs() {
        let buffer = Arc::new(HistoryBuffer::new(SourceId::new("cam"), 8));
        let writer = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                for i in 0..2000u32 {
                    buffer.append(frame(4, i as u8), frame(2, i as u8));
                }
            })
        };

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let buffer = Arc::clone(&buffer);
                thread::spawn(move || {
                    for _ in 0..2000 {
                        for s in buffer.snapshot_samples(1) {
                            if let Ok(entry) = buffer.resolve(&s.sample) {
                                assert_eq!(entry.full.sequence(), entry.display.sequence());
                                assert_eq!(entry.full.sequence(), s.sample.sequence);
                            }
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(buffer.len(), 8);
    }
}
