//! The boundary between capture workers and whatever actually produces frames

use thiserror::Error;

use super::frame::{RawImage, SourceId};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to open source {id}: {reason}")]
    Open { id: SourceId, reason: String },

    #[error("failed to read from source {id}: {reason}")]
    Read { id: SourceId, reason: String },

    #[error("failed to decode frame: {0}")]
    Decode(String),
}

/// Result of a single read.
#[derive(Debug)]
pub enum ReadOutcome {
    Frame(RawImage),
    EndOfStream,
}

/// Opens streams for one source. The worker that owns the source is the only
/// caller, so implementations need `Send` but not `Sync`.
pub trait FrameSource: Send + 'static {
    type Stream: FrameStream;

    /// `uri` is opaque to the core; only the implementation interprets it.
    fn open(&mut self, id: &SourceId, uri: &str) -> Result<Self::Stream, SourceError>;
}

/// An open stream. Reads block for at most the implementation's transport
/// timeout.
pub trait FrameStream: Send {
    fn read_frame(&mut self) -> Result<ReadOutcome, SourceError>;

    /// Release transport resources. Called exactly once before the stream is
    /// dropped.
    fn close(&mut self);
}
