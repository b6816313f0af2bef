pub mod backoff;
pub mod decoder;
pub mod frame;
pub mod pattern;
pub mod source;
pub mod state;
pub mod worker;

#[cfg(feature = "gstreamer-source")]
pub mod gst_capture;

pub use backoff::{Backoff, BackoffConfig};
pub use frame::{Frame, FrameMetadata, PixelFormat, RawImage, SourceId};
pub use pattern::PatternSource;
pub use source::{FrameSource, FrameStream, ReadOutcome, SourceError};
pub use state::{SourceState, SourceStatus};
pub use worker::CaptureWorker;

#[cfg(feature = "gstreamer-source")]
pub use gst_capture::GstSource;
