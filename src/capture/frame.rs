use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Stable identifier of one video source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(Arc<str>);

impl SourceId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Pixel formats a source may hand us
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Mjpeg,
}

/// Image exactly as a `FrameSource` produced it, before normalisation.
#[derive(Debug, Clone)]
pub struct RawImage {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>,
}

/// Frame data with zero-copy semantics
///
/// Frames are immutable once built; history, preview and annotation code
/// share them through `Arc<Frame>`.
#[derive(Clone)]
pub struct Frame {
    /// RGB24 pixels, row-major, no padding
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

impl Frame {
    /// Wrap RGB24 pixels. `data` must hold `width * height * 3` bytes.
    pub fn rgb(
        data: Bytes,
        width: u32,
        height: u32,
        sequence: u64,
        device_timestamp: Option<Duration>,
        timestamp: Instant,
    ) -> Self {
        debug_assert_eq!(data.len(), (width * height * 3) as usize);
        Self {
            data,
            meta: Arc::new(FrameMetadata {
                sequence,
                width,
                height,
                stride: width * 3,
                device_timestamp,
            }),
            timestamp,
        }
    }

    /// Solid black frame used while a source is paused.
    pub fn blank(width: u32, height: u32) -> Self {
        let data = Bytes::from(vec![0u8; (width * height * 3) as usize]);
        Self::rgb(data, width, height, 0, None, Instant::now())
    }

    /// Same pixels, restamped with `sequence`.
    pub fn with_sequence(self, sequence: u64) -> Self {
        let meta = FrameMetadata {
            sequence,
            ..(*self.meta).clone()
        };
        Self {
            data: self.data,
            meta: Arc::new(meta),
            timestamp: self.timestamp,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    pub fn width(&self) -> u32 {
        self.meta.width
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.meta.sequence)
            .field("width", &self.meta.width)
            .field("height", &self.meta.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}
