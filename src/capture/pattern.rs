//! Synthetic frame source: `pattern://WIDTHxHEIGHT[@FPS][?frames=N]`
//!
//! Produces a moving gradient in BGR order (like most camera stacks) and,
//! when `frames` is given, ends the stream after N frames so the reconnect
//! path gets exercised.

use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::debug;

use super::frame::{PixelFormat, RawImage, SourceId};
use super::source::{FrameSource, FrameStream, ReadOutcome, SourceError};

pub const SCHEME: &str = "pattern://";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternSpec {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub frames: Option<u64>,
}

impl PatternSpec {
    pub fn parse(uri: &str) -> Option<Self> {
        let rest = uri.strip_prefix(SCHEME)?;
        let (body, query) = match rest.split_once('?') {
            Some((body, query)) => (body, Some(query)),
            None => (rest, None),
        };
        let (dims, fps) = match body.split_once('@') {
            Some((dims, fps)) => (dims, fps.parse().ok()?),
            None => (body, 25),
        };
        let (w, h) = dims.split_once('x')?;
        let width: u32 = w.parse().ok()?;
        let height: u32 = h.parse().ok()?;
        if width == 0 || height == 0 || fps == 0 {
            return None;
        }

        let frames = match query {
            Some(q) => Some(q.strip_prefix("frames=")?.parse().ok()?),
            None => None,
        };

        Some(Self {
            width,
            height,
            fps,
            frames,
        })
    }
}

#[derive(Debug, Default)]
pub struct PatternSource;

impl FrameSource for PatternSource {
    type Stream = PatternStream;

    fn open(&mut self, id: &SourceId, uri: &str) -> Result<PatternStream, SourceError> {
        let spec = PatternSpec::parse(uri).ok_or_else(|| SourceError::Open {
            id: id.clone(),
            reason: format!("not a pattern uri: {uri}"),
        })?;
        debug!(source = %id, ?spec, "pattern stream opened");
        Ok(PatternStream {
            spec,
            interval: Duration::from_secs(1) / spec.fps,
            produced: 0,
            next_due: Instant::now(),
        })
    }
}

pub struct PatternStream {
    spec: PatternSpec,
    interval: Duration,
    produced: u64,
    next_due: Instant,
}

impl FrameStream for PatternStream {
    fn read_frame(&mut self) -> Result<ReadOutcome, SourceError> {
        if self.spec.frames.is_some_and(|limit| self.produced >= limit) {
            return Ok(ReadOutcome::EndOfStream);
        }

        let now = Instant::now();
        if self.next_due > now {
            thread::sleep(self.next_due - now);
        }
        self.next_due += self.interval;

        let (w, h) = (self.spec.width, self.spec.height);
        let shift = (self.produced % 256) as u32;
        let mut data = Vec::with_capacity((w * h * 3) as usize);
        for y in 0..h {
            for x in 0..w {
                data.push(((y * 255 / h) & 0xff) as u8); // blue
                data.push(shift as u8); // green
                data.push(((x * 255 / w + shift) & 0xff) as u8); // red
            }
        }
        self.produced += 1;

        Ok(ReadOutcome::Frame(RawImage {
            data: Bytes::from(data),
            width: w,
            height: h,
            format: PixelFormat::Bgr24,
            device_timestamp: Some(self.interval * self.produced as u32),
        }))
    }

    fn close(&mut self) {
        debug!(produced = self.produced, "pattern stream closed");
    }
}
