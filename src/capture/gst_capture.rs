//! GStreamer-backed source for any URI `uridecodebin` understands (RTSP,
//! HTTP, files)

use std::time::Duration;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, info};

use super::decoder;
use super::frame::{PixelFormat, RawImage, SourceId};
use super::source::{FrameSource, FrameStream, ReadOutcome, SourceError};

/// Opens one decode pipeline per connection attempt
pub struct GstSource {
    read_timeout: Duration,
}

impl GstSource {
    pub fn new(read_timeout: Duration) -> Self {
        Self { read_timeout }
    }

    /// Build pipeline string: decode anything, hand RGB to the appsink
    fn build_pipeline_string(uri: &str) -> String {
        format!(
            "uridecodebin uri=\"{}\" ! \
             queue max-size-buffers=2 leaky=downstream ! \
             videoconvert ! \
             video/x-raw,format=RGB ! \
             appsink name=appsink",
            uri
        )
    }
}

impl FrameSource for GstSource {
    type Stream = GstStream;

    fn open(&mut self, id: &SourceId, uri: &str) -> Result<GstStream, SourceError> {
        let open_err = |reason: String| SourceError::Open {
            id: id.clone(),
            reason,
        };

        gst::init().map_err(|e| open_err(format!("failed to initialize GStreamer: {}", e)))?;

        let pipeline_str = Self::build_pipeline_string(uri);
        debug!(source = %id, "pipeline: {}", pipeline_str);

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| open_err(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| open_err("failed to create pipeline".into()))?;

        let appsink = pipeline
            .by_name("appsink")
            .ok_or_else(|| open_err("failed to find appsink element".into()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| open_err("failed to cast to AppSink".into()))?;

        appsink.set_property("emit-signals", false);
        appsink.set_property("max-buffers", 3u32);
        appsink.set_property("drop", true); // Drop old buffers if we can't keep up
        appsink.set_property("sync", false); // Don't sync to clock for lowest latency

        if let Err(e) = pipeline.set_state(gst::State::Playing) {
            let _ = pipeline.set_state(gst::State::Null);
            return Err(open_err(format!("failed to start pipeline: {:?}", e)));
        }

        let timeout = gst::ClockTime::from_mseconds(self.read_timeout.as_millis() as u64);
        let (state_change, _, _) = pipeline.state(Some(timeout));
        if state_change.is_err() {
            let _ = pipeline.set_state(gst::State::Null);
            return Err(open_err("pipeline refused to start".into()));
        }

        info!(source = %id, "GStreamer pipeline playing");
        Ok(GstStream {
            id: id.clone(),
            pipeline,
            appsink,
            timeout,
        })
    }
}

pub struct GstStream {
    id: SourceId,
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    timeout: gst::ClockTime,
}

impl GstStream {
    fn read_err(&self, reason: impl Into<String>) -> SourceError {
        SourceError::Read {
            id: self.id.clone(),
            reason: reason.into(),
        }
    }

    fn pending_error(&self) -> Option<String> {
        let bus = self.pipeline.bus()?;
        let msg = bus.pop_filtered(&[gst::MessageType::Error])?;
        match msg.view() {
            gst::MessageView::Error(err) => Some(err.error().to_string()),
            _ => None,
        }
    }
}

impl FrameStream for GstStream {
    fn read_frame(&mut self) -> Result<ReadOutcome, SourceError> {
        if let Some(reason) = self.pending_error() {
            return Err(self.read_err(reason));
        }

        let Some(sample) = self.appsink.try_pull_sample(self.timeout) else {
            if self.appsink.is_eos() {
                return Ok(ReadOutcome::EndOfStream);
            }
            return Err(self.read_err("no sample before timeout"));
        };

        let buffer = sample
            .buffer()
            .ok_or_else(|| self.read_err("sample contains no buffer"))?;
        let caps = sample.caps().ok_or_else(|| self.read_err("sample has no caps"))?;
        let video_info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|_| self.read_err("failed to parse video info from caps"))?;
        let map = buffer
            .map_readable()
            .map_err(|_| self.read_err("failed to map buffer"))?;

        // Rows may be padded; repack to tight RGB24. A buffer that does not
        // match its caps is a read failure, which reconnects.
        let width = video_info.width();
        let height = video_info.height();
        let stride = video_info
            .stride()
            .first()
            .and_then(|&s| usize::try_from(s).ok())
            .unwrap_or(0);
        let data = decoder::pack_rows(map.as_slice(), width, height, stride).ok_or_else(|| {
            self.read_err(format!(
                "short buffer: {} bytes for {}x{} with stride {}",
                map.as_slice().len(),
                width,
                height,
                stride
            ))
        })?;

        Ok(ReadOutcome::Frame(RawImage {
            data,
            width,
            height,
            format: PixelFormat::Rgb24,
            device_timestamp: buffer.pts().map(|pts| pts.into()),
        }))
    }

    fn close(&mut self) {
        info!(source = %self.id, "stopping GStreamer pipeline");
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_quotes_the_uri() {
        let s = GstSource::build_pipeline_string("rtsp://user:pw@10.0.0.5:554/Streaming/channels/102");
        assert!(s.starts_with("uridecodebin uri=\"rtsp://user:pw@10.0.0.5:554/Streaming/channels/102\""));
        assert!(s.ends_with("appsink name=appsink"));
    }
}
