//! Click mapping, marker drawing and committing annotated frames

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use image::{Rgb, RgbImage};
use tracing::{debug, info, instrument, warn};

use super::sink::{AnnotationKey, PersistenceSink};
use super::ReviewError;
use crate::capture::decoder;
use crate::pipeline::history::{HistoryBuffer, HistoryEntry, Sample};
use crate::{AnnotationConfig, OutputFormat};

/// Category an operator files a frame under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    A,
    S,
    D,
    F,
}

impl Tag {
    pub const ALL: [Tag; 4] = [Tag::A, Tag::S, Tag::D, Tag::F];

    pub fn as_str(self) -> &'static str {
        match self {
            Tag::A => "a",
            Tag::S => "s",
            Tag::D => "d",
            Tag::F => "f",
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tag {
    type Err = ReviewError;

    fn from_str(s: &str) -> Result<Self, ReviewError> {
        Tag::ALL
            .into_iter()
            .find(|tag| tag.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ReviewError::InvalidTag(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Linear map between display and full resolution of one frame pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleMap {
    sx: f64,
    sy: f64,
}

impl ScaleMap {
    pub fn new(full: (u32, u32), display: (u32, u32)) -> Self {
        Self {
            sx: full.0 as f64 / display.0 as f64,
            sy: full.1 as f64 / display.1 as f64,
        }
    }

    pub fn to_full(&self, p: Point) -> Point {
        Point::new(p.x * self.sx, p.y * self.sy)
    }

    pub fn to_display(&self, p: Point) -> Point {
        Point::new(p.x / self.sx, p.y / self.sy)
    }
}

/// A committed mark. Built once, never changed.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub sample: Sample,
    pub sample_index: usize,
    pub display_point: Point,
    pub full_point: Point,
    pub tag: Tag,
    pub radius: u32,
}

/// Draws an open circle of the given line width, clipped to the image.
pub fn draw_marker(image: &mut RgbImage, center: Point, radius: u32, width: u32, color: Rgb<u8>) {
    let r = radius as f64;
    let half = (width.max(1) as f64) / 2.0;
    let reach = (r + half).ceil() as i64;
    let (cx, cy) = (center.x.round() as i64, center.y.round() as i64);
    let (w, h) = (image.width() as i64, image.height() as i64);

    for y in (cy - reach).max(0)..=(cy + reach).min(h - 1) {
        for x in (cx - reach).max(0)..=(cx + reach).min(w - 1) {
            let d = (((x - cx).pow(2) + (y - cy).pow(2)) as f64).sqrt();
            if (d - r).abs() <= half {
                image.put_pixel(x as u32, y as u32, color);
            }
        }
    }
}

pub struct AnnotationCommitter {
    sink: Arc<dyn PersistenceSink>,
    config: AnnotationConfig,
}

impl AnnotationCommitter {
    pub fn new(sink: Arc<dyn PersistenceSink>, config: AnnotationConfig) -> Self {
        Self { sink, config }
    }

    pub fn format(&self) -> OutputFormat {
        self.config.format
    }

    /// Maps a display-space click on `entry` to full resolution, using the
    /// dimensions of the stored pair. Clicks outside the display frame are
    /// rejected, not clamped.
    pub fn map_click(entry: &HistoryEntry, click: Point) -> Result<Point, ReviewError> {
        let display = (entry.display.width(), entry.display.height());
        if click.x < 0.0
            || click.y < 0.0
            || click.x >= display.0 as f64
            || click.y >= display.1 as f64
        {
            return Err(ReviewError::ClickOutOfBounds {
                x: click.x,
                y: click.y,
                width: display.0,
                height: display.1,
            });
        }
        let full = (entry.full.width(), entry.full.height());
        Ok(ScaleMap::new(full, display).to_full(click))
    }

    /// Marks `click` (display coordinates) on a private full-resolution copy
    /// of `sample` and hands it to the sink. Nothing is written unless every
    /// check passes first.
    #[instrument(skip(self, history), fields(source = %sample.source, sequence = sample.sequence))]
    pub fn commit(
        &self,
        history: &HistoryBuffer,
        sample: &Sample,
        sample_index: usize,
        click: Point,
        tag: &str,
    ) -> Result<PathBuf, ReviewError> {
        let result = self.try_commit(history, sample, sample_index, click, tag);
        let label = sample.source.to_string();
        match &result {
            Ok(path) => {
                metrics::counter!("annotations_committed", "source" => label).increment(1);
                info!(path = %path.display(), "annotation saved");
            }
            Err(e) => {
                metrics::counter!("annotation_failures", "source" => label).increment(1);
                warn!("annotation not saved: {}", e);
            }
        }
        result
    }

    fn try_commit(
        &self,
        history: &HistoryBuffer,
        sample: &Sample,
        sample_index: usize,
        click: Point,
        tag: &str,
    ) -> Result<PathBuf, ReviewError> {
        let tag: Tag = tag.parse()?;

        let entry = history.resolve(sample)?;
        let full_point = Self::map_click(&entry, click)?;

        // The stored frame stays untouched; we draw on a copy
        let mut marked = decoder::to_image(&entry.full).ok_or_else(|| ReviewError::CorruptFrame {
            source_id: sample.source.clone(),
            sequence: sample.sequence,
        })?;
        drop(entry);
        draw_marker(
            &mut marked,
            full_point,
            self.config.marker_radius,
            self.config.marker_width,
            Rgb(self.config.marker_color),
        );

        let annotation = Annotation {
            sample: sample.clone(),
            sample_index,
            display_point: click,
            full_point,
            tag,
            radius: self.config.marker_radius,
        };
        let key = AnnotationKey {
            source: annotation.sample.source.clone(),
            sample_index: annotation.sample_index,
            tag: annotation.tag,
        };
        debug!(?annotation, "marker drawn");

        Ok(self
            .sink
            .save(&key, &marked, self.config.format, self.config.jpeg_quality)?)
    }
}
