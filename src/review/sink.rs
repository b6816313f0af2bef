//! Where annotated frames end up

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, RgbImage};
use thiserror::Error;
use tracing::debug;

use super::annotate::Tag;
use crate::capture::SourceId;
use crate::OutputFormat;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to encode image: {0}")]
    Encode(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("sink rejected {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AnnotationKey {
    pub source: SourceId,
    pub sample_index: usize,
    pub tag: Tag,
}

impl AnnotationKey {
    pub fn file_stem(&self) -> String {
        format!(
            "stream_{}_frame_{}_key_{}",
            self.source, self.sample_index, self.tag
        )
    }
}

pub trait PersistenceSink: Send + Sync {
    /// Encodes and stores `image`, returning where it went.
    fn save(
        &self,
        key: &AnnotationKey,
        image: &RgbImage,
        format: OutputFormat,
        quality: u8,
    ) -> Result<PathBuf, SinkError>;
}

/// Writes one file per annotation into a directory.
#[derive(Debug, Clone)]
pub struct FsSink {
    dir: PathBuf,
}

impl FsSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl PersistenceSink for FsSink {
    fn save(
        &self,
        key: &AnnotationKey,
        image: &RgbImage,
        format: OutputFormat,
        quality: u8,
    ) -> Result<PathBuf, SinkError> {
        fs::create_dir_all(&self.dir)?;

        let path = match format {
            OutputFormat::Jpeg => {
                let path = self.dir.join(format!("{}.jpg", key.file_stem()));
                let writer = BufWriter::new(File::create(&path)?);
                JpegEncoder::new_with_quality(writer, quality.clamp(1, 100)).encode_image(image)?;
                path
            }
            OutputFormat::Png => {
                let path = self.dir.join(format!("{}.png", key.file_stem()));
                image.save_with_format(&path, ImageFormat::Png)?;
                path
            }
        };

        debug!(path = %path.display(), "annotation written");
        Ok(path)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Keeps saved images in memory; can be told to refuse writes.
    #[derive(Default)]
    pub(crate) struct MemorySink {
        pub saved: Mutex<Vec<(AnnotationKey, RgbImage)>>,
        pub fail: bool,
    }

    impl MemorySink {
        pub(crate) fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        pub(crate) fn count(&self) -> usize {
            self.saved.lock().len()
        }
    }

    impl PersistenceSink for MemorySink {
        fn save(
            &self,
            key: &AnnotationKey,
            image: &RgbImage,
            _format: OutputFormat,
            _quality: u8,
        ) -> Result<PathBuf, SinkError> {
            if self.fail {
                return Err(SinkError::Rejected("disk full".into()));
            }
            self.saved.lock().push((key.clone(), image.clone()));
            Ok(PathBuf::from(key.file_stem()))
        }
    }

    fn key() -> AnnotationKey {
        AnnotationKey {
            source: SourceId::new("31"),
            sample_index: 10,
            tag: Tag::S,
        }
    }

    #[test]
    fn file_name_carries_source_index_and_tag() {
        assert_eq!(key().file_stem(), "stream_31_frame_10_key_s");
    }

    #[test]
    fn writes_jpeg_into_directory() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FsSink::new(dir.path().join("nested"));
        let image = RgbImage::from_pixel(32, 16, image::Rgb([0, 128, 255]));

        let path = sink.save(&key(), &image, OutputFormat::Jpeg, 100).unwrap();
        assert_eq!(path.file_name().unwrap(), "stream_31_frame_10_key_s.jpg");

        let reloaded = image::open(&path).unwrap();
        assert_eq!((reloaded.width(), reloaded.height()), (32, 16));
    }

    #[test]
    fn writes_png_losslessly() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FsSink::new(dir.path());
        let image = RgbImage::from_pixel(4, 4, image::Rgb([1, 2, 3]));

        let path = sink.save(&key(), &image, OutputFormat::Png, 100).unwrap();
        assert_eq!(image::open(&path).unwrap().to_rgb8(), image);
    }

    #[test]
    fn unwritable_directory_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();

        let sink = FsSink::new(blocker.join("sub"));
        let err = sink
            .save(&key(), &RgbImage::new(1, 1), OutputFormat::Jpeg, 90)
            .unwrap_err();
        assert!(matches!(err, SinkError::Io(_)));
    }
}
