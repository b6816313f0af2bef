//! Normalises source payloads to RGB24 and derives display-resolution copies

use std::time::{Duration, Instant};

use bytes::Bytes;
use image::imageops::{self, FilterType};
use image::{ImageFormat, RgbImage};

use super::frame::{Frame, PixelFormat, RawImage};
use super::source::SourceError;

pub fn decode_frame(raw: &RawImage) -> Result<RgbImage, SourceError> {
    match raw.format {
        PixelFormat::Mjpeg => {
            let decoded = image::load_from_memory_with_format(&raw.data, ImageFormat::Jpeg)
                .map_err(|e| SourceError::Decode(e.to_string()))?;
            Ok(decoded.to_rgb8())
        }
        PixelFormat::Rgb24 => packed_rgb(raw, false),
        PixelFormat::Bgr24 => packed_rgb(raw, true),
    }
}

fn packed_rgb(raw: &RawImage, swap_red_blue: bool) -> Result<RgbImage, SourceError> {
    let expected = raw.width as usize * raw.height as usize * 3;
    if raw.data.len() != expected {
        return Err(SourceError::Decode(format!(
            "{}x{} frame carries {} bytes, expected {}",
            raw.width,
            raw.height,
            raw.data.len(),
            expected
        )));
    }

    let mut pixels = raw.data.to_vec();
    if swap_red_blue {
        for px in pixels.chunks_exact_mut(3) {
            px.swap(0, 2);
        }
    }

    RgbImage::from_raw(raw.width, raw.height, pixels)
        .ok_or_else(|| SourceError::Decode("pixel buffer does not match dimensions".into()))
}

/// Copies `height` rows of tight RGB24 out of a buffer whose rows are
/// `stride` bytes apart. `None` when the buffer is shorter than the
/// geometry claims or `stride` cannot hold a row.
pub fn pack_rows(data: &[u8], width: u32, height: u32, stride: usize) -> Option<Bytes> {
    let row = width as usize * 3;
    let rows = height as usize;
    if stride < row {
        return None;
    }
    if stride == row {
        return data.get(..row * rows).map(Bytes::copy_from_slice);
    }

    // The last row may omit its padding
    let needed = stride.checked_mul(rows.checked_sub(1)?)? + row;
    let data = data.get(..needed)?;
    let mut packed = Vec::with_capacity(row * rows);
    for line in data.chunks(stride) {
        packed.extend_from_slice(line.get(..row)?);
    }
    Some(Bytes::from(packed))
}

/// Deterministic resize to the configured display target.
pub fn to_display(full: &RgbImage, width: u32, height: u32) -> RgbImage {
    let started = Instant::now();
    let resized = imageops::resize(full, width, height, FilterType::Triangle);
    metrics::histogram!("resize_time_us").record(started.elapsed().as_micros() as f64);
    resized
}

pub fn into_frame(
    image: RgbImage,
    sequence: u64,
    device_timestamp: Option<Duration>,
    timestamp: Instant,
) -> Frame {
    let (width, height) = image.dimensions();
    Frame::rgb(
        Bytes::from(image.into_raw()),
        width,
        height,
        sequence,
        device_timestamp,
        timestamp,
    )
}

/// Private, mutable copy of a frame's pixels.
pub fn to_image(frame: &Frame) -> Option<RgbImage> {
    RgbImage::from_raw(frame.width(), frame.height(), frame.data.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(format: PixelFormat, data: Vec<u8>, width: u32, height: u32) -> RawImage {
        RawImage {
            data: Bytes::from(data),
            width,
            height,
            format,
            device_timestamp: None,
        }
    }

    #[test]
    fn bgr_is_swapped_to_rgb() {
        let img = decode_frame(&raw(PixelFormat::Bgr24, vec![1, 2, 3, 4, 5, 6], 2, 1)).unwrap();
        assert_eq!(img.into_raw(), vec![3, 2, 1, 6, 5, 4]);
    }

    #[test]
    fn short_buffer_is_a_decode_error() {
        let err = decode_frame(&raw(PixelFormat::Rgb24, vec![0; 5], 2, 1)).unwrap_err();
        assert!(matches!(err, SourceError::Decode(_)));
    }

    #[test]
    fn mjpeg_round_trips_through_the_jpeg_codec() {
        let img = RgbImage::from_pixel(16, 8, image::Rgb([200, 10, 10]));
        let mut jpeg = Vec::new();
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, 90)
            .encode_image(&img)
            .unwrap();

        let decoded = decode_frame(&raw(PixelFormat::Mjpeg, jpeg, 0, 0)).unwrap();
        assert_eq!(decoded.dimensions(), (16, 8));
    }

    #[test]
    fn padded_rows_are_repacked() {
        // 2x2 RGB with 2 bytes of padding per row, last row unpadded
        let data = [1, 1, 1, 2, 2, 2, 0, 0, 3, 3, 3, 4, 4, 4];
        let packed = pack_rows(&data, 2, 2, 8).unwrap();
        assert_eq!(&packed[..], &[1, 1, 1, 2, 2, 2, 3, 3, 3, 4, 4, 4]);
        assert_eq!(pack_rows(&data[..12], 2, 2, 6).unwrap().len(), 12);
    }

    #[test]
    fn short_or_inconsistent_buffers_are_refused() {
        // one byte short of two tight rows
        assert!(pack_rows(&[0; 11], 2, 2, 6).is_none());
        // padded layout whose last row is cut off
        assert!(pack_rows(&[0; 13], 2, 2, 8).is_none());
        // stride smaller than a row
        assert!(pack_rows(&[0; 64], 2, 2, 4).is_none());
        assert!(pack_rows(&[], 2, 0, 8).is_none());
    }

    #[test]
    fn display_copy_has_target_dimensions() {
        let full = RgbImage::new(640, 360);
        let display = to_display(&full, 320, 240);
        assert_eq!(display.dimensions(), (320, 240));

        let frame = into_frame(display, 7, None, Instant::now());
        assert_eq!(frame.sequence(), 7);
        assert_eq!(frame.data.len(), 320 * 240 * 3);
        assert_eq!(to_image(&frame).unwrap().dimensions(), (320, 240));
    }
}
