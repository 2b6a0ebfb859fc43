//! Camera frame downsampling and compression

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{ExtendedColorType, RgbImage};

use crate::devices::VideoFrame;
use crate::voice::codec;
use crate::{Error, Result};

/// Downscales camera frames and compresses them to base64 JPEG
#[derive(Debug, Clone, Copy)]
pub struct FrameEncoder {
    width: u32,
    quality: u8,
}

impl FrameEncoder {
    /// Create an encoder producing frames `width` pixels wide
    #[must_use]
    pub fn new(width: u32, quality: u8) -> Self {
        Self {
            width: width.max(1),
            quality: quality.clamp(1, 100),
        }
    }

    /// Target width in pixels
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Compress a frame to JPEG bytes, preserving aspect ratio
    ///
    /// Frames narrower than the target are not upscaled.
    ///
    /// # Errors
    ///
    /// Returns `Error::Video` if the pixel buffer does not match its dimensions
    pub fn encode_jpeg(&self, frame: &VideoFrame) -> Result<Vec<u8>> {
        let image = RgbImage::from_raw(frame.width, frame.height, frame.rgb.clone()).ok_or_else(|| {
            Error::Video(format!(
                "frame buffer of {} bytes does not fit {}x{}",
                frame.rgb.len(),
                frame.width,
                frame.height
            ))
        })?;

        let image = if frame.width > self.width {
            let (width, height) = scaled_size(frame.width, frame.height, self.width);
            imageops::resize(&image, width, height, FilterType::Triangle)
        } else {
            image
        };

        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, self.quality).encode(
            image.as_raw(),
            image.width(),
            image.height(),
            ExtendedColorType::Rgb8,
        )?;
        tracing::trace!(bytes = jpeg.len(), width = image.width(), "frame compressed");
        Ok(jpeg)
    }

    /// Compress a frame and encode it for the wire
    ///
    /// # Errors
    ///
    /// Returns error if compression fails
    pub fn encode(&self, frame: &VideoFrame) -> Result<String> {
        Ok(codec::encode(&self.encode_jpeg(frame)?))
    }
}

/// Target size for `target_width`, keeping the source aspect ratio
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn scaled_size(width: u32, height: u32, target_width: u32) -> (u32, u32) {
    let scale = f64::from(target_width) / f64::from(width);
    let target_height = (f64::from(height) * scale).round() as u32;
    (target_width, target_height.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(width: u32, height: u32) -> VideoFrame {
        VideoFrame {
            width,
            height,
            rgb: vec![128; (width * height * 3) as usize],
        }
    }

    #[test]
    fn keeps_aspect_ratio() {
        assert_eq!(scaled_size(640, 480, 320), (320, 240));
        assert_eq!(scaled_size(1280, 720, 320), (320, 180));
    }

    #[test]
    fn encodes_downscaled_jpeg() {
        let encoder = FrameEncoder::new(320, 50);
        let jpeg = encoder.encode_jpeg(&frame(640, 480)).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (320, 240));
    }

    #[test]
    fn small_frames_are_not_upscaled() {
        let encoder = FrameEncoder::new(320, 50);
        let jpeg = encoder.encode_jpeg(&frame(160, 120)).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(decoded.width(), 160);
    }

    #[test]
    fn rejects_short_buffers() {
        let bad = VideoFrame {
            width: 10,
            height: 10,
            rgb: vec![0; 5],
        };
        assert!(matches!(FrameEncoder::new(320, 50).encode(&bad), Err(Error::Video(_))));
    }
}
