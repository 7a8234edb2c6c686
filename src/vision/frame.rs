use chrono::{DateTime, Utc};
use image::{DynamicImage, GrayImage};
use serde::{Deserialize, Serialize};

use crate::error::{TensiometerError, TensiometerResult};

/// A captured camera frame. Immutable once published; the acquisition loop
/// replaces the shared `Arc<Frame>` rather than mutating it.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonic capture counter, used to detect dropped frames.
    pub seq: u64,
    pub captured_at: DateTime<Utc>,
    pub image: DynamicImage,
}

impl Frame {
    pub fn new(seq: u64, image: DynamicImage) -> Self {
        Self {
            seq,
            captured_at: Utc::now(),
            image,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn channels(&self) -> u8 {
        self.image.color().channel_count()
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// Grayscale copy for analysis. Fails on an unallocated frame.
    pub fn to_gray(&self) -> TensiometerResult<GrayImage> {
        if self.is_empty() {
            return Err(TensiometerError::InvalidFrame(format!(
                "frame {} is {}x{}",
                self.seq,
                self.width(),
                self.height()
            )));
        }
        Ok(self.image.to_luma8())
    }
}

/// Axis-aligned box in frame pixel coordinates (y grows downwards).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn center_x(&self) -> f64 {
        self.x as f64 + self.width as f64 / 2.0
    }

    pub fn center_y(&self) -> f64 {
        self.y as f64 + self.height as f64 / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, RgbImage};

    #[test]
    fn empty_frame_is_rejected() {
        let frame = Frame::new(7, DynamicImage::ImageLuma8(GrayImage::new(0, 0)));
        assert!(matches!(
            frame.to_gray(),
            Err(TensiometerError::InvalidFrame(_))
        ));
    }

    #[test]
    fn color_frames_convert_to_single_channel() {
        let frame = Frame::new(1, DynamicImage::ImageRgb8(RgbImage::new(4, 3)));
        assert_eq!(frame.channels(), 3);

        let gray = frame.to_gray().unwrap();
        assert_eq!(gray.dimensions(), (4, 3));
    }
}
