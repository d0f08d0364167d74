// Shared frame vocabulary. Frames travel through the crate as `image` buffers:
// colour frames are `RgbImage` (3 channels, 8 bit) and single-channel masks and
// accumulations are `GrayImage`.

use crate::error::{HeatmapError, Result};
use image::{GenericImageView, RgbImage};
use std::fmt;

/// Width and height of a frame, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDims {
    pub width: u32,
    pub height: u32,
}

impl FrameDims {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn of<I: GenericImageView>(image: &I) -> Self {
        let (width, height) = image.dimensions();
        Self { width, height }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Size of a packed RGB24 frame of these dimensions.
    pub fn rgb_len(&self) -> usize {
        self.pixel_count() * 3
    }

    /// Fails with `FrameShape` unless `image` has exactly these dimensions.
    pub fn check<I: GenericImageView>(&self, image: &I) -> Result<()> {
        let actual = Self::of(image);
        if actual == *self {
            Ok(())
        } else {
            Err(HeatmapError::FrameShape {
                expected: (self.width, self.height),
                actual: (actual.width, actual.height),
            })
        }
    }
}

impl fmt::Display for FrameDims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Wraps a packed RGB24 buffer, as produced by a decoder, into an image.
pub fn rgb_from_raw(dims: FrameDims, data: Vec<u8>) -> Result<RgbImage> {
    let len = data.len();
    RgbImage::from_raw(dims.width, dims.height, data).ok_or_else(|| {
        HeatmapError::Encoder(format!(
            "buffer of {len} bytes does not hold a {dims} RGB frame"
        ))
    })
}
