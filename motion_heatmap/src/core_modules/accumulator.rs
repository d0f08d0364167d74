// THEORY:
// The `Accumulator` is the memory of the heatmap. Where the segmenter answers
// "what is moving right now", the accumulator answers "where has motion happened
// over the whole run". It owns a single-channel image the size of the reference
// frame and adds a fixed contribution to every pixel that was foreground in each
// processed step.
//
// Key architectural principles:
// 1.  **Monotonic, Saturating Growth**: Contributions are non-negative and added
//     with saturation. A pixel can only get hotter within a run and it stops at
//     255 instead of wrapping back to cold.
// 2.  **Shadow-Aware Binarisation**: Only mask values strictly above
//     `SHADOW_VALUE` count as motion, so shadow labels never heat the map.
// 3.  **Pure Rendering**: `colorize` and `overlay` read the accumulation without
//     touching it, so previews can be rendered at any time and any number of
//     times without disturbing the run.

use crate::core_modules::colormap::colormap;
use crate::core_modules::frame::FrameDims;
use crate::core_modules::morphology::morphology;
use crate::core_modules::motion_segmenter::SHADOW_VALUE;
use crate::error::Result;
use crate::settings::ColorMap;
use image::{GrayImage, RgbImage};

/// Mask values above this count as motion.
pub const MOTION_THRESHOLD: u8 = SHADOW_VALUE;
/// Weight of the camera frame in a composite.
pub const FRAME_WEIGHT: f32 = 0.7;
/// Weight of the colorized heat in a composite. Together with `FRAME_WEIGHT`
/// this deliberately exceeds 1 and brightens the result.
pub const HEAT_WEIGHT: f32 = 0.7;
/// Erosion passes applied to the accumulation before the final overlay.
pub const OVERLAY_ERODE_ITERATIONS: u32 = 1;

/// Running per-pixel motion intensity for one run.
pub struct Accumulator {
    image: GrayImage,
    steps: u64,
}

impl Accumulator {
    pub fn new(dims: FrameDims) -> Self {
        Self {
            image: GrayImage::new(dims.width, dims.height),
            steps: 0,
        }
    }

    pub fn dims(&self) -> FrameDims {
        FrameDims::of(&self.image)
    }

    /// Number of masks folded in since the last reset.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// The raw accumulation, for diagnostics.
    pub fn accumulated(&self) -> &GrayImage {
        &self.image
    }

    pub fn reset(&mut self) {
        self.image.pixels_mut().for_each(|p| p.0[0] = 0);
        self.steps = 0;
    }

    /// Adds `intensity` to every pixel whose mask value is above
    /// `MOTION_THRESHOLD`.
    pub fn add_step(&mut self, mask: &GrayImage, intensity: u8) -> Result<()> {
        self.dims().check(mask)?;
        for (acc, m) in self.image.pixels_mut().zip(mask.pixels()) {
            if m[0] > MOTION_THRESHOLD {
                acc.0[0] = acc.0[0].saturating_add(intensity);
            }
        }
        self.steps += 1;
        Ok(())
    }

    /// Renders the accumulation through `map`.
    pub fn colorize(&self, map: ColorMap) -> RgbImage {
        colormap::apply(map, &self.image)
    }

    /// The final still: the accumulation, lightly eroded and colorized, over
    /// `reference`.
    pub fn overlay(&self, reference: &RgbImage, map: ColorMap) -> Result<RgbImage> {
        let eroded = morphology::erode(&self.image, OVERLAY_ERODE_ITERATIONS);
        blend(reference, &colormap::apply(map, &eroded))
    }
}

/// `FRAME_WEIGHT * frame + HEAT_WEIGHT * heat`, rounded and clipped to 255.
pub fn blend(frame: &RgbImage, heat: &RgbImage) -> Result<RgbImage> {
    FrameDims::of(frame).check(heat)?;
    let mut out = frame.clone();
    for (dst, src) in out.iter_mut().zip(heat.iter()) {
        let value = *dst as f32 * FRAME_WEIGHT + *src as f32 * HEAT_WEIGHT;
        *dst = value.round().min(255.0) as u8;
    }
    Ok(out)
}
