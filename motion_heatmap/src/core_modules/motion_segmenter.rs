// THEORY:
// The `MotionSegmenter` is the detection layer of the heatmap engine. It is a
// stateful, learning model of what the static scene looks like, kept per pixel,
// and its job is to decide for each new frame which pixels deviate from that
// learned background.
//
// Key architectural principles:
// 1.  **Per-Pixel Statistical Memory**: Every pixel owns a running Gaussian: a mean
//     colour and a single variance shared by the three channels. The model adapts
//     with a learning rate of `1 / min(frames_seen, history_frames)`, so early
//     frames converge quickly and later frames are weighted as a sliding window
//     over the last `history_frames` observations.
// 2.  **Variance-Scaled Decisions**: A pixel is background when its squared colour
//     distance to the mean stays below `variance_threshold * variance`. Noisy
//     pixels learn a larger variance and become harder to trigger; stable pixels
//     become sensitive.
// 3.  **Shadow Awareness**: When enabled, a foreground pixel that is a darker
//     version of the background colour (same chromaticity, brightness ratio in
//     [SHADOW_TAU, 1]) is labelled `SHADOW_VALUE` instead of `FOREGROUND_VALUE`.
//     Downstream thresholding above `SHADOW_VALUE` then treats shadows as noise.
// 4.  **Clean Masks**: Erosion runs on the labelled mask before any thresholding,
//     so isolated noise pixels are gone before they can be accumulated.

use crate::core_modules::frame::FrameDims;
use crate::core_modules::morphology::morphology;
use crate::error::Result;
use crate::settings::Settings;
use image::{GrayImage, Luma, RgbImage};

/// Mask value for a pixel that matches the background.
pub const BACKGROUND_VALUE: u8 = 0;
/// Mask value for a pixel classified as a cast shadow.
pub const SHADOW_VALUE: u8 = 127;
/// Mask value for a moving pixel.
pub const FOREGROUND_VALUE: u8 = 255;

const VARIANCE_INIT: f32 = 15.0;
const VARIANCE_MIN: f32 = 4.0;
const VARIANCE_MAX: f32 = 75.0;
/// Lowest brightness ratio against the background still considered a shadow.
const SHADOW_TAU: f32 = 0.5;

/// Parameters of the background model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmenterParams {
    pub history_frames: u32,
    pub variance_threshold: f32,
    pub detect_shadows: bool,
    pub erode_iterations: u32,
}

impl From<&Settings> for SegmenterParams {
    fn from(settings: &Settings) -> Self {
        Self {
            history_frames: settings.history_frames.max(1),
            variance_threshold: settings.variance_threshold as f32,
            detect_shadows: settings.detect_shadows,
            erode_iterations: settings.erode_iterations,
        }
    }
}

/// A running background model that turns frames into foreground masks.
pub struct MotionSegmenter {
    params: SegmenterParams,
    /// Set by the first frame; every later frame must match.
    dims: Option<FrameDims>,
    /// The learned background colour for every pixel.
    mean: Vec<[f32; 3]>,
    /// The learned variance for every pixel.
    variance: Vec<f32>,
    frames_seen: u32,
}

impl MotionSegmenter {
    pub fn new(params: SegmenterParams) -> Self {
        Self {
            params,
            dims: None,
            mean: Vec::new(),
            variance: Vec::new(),
            frames_seen: 0,
        }
    }

    pub fn frames_seen(&self) -> u32 {
        self.frames_seen
    }

    /// Classifies every pixel of `frame` and folds the frame into the model.
    ///
    /// The first frame only seeds the model and yields an empty mask. A frame
    /// with different dimensions than the first one is rejected.
    pub fn apply(&mut self, frame: &RgbImage) -> Result<GrayImage> {
        let dims = match self.dims {
            Some(dims) => {
                dims.check(frame)?;
                dims
            }
            None => return Ok(self.seed(frame)),
        };

        self.frames_seen = self.frames_seen.saturating_add(1);
        let alpha = 1.0 / self.frames_seen.min(self.params.history_frames) as f32;
        let threshold = self.params.variance_threshold;

        let mut mask = GrayImage::new(dims.width, dims.height);
        let model = self.mean.iter_mut().zip(self.variance.iter_mut());
        for ((pixel, label), (mean, variance)) in frame.pixels().zip(mask.pixels_mut()).zip(model) {
            let sample = [pixel[0] as f32, pixel[1] as f32, pixel[2] as f32];
            let delta = [sample[0] - mean[0], sample[1] - mean[1], sample[2] - mean[2]];
            let dist2 = delta.iter().map(|d| d * d).sum::<f32>();

            label.0[0] = if dist2 < threshold * *variance {
                BACKGROUND_VALUE
            } else if self.params.detect_shadows && is_shadow(&sample, mean, *variance, threshold) {
                SHADOW_VALUE
            } else {
                FOREGROUND_VALUE
            };

            for (m, d) in mean.iter_mut().zip(delta) {
                *m += alpha * d;
            }
            *variance = (*variance + alpha * (dist2 - *variance)).clamp(VARIANCE_MIN, VARIANCE_MAX);
        }

        if self.params.erode_iterations > 0 {
            mask = morphology::erode(&mask, self.params.erode_iterations);
        }
        Ok(mask)
    }

    fn seed(&mut self, frame: &RgbImage) -> GrayImage {
        let dims = FrameDims::of(frame);
        self.mean = frame
            .pixels()
            .map(|p| [p[0] as f32, p[1] as f32, p[2] as f32])
            .collect();
        self.variance = vec![VARIANCE_INIT; dims.pixel_count()];
        self.dims = Some(dims);
        self.frames_seen = 1;
        GrayImage::from_pixel(dims.width, dims.height, Luma([BACKGROUND_VALUE]))
    }
}

/// A shadow is a darker copy of the background: same chromaticity, scaled
/// brightness.
fn is_shadow(sample: &[f32; 3], mean: &[f32; 3], variance: f32, threshold: f32) -> bool {
    let denom: f32 = mean.iter().map(|m| m * m).sum();
    if denom <= f32::EPSILON {
        return false;
    }
    let ratio = sample.iter().zip(mean).map(|(s, m)| s * m).sum::<f32>() / denom;
    if !(SHADOW_TAU..=1.0).contains(&ratio) {
        return false;
    }
    let distortion: f32 = sample
        .iter()
        .zip(mean)
        .map(|(s, m)| (ratio * m - s).powi(2))
        .sum();
    distortion < threshold * variance * ratio * ratio
}
