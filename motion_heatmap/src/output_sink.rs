// THEORY:
// The `OutputSink` is where a run's artifacts land on disk. It knows the output
// directory, how files are named and how stills are encoded; video encoding is
// delegated to a `VideoEncoder` opened by the media backend.
//
// Naming: every write stage takes one `YYYYMMDD-HHMMSS` stamp. The video is
// `<stamp>.<ext>`, the overlay still is `<stamp>_<suffix>.jpg` where the suffix
// encodes the detection settings, and the optional raw accumulation dump is
// `<stamp>_<suffix>_acc.jpg`.

use crate::error::Result;
use chrono::{DateTime, Local};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, GrayImage, ImageEncoder, RgbImage};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

pub const DEFAULT_OUTPUT_DIR: &str = "output";
const JPEG_QUALITY: u8 = 95;

/// Sink for encoded video frames.
///
/// Dropping an encoder releases its underlying handle even if `finish` was
/// never called.
pub trait VideoEncoder: Send {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()>;
    /// Flushes and closes the container.
    fn finish(self: Box<Self>) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct OutputSink {
    dir: PathBuf,
    parameter_suffix: bool,
    accumulation_dump: bool,
}

impl Default for OutputSink {
    fn default() -> Self {
        Self::new(DEFAULT_OUTPUT_DIR)
    }
}

impl OutputSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            parameter_suffix: true,
            accumulation_dump: false,
        }
    }

    /// Whether still filenames carry the settings suffix. On by default.
    pub fn with_parameter_suffix(mut self, enabled: bool) -> Self {
        self.parameter_suffix = enabled;
        self
    }

    /// Whether the raw accumulation is written next to the overlay. Off by
    /// default.
    pub fn with_accumulation_dump(mut self, enabled: bool) -> Self {
        self.accumulation_dump = enabled;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn dumps_accumulation(&self) -> bool {
        self.accumulation_dump
    }

    /// Creates the output directory if needed. Safe to call repeatedly.
    pub fn ensure_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    pub fn timestamp(now: DateTime<Local>) -> String {
        now.format("%Y%m%d-%H%M%S").to_string()
    }

    pub fn video_path(&self, stamp: &str, extension: &str) -> PathBuf {
        self.dir.join(format!("{stamp}.{extension}"))
    }

    pub fn image_path(&self, stamp: &str, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}.jpg", self.still_stem(stamp, suffix)))
    }

    pub fn accumulation_path(&self, stamp: &str, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}_acc.jpg", self.still_stem(stamp, suffix)))
    }

    fn still_stem(&self, stamp: &str, suffix: &str) -> String {
        if self.parameter_suffix && !suffix.is_empty() {
            format!("{stamp}_{suffix}")
        } else {
            stamp.to_string()
        }
    }

    /// Writes the final overlay still and returns its path.
    pub fn write_overlay(&self, stamp: &str, suffix: &str, image: &RgbImage) -> Result<PathBuf> {
        let path = self.image_path(stamp, suffix);
        save_jpeg(&path, image.as_raw(), image.width(), image.height(), ExtendedColorType::Rgb8)?;
        Ok(path)
    }

    /// Writes the raw accumulation as a grayscale still.
    pub fn write_accumulation(&self, stamp: &str, suffix: &str, image: &GrayImage) -> Result<PathBuf> {
        let path = self.accumulation_path(stamp, suffix);
        save_jpeg(&path, image.as_raw(), image.width(), image.height(), ExtendedColorType::L8)?;
        Ok(path)
    }
}

fn save_jpeg(path: &Path, buffer: &[u8], width: u32, height: u32, color: ExtendedColorType) -> Result<()> {
    let output = BufWriter::new(File::create(path)?);
    let encoder = JpegEncoder::new_with_quality(output, JPEG_QUALITY);
    encoder.write_image(buffer, width, height, color)?;
    Ok(())
}
