//! Video I/O through OpenCV's `VideoCapture` and `VideoWriter`.
//!
//! OpenCV hands out BGR frames; everything is converted to RGB on the way in and
//! back to BGR on the way out so the rest of the crate only sees `RgbImage`.

use super::MediaBackend;
use crate::core_modules::frame::{FrameDims, rgb_from_raw};
use crate::error::{HeatmapError, Result};
use crate::frame_source::FrameSource;
use crate::output_sink::VideoEncoder;
use ::opencv::{
    core::{self, Mat, Scalar},
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture, VideoWriter},
};
use image::RgbImage;
use std::path::Path;

#[derive(Debug, Default, Clone, Copy)]
pub struct OpenCvBackend;

fn path_str(path: &Path) -> Result<&str> {
    path.to_str().ok_or_else(|| HeatmapError::InputDecode {
        path: path.to_path_buf(),
        reason: "path is not valid UTF-8".into(),
    })
}

impl MediaBackend for OpenCvBackend {
    fn open_source(&self, path: &Path) -> Result<Box<dyn FrameSource>> {
        let capture = VideoCapture::from_file(path_str(path)?, videoio::CAP_ANY)?;
        if !capture.is_opened()? {
            return Err(HeatmapError::InputDecode {
                path: path.to_path_buf(),
                reason: "VideoCapture could not open the file".into(),
            });
        }
        let dims = FrameDims::new(
            capture.get(videoio::CAP_PROP_FRAME_WIDTH)? as u32,
            capture.get(videoio::CAP_PROP_FRAME_HEIGHT)? as u32,
        );
        let frame_count = capture.get(videoio::CAP_PROP_FRAME_COUNT)?.max(0.0) as usize;
        Ok(Box::new(OpenCvSource {
            capture,
            dims,
            frame_count,
            position: 0,
        }))
    }

    fn open_encoder(&self, path: &Path, dims: FrameDims, fps: u32) -> Result<Box<dyn VideoEncoder>> {
        let fourcc = VideoWriter::fourcc('m', 'p', '4', 'v')?;
        let writer = VideoWriter::new(
            path_str(path)?,
            fourcc,
            fps.max(1) as f64,
            core::Size::new(dims.width as i32, dims.height as i32),
            true,
        )?;
        if !writer.is_opened()? {
            return Err(HeatmapError::Encoder(format!(
                "VideoWriter could not open {}",
                path.display()
            )));
        }
        Ok(Box::new(OpenCvEncoder {
            writer: Some(writer),
            dims,
        }))
    }
}

pub struct OpenCvSource {
    capture: VideoCapture,
    dims: FrameDims,
    frame_count: usize,
    position: usize,
}

impl FrameSource for OpenCvSource {
    fn frame_count(&self) -> usize {
        self.frame_count
    }

    fn dims(&self) -> FrameDims {
        self.dims
    }

    fn position(&self) -> usize {
        self.position
    }

    fn read(&mut self) -> Result<Option<RgbImage>> {
        let mut frame = Mat::default();
        if !self.capture.read(&mut frame)? || frame.empty() {
            return Ok(None);
        }
        let mut rgb = Mat::default();
        imgproc::cvt_color(&frame, &mut rgb, imgproc::COLOR_BGR2RGB, 0)?;
        self.position += 1;
        Ok(Some(rgb_from_raw(self.dims, rgb.data_bytes()?.to_vec())?))
    }

    fn seek(&mut self, index: usize) -> Result<()> {
        self.capture.set(videoio::CAP_PROP_POS_FRAMES, index as f64)?;
        self.position = index;
        Ok(())
    }
}

impl Drop for OpenCvSource {
    fn drop(&mut self) {
        let _ = self.capture.release();
    }
}

pub struct OpenCvEncoder {
    writer: Option<VideoWriter>,
    dims: FrameDims,
}

impl VideoEncoder for OpenCvEncoder {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()> {
        self.dims.check(frame)?;
        let Some(writer) = self.writer.as_mut() else {
            return Err(HeatmapError::Encoder("encoder already closed".into()));
        };
        let mut rgb = Mat::new_rows_cols_with_default(
            self.dims.height as i32,
            self.dims.width as i32,
            core::CV_8UC3,
            Scalar::all(0.0),
        )?;
        rgb.data_bytes_mut()?.copy_from_slice(frame.as_raw());
        let mut bgr = Mat::default();
        imgproc::cvt_color(&rgb, &mut bgr, imgproc::COLOR_RGB2BGR, 0)?;
        writer.write(&bgr)?;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.release()?;
        }
        Ok(())
    }
}

impl Drop for OpenCvEncoder {
    fn drop(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.release();
        }
    }
}
