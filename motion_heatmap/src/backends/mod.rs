// THEORY:
// Media backends turn paths into decoders and encoders. The pipeline only ever
// sees the `FrameSource` and `VideoEncoder` traits, so the detection logic is
// identical whether frames come from an ffmpeg child process, from OpenCV, or
// from memory in a test.

use crate::core_modules::frame::FrameDims;
use crate::error::Result;
use crate::frame_source::FrameSource;
use crate::output_sink::VideoEncoder;
use std::path::Path;

pub mod ffmpeg;
#[cfg(feature = "opencv")]
pub mod opencv_io;

pub use self::ffmpeg::FfmpegBackend;
#[cfg(feature = "opencv")]
pub use self::opencv_io::OpenCvBackend;

/// Opens decoders and encoders for a family of media files.
pub trait MediaBackend: Send + Sync {
    /// Opens `path` for frame-by-frame decoding.
    fn open_source(&self, path: &Path) -> Result<Box<dyn FrameSource>>;
    /// Creates a video file at `path`.
    fn open_encoder(&self, path: &Path, dims: FrameDims, fps: u32) -> Result<Box<dyn VideoEncoder>>;
    /// Extension, without the dot, of the videos this backend writes.
    fn video_extension(&self) -> &'static str {
        "mp4"
    }
}
