// THEORY:
// A `FrameSource` is a decodable video stream seen as a sequence of RGB frames
// with a read cursor. The pipeline needs three things from it: the total frame
// count (fixed when the stream is opened), sequential reads (cheap, used when
// every frame is processed) and explicit seeks (used when frames are skipped).
//
// Implementations own their decoder handle and release it on drop, which is how
// the pipeline guarantees that loading a new file never leaves the previous
// handle dangling.

use crate::backends::MediaBackend;
use crate::core_modules::frame::FrameDims;
use crate::error::{HeatmapError, Result};
use image::{ImageError, RgbImage};
use std::path::Path;

/// A seekable stream of decoded frames.
pub trait FrameSource: Send {
    /// Total number of decodable frames, as reported when the stream opened.
    fn frame_count(&self) -> usize;
    fn dims(&self) -> FrameDims;
    /// Index of the frame the next `read` returns.
    fn position(&self) -> usize;
    /// Decodes the frame at the cursor and advances it. `None` at end of stream.
    fn read(&mut self) -> Result<Option<RgbImage>>;
    /// Moves the cursor so the next `read` returns frame `index`.
    fn seek(&mut self, index: usize) -> Result<()>;
}

/// Frames held in memory.
pub struct MemorySource {
    frames: Vec<RgbImage>,
    dims: FrameDims,
    position: usize,
}

impl MemorySource {
    /// All frames must share the dimensions of the first one.
    pub fn new(frames: Vec<RgbImage>) -> Result<Self> {
        let dims = frames
            .first()
            .map(FrameDims::of)
            .unwrap_or(FrameDims::new(0, 0));
        for frame in &frames {
            dims.check(frame)?;
        }
        Ok(Self {
            frames,
            dims,
            position: 0,
        })
    }
}

impl FrameSource for MemorySource {
    fn frame_count(&self) -> usize {
        self.frames.len()
    }

    fn dims(&self) -> FrameDims {
        self.dims
    }

    fn position(&self) -> usize {
        self.position
    }

    fn read(&mut self) -> Result<Option<RgbImage>> {
        let frame = self.frames.get(self.position).cloned();
        if frame.is_some() {
            self.position += 1;
        }
        Ok(frame)
    }

    fn seek(&mut self, index: usize) -> Result<()> {
        self.position = index.min(self.frames.len());
        Ok(())
    }
}

/// Decodes a standalone reference image.
///
/// Anything the `image` crate does not recognise is handed to the backend's
/// video decoder and its first frame is used, so a short clip works as a
/// reference too.
pub fn load_still(backend: &dyn MediaBackend, path: &Path) -> Result<RgbImage> {
    match image::open(path) {
        Ok(image) => Ok(image.to_rgb8()),
        Err(ImageError::Unsupported(_)) | Err(ImageError::Decoding(_)) => {
            let mut source = backend.open_source(path)?;
            source.read()?.ok_or_else(|| HeatmapError::InputDecode {
                path: path.to_path_buf(),
                reason: "stream contains no frames".into(),
            })
        }
        Err(e) => Err(e.into()),
    }
}
