// THEORY:
// Every fallible operation in the crate reports through `HeatmapError`. The
// read and write stages return these values to whoever holds the `RunHandle`,
// so failures are data the caller can inspect, not only a line in the log.

use std::path::PathBuf;

/// Possible errors
#[derive(Debug, thiserror::Error)]
pub enum HeatmapError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("could not decode \"{}\": {reason}", path.display())]
    InputDecode { path: PathBuf, reason: String },
    #[error("no input file loaded")]
    NoInput,
    #[error("frame is {actual:?} but the model expects {expected:?}")]
    FrameShape {
        expected: (u32, u32),
        actual: (u32, u32),
    },
    #[error("a heatmap run is already in progress")]
    AlreadyRunning,
    #[error("frame queue was abandoned by the writer")]
    QueueAbandoned,
    #[error("reader stopped before it produced a reference frame")]
    ProducerAborted,
    #[error("ffmpeg exited with {status}: {stderr}")]
    Ffmpeg { status: String, stderr: String },
    #[error("unexpected ffprobe output: {0}")]
    UnexpectedProbeOutput(String),
    #[error("encoder error: {0}")]
    Encoder(String),
    #[error("stage panicked: {0}")]
    StagePanicked(String),
    #[cfg(feature = "opencv")]
    #[error("OpenCV error: {0}")]
    OpenCv(#[from] opencv::Error),
}

pub type Result<T> = std::result::Result<T, HeatmapError>;
