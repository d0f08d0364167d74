// THEORY:
// This file is the main entry point for the `motion_heatmap` library crate.
// It defines the public API exposed to front ends such as `heatmap_runner` or a
// GUI shell.
//
// The primary goal is to export `HeatmapPipeline` and the types that flow in
// and out of it (`Settings`, `RunHandle`, `RunReport`, the `StatusSink`
// collaborator and the `MediaBackend` seam) as the high-level interface. The
// per-pixel algorithms live in `core_modules` and stay usable on their own for
// callers that already hold decoded frames.

pub mod backends;
pub mod core_modules;
pub mod error;
pub mod frame_queue;
pub mod frame_source;
pub mod output_sink;
pub mod parallel_pipeline;
pub mod pipeline;
pub mod settings;
pub mod status;

pub use backends::{FfmpegBackend, MediaBackend};
#[cfg(feature = "opencv")]
pub use backends::OpenCvBackend;
pub use core_modules::frame::FrameDims;
pub use error::{HeatmapError, Result};
pub use output_sink::OutputSink;
pub use parallel_pipeline::{CancelToken, ReadSummary, RunHandle, RunReport, WriteSummary};
pub use pipeline::HeatmapPipeline;
pub use settings::{RawSettings, SettingKey, Settings};
pub use status::{StatusLog, StatusSink, TracingStatus};
