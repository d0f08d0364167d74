// THEORY:
// The `pipeline` module is the top-level API of the heatmap engine. A
// `HeatmapPipeline` is constructed explicitly by the host application and shared
// as an `Arc`; every front-end action ("load file", "set reference", "generate")
// goes through the same instance, so there is exactly one source, one reference
// and one accumulation per pipeline without any global state.
//
// Key architectural principles:
// 1.  **Session State**: The open `FrameSource`, the reference frame and the
//     accumulation live together in a `Session` behind an async mutex. Setup
//     calls take it briefly; a run's read stage holds it for the whole loop.
// 2.  **One Run at a Time**: The `running` flag is claimed by `start_run` and
//     released only when both stages have ended. While it is set, a second run
//     and any call that would swap the session's state underneath the read
//     stage are rejected with `AlreadyRunning`.
// 3.  **Release Before Replace**: Loading a new input drops the previous source,
//     and with it the decoder handle, before the new one is opened.
// 4.  **Cheap Queries**: Frame count and reference size are mirrored into a
//     small synchronous snapshot so a UI can read them while a run holds the
//     session.

use crate::backends::{FfmpegBackend, MediaBackend};
use crate::core_modules::accumulator::Accumulator;
use crate::core_modules::frame::FrameDims;
use crate::error::{HeatmapError, Result};
use crate::frame_queue::FrameQueue;
use crate::frame_source::{FrameSource, load_still};
use crate::output_sink::OutputSink;
use crate::settings::{RawSettings, Settings};
use crate::status::{StatusSink, TracingStatus};
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Everything a run reads from and writes into.
#[derive(Default)]
pub(crate) struct Session {
    pub(crate) source: Option<Box<dyn FrameSource>>,
    pub(crate) input_path: Option<PathBuf>,
    /// Owned copy; never aliases a decoder buffer.
    pub(crate) reference: Option<RgbImage>,
    pub(crate) accumulator: Option<Accumulator>,
}

impl Session {
    /// Stores `image` as the reference and allocates a zeroed accumulation of
    /// the same size.
    pub(crate) fn install_reference(&mut self, image: RgbImage) -> FrameDims {
        let dims = FrameDims::of(&image);
        self.reference = Some(image);
        self.accumulator = Some(Accumulator::new(dims));
        dims
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct SessionInfo {
    frame_count: Option<usize>,
    reference: Option<FrameDims>,
}

pub struct HeatmapPipeline {
    pub(crate) backend: Arc<dyn MediaBackend>,
    pub(crate) status: Arc<dyn StatusSink>,
    pub(crate) output: OutputSink,
    pub(crate) queue: Arc<FrameQueue>,
    pub(crate) session: tokio::sync::Mutex<Session>,
    pub(crate) running: Arc<AtomicBool>,
    settings: Mutex<Settings>,
    info: Mutex<SessionInfo>,
}

impl Default for HeatmapPipeline {
    fn default() -> Self {
        Self::new(Arc::new(FfmpegBackend::new()), Arc::new(TracingStatus))
    }
}

impl HeatmapPipeline {
    pub fn new(backend: Arc<dyn MediaBackend>, status: Arc<dyn StatusSink>) -> Self {
        Self {
            backend,
            status,
            output: OutputSink::default(),
            queue: Arc::new(FrameQueue::default()),
            session: tokio::sync::Mutex::new(Session::default()),
            running: Arc::new(AtomicBool::new(false)),
            settings: Mutex::new(Settings::default()),
            info: Mutex::new(SessionInfo::default()),
        }
    }

    /// Replaces where and how artifacts are written.
    pub fn with_output(mut self, output: OutputSink) -> Self {
        self.output = output;
        self
    }

    /// Replaces the hand-off queue, e.g. to change its capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue = Arc::new(FrameQueue::new(capacity));
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn info(&self) -> MutexGuard<'_, SessionInfo> {
        self.info.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reject_if_running(&self) -> Result<()> {
        if self.is_running() {
            Err(HeatmapError::AlreadyRunning)
        } else {
            Ok(())
        }
    }

    /// Opens `path` as the new input.
    ///
    /// Any previous source is released first, and the reference frame and
    /// accumulation are discarded. On failure the pipeline is left with no
    /// input at all.
    pub async fn load_input(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        self.reject_if_running()?;
        let mut session = self.session.lock().await;
        self.reject_if_running()?;

        *session = Session::default();
        *self.info() = SessionInfo::default();

        let source = match self.backend.open_source(path) {
            Ok(source) => source,
            Err(e) => {
                self.status
                    .log_persistent(&format!("Could not open \"{}\": {e}", path.display()));
                return Err(e);
            }
        };
        let frame_count = source.frame_count();
        session.source = Some(source);
        session.input_path = Some(path.to_path_buf());
        self.info().frame_count = Some(frame_count);

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        self.status
            .log_persistent(&format!("Loaded {name} ({frame_count} frames)"));
        Ok(frame_count)
    }

    /// Sets the image the final heatmap is drawn over.
    ///
    /// With `None` the next frame at the source cursor is used; with a path a
    /// standalone image is decoded. Either way a zeroed accumulation of the
    /// same size is allocated.
    pub async fn set_reference_frame(&self, path: Option<&Path>) -> Result<FrameDims> {
        self.reject_if_running()?;
        let mut session = self.session.lock().await;
        self.reject_if_running()?;

        let image = match path {
            Some(path) => load_still(self.backend.as_ref(), path)?,
            None => next_source_frame(&mut session)?,
        };
        let dims = session.install_reference(image);
        self.info().reference = Some(dims);
        self.status
            .log_persistent(&format!("Reference Frame Loaded ({dims})"));
        Ok(dims)
    }

    /// Parses raw user input and stores the result for the next run.
    pub fn configure(&self, raw: &RawSettings) -> Settings {
        let settings = Settings::from_raw(raw);
        self.apply_settings(settings.clone());
        settings
    }

    pub fn apply_settings(&self, settings: Settings) {
        tracing::debug!("settings updated: {settings}");
        *self.settings.lock().unwrap_or_else(PoisonError::into_inner) = settings;
    }

    pub fn settings(&self) -> Settings {
        self.settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Size of the current reference frame, if one is set.
    pub fn reference_dimensions(&self) -> Option<FrameDims> {
        self.info().reference
    }

    /// Frame count of the loaded input, if any.
    pub fn frame_count(&self) -> Option<usize> {
        self.info().frame_count
    }

    pub(crate) fn has_input(&self) -> bool {
        self.info().frame_count.is_some()
    }

    pub(crate) fn record_reference(&self, dims: FrameDims) {
        self.info().reference = Some(dims);
    }
}

/// Reads one frame at the session's cursor.
pub(crate) fn next_source_frame(session: &mut Session) -> Result<RgbImage> {
    let source = session.source.as_mut().ok_or(HeatmapError::NoInput)?;
    source.read()?.ok_or_else(|| HeatmapError::InputDecode {
        path: session.input_path.clone().unwrap_or_default(),
        reason: "no frame left to use as reference".into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_source::MemorySource;
    use crate::output_sink::VideoEncoder;
    use crate::status::StatusLog;
    use image::Rgb;

    struct StubBackend;

    impl MediaBackend for StubBackend {
        fn open_source(&self, path: &Path) -> Result<Box<dyn FrameSource>> {
            if path.to_string_lossy().contains("broken") {
                return Err(HeatmapError::InputDecode {
                    path: path.to_path_buf(),
                    reason: "stub".into(),
                });
            }
            let frames = (0..4u8)
                .map(|n| RgbImage::from_pixel(6, 4, Rgb([n * 10, 0, 0])))
                .collect();
            Ok(Box::new(MemorySource::new(frames)?))
        }

        fn open_encoder(&self, _: &Path, _: FrameDims, _: u32) -> Result<Box<dyn VideoEncoder>> {
            Err(HeatmapError::Encoder("not used".into()))
        }
    }

    fn pipeline() -> (HeatmapPipeline, Arc<StatusLog>) {
        let log = Arc::new(StatusLog::new());
        (HeatmapPipeline::new(Arc::new(StubBackend), log.clone()), log)
    }

    #[tokio::test]
    async fn load_input_reports_frame_count() {
        let (pipeline, log) = pipeline();
        assert_eq!(pipeline.frame_count(), None);
        assert_eq!(pipeline.load_input("clips/walk.mp4").await.unwrap(), 4);
        assert_eq!(pipeline.frame_count(), Some(4));
        assert_eq!(log.persistent(), vec!["Loaded walk.mp4 (4 frames)".to_string()]);
    }

    #[tokio::test]
    async fn reference_defaults_to_the_next_frame() {
        let (pipeline, log) = pipeline();
        pipeline.load_input("walk.mp4").await.unwrap();
        let dims = pipeline.set_reference_frame(None).await.unwrap();
        assert_eq!(dims, FrameDims::new(6, 4));
        assert_eq!(pipeline.reference_dimensions(), Some(dims));
        assert!(log.persistent().contains(&"Reference Frame Loaded (6x4)".to_string()));

        let session = pipeline.session.lock().await;
        assert_eq!(session.reference.as_ref().unwrap().get_pixel(0, 0), &Rgb([0, 0, 0]));
        assert_eq!(session.accumulator.as_ref().unwrap().steps(), 0);
    }

    #[tokio::test]
    async fn reloading_discards_reference_and_accumulation() {
        let (pipeline, _) = pipeline();
        pipeline.load_input("a.mp4").await.unwrap();
        pipeline.set_reference_frame(None).await.unwrap();
        pipeline.load_input("b.mp4").await.unwrap();

        assert_eq!(pipeline.reference_dimensions(), None);
        let session = pipeline.session.lock().await;
        assert!(session.reference.is_none());
        assert!(session.accumulator.is_none());
        assert_eq!(session.input_path.as_deref(), Some(Path::new("b.mp4")));
    }

    #[tokio::test]
    async fn failed_load_leaves_no_input() {
        let (pipeline, log) = pipeline();
        pipeline.load_input("a.mp4").await.unwrap();
        assert!(pipeline.load_input("broken.mp4").await.is_err());
        assert_eq!(pipeline.frame_count(), None);
        assert!(pipeline.session.lock().await.source.is_none());
        assert!(log.persistent().last().unwrap().starts_with("Could not open"));
    }

    #[tokio::test]
    async fn reference_without_input_is_an_error() {
        let (pipeline, _) = pipeline();
        assert!(matches!(
            pipeline.set_reference_frame(None).await,
            Err(HeatmapError::NoInput)
        ));
    }

    #[tokio::test]
    async fn setup_is_rejected_while_running() {
        let (pipeline, _) = pipeline();
        pipeline.running.store(true, Ordering::Release);
        assert!(matches!(
            pipeline.load_input("a.mp4").await,
            Err(HeatmapError::AlreadyRunning)
        ));
        assert!(matches!(
            pipeline.set_reference_frame(None).await,
            Err(HeatmapError::AlreadyRunning)
        ));
    }

    #[test]
    fn configure_stores_parsed_settings() {
        let (pipeline, _) = pipeline();
        let raw: RawSettings = [("frame_skip", "1"), ("intensity", "abc")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let settings = pipeline.configure(&raw);
        assert_eq!(settings.step_size, 2);
        assert_eq!(settings.intensity, 2);
        assert_eq!(pipeline.settings(), settings);
    }
}
