// THEORY:
// A heatmap run is two tokio tasks joined by the `FrameQueue`: the read stage
// decodes, segments, accumulates and composites frames; the write stage encodes
// the composites and finally writes the overlay still. Splitting them lets the
// read side report progress while the (often slower) encoder catches up.
//
// Key architectural principles:
// 1.  **Readiness, Not Timers**: The write stage does not start on a delay. The
//     read stage sends the reference size over a oneshot once the stale queue is
//     cleared and the reference is known; the write stage opens its encoder only
//     after that. If the read stage dies first, the writer sees the dropped
//     sender and bails out with `ProducerAborted` without creating any file.
// 2.  **Results as Data**: Each stage returns a typed summary or a
//     `HeatmapError` through its `JoinHandle`. The status sink gets the same
//     story in prose, but callers and tests assert on the `RunReport`.
// 3.  **Guaranteed Hand-Off**: The read stage calls `finish` on every exit path,
//     panics included. The write stage calls `abandon` on every path that does
//     not end in success, panics included. Both calls live in drop guards, so
//     neither side can be left waiting on the other.
// 4.  **Guaranteed Release**: The encoder is owned by the write stage alone and
//     dropped on every path out of it; the running flag is owned by a guard that
//     both tasks share and that clears it when the last one ends.
// 5.  **Cooperative Cancellation**: `RunHandle::cancel` sets a flag the read
//     loop checks before every frame. A cancelled run still finishes the queue,
//     so the writer encodes what was produced and writes the overlay.

use crate::core_modules::accumulator::{Accumulator, blend};
use crate::core_modules::frame::FrameDims;
use crate::core_modules::motion_segmenter::{MotionSegmenter, SegmenterParams};
use crate::error::{HeatmapError, Result};
use crate::frame_queue::{CompositeFrame, Dequeued, FrameQueue};
use crate::frame_source::FrameSource;
use crate::output_sink::OutputSink;
use crate::pipeline::{HeatmapPipeline, Session, next_source_frame};
use crate::settings::Settings;
use crate::status::ProgressTracker;
use chrono::Local;
use image::RgbImage;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// How long the write stage waits for a composite while the read stage runs.
pub const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(2);

/// Exclusive end of the sampled frame range.
///
/// With a frame bound the range covers `max_frames` steps, otherwise the whole
/// stream; the final frame of the stream is never sampled.
pub fn last_frame(frame_count: usize, max_frames: usize, step: usize) -> usize {
    let end = frame_count.saturating_sub(1);
    if max_frames > 0 {
        end.min(max_frames.saturating_mul(step.max(1)))
    } else {
        end
    }
}

/// Outcome of a read stage.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadSummary {
    /// Frames decoded and pushed to the queue.
    pub frames_read: usize,
    /// Frames the sampling plan called for.
    pub planned: usize,
    pub elapsed: Duration,
    /// Whether the loop stopped because of `RunHandle::cancel`.
    pub cancelled: bool,
}

/// Outcome of a write stage.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteSummary {
    pub frames_written: usize,
    pub video_path: PathBuf,
    pub image_path: PathBuf,
    /// Only set when the accumulation dump is enabled.
    pub accumulation_path: Option<PathBuf>,
    pub elapsed: Duration,
}

/// Both stage outcomes of one run.
#[derive(Debug)]
pub struct RunReport {
    pub read: Result<ReadSummary>,
    pub write: Result<WriteSummary>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.read.is_ok() && self.write.is_ok()
    }
}

/// Clears the pipeline's running flag when the last stage drops it.
struct RunGuard {
    running: Arc<AtomicBool>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Finishes the queue when the read stage ends, however it ends.
struct FinishOnDrop<'a>(&'a FrameQueue);

impl Drop for FinishOnDrop<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            tracing::error!("read stage panicked, finishing the queue");
        }
        self.0.finish();
    }
}

/// Abandons the queue unless the write stage disarms it after succeeding.
struct AbandonOnDrop<'a> {
    queue: &'a FrameQueue,
    armed: bool,
}

impl<'a> AbandonOnDrop<'a> {
    fn new(queue: &'a FrameQueue) -> Self {
        Self { queue, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AbandonOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            if std::thread::panicking() {
                tracing::error!("write stage panicked, abandoning the queue");
            }
            self.queue.abandon();
        }
    }
}

/// Cloneable request to stop a run's read stage.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Handle to an in-flight run.
///
/// Dropping it detaches the run; both stages carry on to completion.
pub struct RunHandle {
    reader: JoinHandle<Result<ReadSummary>>,
    writer: JoinHandle<Result<WriteSummary>>,
    cancel: CancelToken,
}

impl RunHandle {
    /// Asks the read stage to stop before its next frame.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A token that can cancel this run after the handle is consumed by `wait`.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Waits for both stages.
    pub async fn wait(self) -> RunReport {
        let read = flatten(self.reader.await);
        let write = flatten(self.writer.await);
        RunReport { read, write }
    }
}

fn flatten<T>(joined: std::result::Result<Result<T>, tokio::task::JoinError>) -> Result<T> {
    joined.unwrap_or_else(|e| Err(HeatmapError::StagePanicked(e.to_string())))
}

impl HeatmapPipeline {
    /// Launches the read and write stages of a run.
    ///
    /// Must be called from within a tokio runtime. The settings in effect at
    /// this call are used for the whole run. Fails with `AlreadyRunning` if a
    /// previous run has not ended and with `NoInput` if nothing is loaded.
    pub fn start_run(self: &Arc<Self>) -> Result<RunHandle> {
        if !self.has_input() {
            return Err(HeatmapError::NoInput);
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(HeatmapError::AlreadyRunning);
        }
        let guard = Arc::new(RunGuard {
            running: self.running.clone(),
        });
        let settings = self.settings();
        self.status
            .log_persistent(&format!("Generating heatmap: {settings}"));

        let cancel = CancelToken::default();
        let (ready_tx, ready_rx) = oneshot::channel();

        let reader = tokio::spawn({
            let pipeline = self.clone();
            let guard = guard.clone();
            let settings = settings.clone();
            let cancel = cancel.clone();
            async move {
                let _guard = guard;
                pipeline.read_stage(&settings, &cancel, ready_tx).await
            }
        });
        let writer = tokio::spawn({
            let pipeline = self.clone();
            async move {
                let _guard = guard;
                pipeline.write_stage(&settings, ready_rx).await
            }
        });

        Ok(RunHandle {
            reader,
            writer,
            cancel,
        })
    }

    async fn read_stage(
        &self,
        settings: &Settings,
        cancel: &CancelToken,
        ready: oneshot::Sender<FrameDims>,
    ) -> Result<ReadSummary> {
        let result = {
            let _finish = FinishOnDrop(&self.queue);
            let mut session = self.session.lock().await;
            self.read_frames(&mut session, settings, cancel, ready).await
        };

        match &result {
            Ok(summary) => {
                let line = format!(
                    "Done. {} frames read in {:.2} seconds",
                    summary.frames_read,
                    summary.elapsed.as_secs_f64()
                );
                self.status.log_ephemeral(&line);
                self.status.log_persistent(&line);
            }
            Err(e) => {
                tracing::error!("read stage failed: {e}");
                self.status.log_persistent(&format!("Failed: {e}"));
            }
        }
        result
    }

    async fn read_frames(
        &self,
        session: &mut Session,
        settings: &Settings,
        cancel: &CancelToken,
        ready: oneshot::Sender<FrameDims>,
    ) -> Result<ReadSummary> {
        let stale = self.queue.clear();
        if stale > 0 {
            tracing::debug!("dropped {stale} stale composites from a previous run");
        }

        if session.reference.is_none() {
            if let Some(source) = session.source.as_mut() {
                source.seek(0)?;
            }
            let image = next_source_frame(session)?;
            let dims = session.install_reference(image);
            self.record_reference(dims);
            self.status
                .log_persistent(&format!("Reference Frame Loaded ({dims})"));
        }
        let Session {
            source,
            reference,
            accumulator,
            ..
        } = session;
        let source = source.as_mut().ok_or(HeatmapError::NoInput)?;
        let dims = reference
            .as_ref()
            .map(FrameDims::of)
            .ok_or(HeatmapError::NoInput)?;
        let accumulator = accumulator.get_or_insert_with(|| Accumulator::new(dims));
        accumulator.reset();
        let _ = ready.send(dims);

        let mut segmenter = MotionSegmenter::new(SegmenterParams::from(settings));
        let step = settings.step_size.max(1);
        let end = last_frame(source.frame_count(), settings.max_frames, step);
        let progress = ProgressTracker::new(end, step);
        self.status.log_persistent(&format!(
            "Processing {} frames\n\tstep={}\n\tmax_frames={}\n\tintensity={}",
            progress.planned(),
            step,
            settings.max_frames,
            settings.intensity
        ));

        source.seek(0)?;
        let mut frames_read = 0;
        let mut cancelled = false;
        for index in (0..end).step_by(step) {
            if cancel.is_cancelled() {
                cancelled = true;
                self.status.log_persistent("Cancelled");
                break;
            }
            let frame = match read_at(&mut **source, index, step) {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    tracing::debug!("stream ended before frame {index}");
                    break;
                }
                Err(e) => {
                    tracing::warn!("read failed at frame {index}, stopping early: {e}");
                    break;
                }
            };

            let mask = segmenter.apply(&frame)?;
            accumulator.add_step(&mask, settings.intensity)?;
            let composite = blend(&frame, &accumulator.colorize(settings.color_map))?;
            self.queue
                .push(CompositeFrame {
                    index,
                    image: composite,
                })
                .await?;
            frames_read += 1;

            if let Some(line) = progress.update(index, frames_read) {
                self.status.log_ephemeral(&line);
            }
            tokio::task::yield_now().await;
        }

        Ok(ReadSummary {
            frames_read,
            planned: progress.planned(),
            elapsed: progress.elapsed(),
            cancelled,
        })
    }

    async fn write_stage(
        &self,
        settings: &Settings,
        ready: oneshot::Receiver<FrameDims>,
    ) -> Result<WriteSummary> {
        let Ok(dims) = ready.await else {
            tracing::debug!("read stage ended before signalling readiness");
            return Err(HeatmapError::ProducerAborted);
        };

        let abandon = AbandonOnDrop::new(&self.queue);
        let result = self.write_frames(settings, dims).await;
        match &result {
            Ok(summary) => {
                abandon.disarm();
                self.status.log_persistent(&format!(
                    "Saved: {:?}\n\tTime taken: {:.2} seconds",
                    summary.video_path,
                    summary.elapsed.as_secs_f64()
                ));
            }
            Err(e) => {
                drop(abandon);
                tracing::error!("write stage failed: {e}");
                self.status.log_persistent(&format!("Failed: {e}"));
            }
        }
        result
    }

    async fn write_frames(&self, settings: &Settings, dims: FrameDims) -> Result<WriteSummary> {
        let started = Instant::now();
        self.output.ensure_dir()?;
        let stamp = OutputSink::timestamp(Local::now());
        let suffix = settings.metadata_suffix();
        let video_path = self
            .output
            .video_path(&stamp, self.backend.video_extension());

        let mut encoder = self
            .backend
            .open_encoder(&video_path, dims, settings.output_fps)?;
        let mut frames_written = 0;
        loop {
            match self.queue.pop(DEQUEUE_TIMEOUT).await {
                Dequeued::Frame(frame) => {
                    encoder.write_frame(&frame.image)?;
                    frames_written += 1;
                }
                Dequeued::TimedOut => continue,
                Dequeued::Finished => break,
            }
        }
        encoder.finish()?;

        let (overlay, accumulation) = {
            let session = self.session.lock().await;
            let reference: &RgbImage = session.reference.as_ref().ok_or(HeatmapError::NoInput)?;
            let accumulator = session.accumulator.as_ref().ok_or(HeatmapError::NoInput)?;
            (
                accumulator.overlay(reference, settings.color_map)?,
                accumulator.accumulated().clone(),
            )
        };
        let image_path = self.output.write_overlay(&stamp, &suffix, &overlay)?;
        let accumulation_path = if self.output.dumps_accumulation() {
            Some(self.output.write_accumulation(&stamp, &suffix, &accumulation)?)
        } else {
            None
        };
        tracing::info!("wrote {frames_written} frames to {}", video_path.display());

        Ok(WriteSummary {
            frames_written,
            video_path,
            image_path,
            accumulation_path,
            elapsed: started.elapsed(),
        })
    }
}

/// Positions the source for frame `index` and decodes it.
///
/// Sequential reads are used for a step of one; larger steps seek explicitly.
fn read_at(source: &mut dyn FrameSource, index: usize, step: usize) -> Result<Option<RgbImage>> {
    if step > 1 {
        source.seek(index)?;
    }
    source.read()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_range_stops_short_of_the_last_frame() {
        assert_eq!(last_frame(100, 0, 1), 99);
        assert_eq!(last_frame(100, 0, 2), 99);
        assert_eq!((0..last_frame(100, 0, 2)).step_by(2).count(), 50);
    }

    #[test]
    fn frame_bound_limits_the_range() {
        assert_eq!(last_frame(100, 10, 2), 20);
        assert_eq!((0..last_frame(100, 10, 2)).step_by(2).count(), 10);
        assert_eq!(last_frame(100, 500, 3), 99);
    }

    #[test]
    fn empty_streams_have_an_empty_range() {
        assert_eq!(last_frame(0, 0, 1), 0);
        assert_eq!(last_frame(1, 5, 1), 0);
    }

    #[test]
    fn stage_guards_hand_off_the_queue_when_a_stage_panics() {
        use std::panic::{AssertUnwindSafe, catch_unwind};

        let queue = FrameQueue::new(1);
        let unwound = catch_unwind(AssertUnwindSafe(|| {
            let _finish = FinishOnDrop(&queue);
            panic!("decoder blew up");
        }));
        assert!(unwound.is_err());
        assert!(queue.is_finished());

        let unwound = catch_unwind(AssertUnwindSafe(|| {
            let _abandon = AbandonOnDrop::new(&queue);
            panic!("encoder blew up");
        }));
        assert!(unwound.is_err());
        assert!(queue.is_abandoned());
    }

    #[test]
    fn disarmed_writer_guard_leaves_the_queue_alone() {
        let queue = FrameQueue::new(1);
        AbandonOnDrop::new(&queue).disarm();
        assert!(!queue.is_abandoned());
    }

    #[test]
    fn report_success_needs_both_stages() {
        let read = ReadSummary {
            frames_read: 1,
            planned: 1,
            elapsed: Duration::ZERO,
            cancelled: false,
        };
        let report = RunReport {
            read: Ok(read.clone()),
            write: Err(HeatmapError::ProducerAborted),
        };
        assert!(!report.is_success());
    }
}
