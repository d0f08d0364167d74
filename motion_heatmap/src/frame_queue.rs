// THEORY:
// The `FrameQueue` is the hand-off between the read stage (detect, accumulate,
// composite) and the write stage (encode). It is a bounded FIFO, so memory stays
// proportional to how far the encoder lags behind rather than to the length of
// the video, plus two flags that carry the end-of-run handshake.
//
// Key architectural principles:
// 1.  **Ordering**: Entries leave in exactly the order they were pushed. Each
//     entry carries its source frame index so consumers can verify this.
// 2.  **Explicit Completion**: The producer calls `finish` when it is done, on
//     success and on failure alike. A consumer waiting on an empty queue wakes up
//     as soon as that happens instead of sitting out its timeout.
// 3.  **Back-Pressure With an Escape Hatch**: `push` waits for free capacity. If
//     the consumer fails it calls `abandon`, which wakes a blocked producer with
//     an error so neither side can wait forever.
// 4.  **Reusable**: `clear` discards stale entries from a previous run and resets
//     both flags.

use crate::error::{HeatmapError, Result};
use image::RgbImage;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

/// Default number of composites that may wait for the encoder.
pub const DEFAULT_CAPACITY: usize = 64;

/// A fully composited frame on its way to the encoder.
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeFrame {
    /// Index of the source frame this composite was made from.
    pub index: usize,
    pub image: RgbImage,
}

/// Outcome of a bounded wait on the queue.
#[derive(Debug, PartialEq)]
pub enum Dequeued {
    Frame(CompositeFrame),
    /// Nothing arrived in time, but the producer is still running.
    TimedOut,
    /// The producer has finished and the queue is empty.
    Finished,
}

pub struct FrameQueue {
    entries: Mutex<VecDeque<CompositeFrame>>,
    slots: Semaphore,
    capacity: usize,
    available: Notify,
    space: Notify,
    finished: AtomicBool,
    abandoned: AtomicBool,
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            slots: Semaphore::new(capacity),
            capacity,
            available: Notify::new(),
            space: Notify::new(),
            finished: AtomicBool::new(false),
            abandoned: AtomicBool::new(false),
        }
    }

    fn entries(&self) -> MutexGuard<'_, VecDeque<CompositeFrame>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
    }

    /// Enqueues `frame`, waiting while the queue is full.
    ///
    /// Fails with `QueueAbandoned` once the consumer has given up.
    pub async fn push(&self, frame: CompositeFrame) -> Result<()> {
        loop {
            if self.is_abandoned() {
                return Err(HeatmapError::QueueAbandoned);
            }
            tokio::select! {
                permit = self.slots.acquire() => {
                    permit.map_err(|_| HeatmapError::QueueAbandoned)?.forget();
                    break;
                }
                _ = self.space.notified() => continue,
            }
        }
        if self.is_abandoned() {
            self.slots.add_permits(1);
            return Err(HeatmapError::QueueAbandoned);
        }
        self.entries().push_back(frame);
        self.available.notify_one();
        Ok(())
    }

    /// Takes the oldest entry without waiting.
    pub fn try_pop(&self) -> Option<CompositeFrame> {
        let frame = self.entries().pop_front();
        if frame.is_some() {
            self.slots.add_permits(1);
        }
        frame
    }

    /// Takes the oldest entry, waiting up to `wait` while the producer runs.
    ///
    /// Returns `Finished` without waiting when the producer is done and the
    /// queue is drained.
    pub async fn pop(&self, wait: Duration) -> Dequeued {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(frame) = self.try_pop() {
                return Dequeued::Frame(frame);
            }
            if self.is_finished() {
                // A push may have landed between the pop above and the flag.
                return match self.try_pop() {
                    Some(frame) => Dequeued::Frame(frame),
                    None => Dequeued::Finished,
                };
            }
            if tokio::time::timeout_at(deadline, self.available.notified())
                .await
                .is_err()
            {
                return Dequeued::TimedOut;
            }
        }
    }

    /// Marks the producer as done and wakes the consumer.
    pub fn finish(&self) {
        self.finished.store(true, Ordering::Release);
        self.available.notify_one();
    }

    /// Marks the consumer as gone, drops queued entries and wakes the producer.
    pub fn abandon(&self) {
        self.abandoned.store(true, Ordering::Release);
        let dropped = self.entries().drain(..).count();
        self.slots.add_permits(dropped);
        self.space.notify_one();
    }

    /// Drops stale entries and resets both flags. Returns how many entries were
    /// dropped.
    pub fn clear(&self) -> usize {
        let dropped = self.entries().drain(..).count();
        self.slots.add_permits(dropped);
        self.finished.store(false, Ordering::Release);
        self.abandoned.store(false, Ordering::Release);
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn frame(index: usize) -> CompositeFrame {
        CompositeFrame {
            index,
            image: RgbImage::new(1, 1),
        }
    }

    #[tokio::test]
    async fn preserves_fifo_order() {
        let queue = FrameQueue::new(16);
        for i in 1..=10 {
            queue.push(frame(i)).await.unwrap();
        }
        queue.finish();
        let mut drained = Vec::new();
        while let Dequeued::Frame(f) = queue.pop(Duration::from_millis(10)).await {
            drained.push(f.index);
        }
        assert_eq!(drained, (1..=10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn finished_empty_queue_returns_promptly() {
        let queue = FrameQueue::new(4);
        queue.finish();
        let result = tokio::time::timeout(Duration::from_millis(200), queue.pop(Duration::from_secs(2)))
            .await
            .expect("pop should not wait out its timeout");
        assert_eq!(result, Dequeued::Finished);
    }

    #[tokio::test]
    async fn waiting_consumer_wakes_on_finish() {
        let queue = Arc::new(FrameQueue::new(4));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.finish();
        let result = tokio::time::timeout(Duration::from_millis(500), consumer)
            .await
            .expect("consumer should wake")
            .unwrap();
        assert_eq!(result, Dequeued::Finished);
    }

    #[tokio::test]
    async fn empty_running_queue_times_out() {
        let queue = FrameQueue::new(4);
        assert_eq!(queue.pop(Duration::from_millis(20)).await, Dequeued::TimedOut);
    }

    #[tokio::test]
    async fn push_waits_for_capacity() {
        let queue = Arc::new(FrameQueue::new(2));
        queue.push(frame(0)).await.unwrap();
        queue.push(frame(1)).await.unwrap();

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.push(frame(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.try_pop().map(|f| f.index), Some(0));
        producer.await.unwrap().unwrap();
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn abandon_unblocks_a_full_producer() {
        let queue = Arc::new(FrameQueue::new(1));
        queue.push(frame(0)).await.unwrap();
        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.push(frame(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.abandon();
        let result = producer.await.unwrap();
        assert!(matches!(result, Err(HeatmapError::QueueAbandoned)));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn clear_drops_stale_entries_and_resets_flags() {
        let queue = FrameQueue::new(2);
        queue.push(frame(7)).await.unwrap();
        queue.push(frame(8)).await.unwrap();
        queue.finish();
        assert_eq!(queue.clear(), 2);
        assert!(!queue.is_finished());
        assert!(queue.is_empty());

        // Capacity is fully restored.
        queue.push(frame(9)).await.unwrap();
        queue.push(frame(10)).await.unwrap();
        assert_eq!(queue.try_pop().map(|f| f.index), Some(9));
    }
}
