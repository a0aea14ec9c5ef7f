use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

use crate::error::FrameRejection;
use crate::pipeline::AudioFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    Input,
    Output,
}

impl QueueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::Input => "input",
            QueueKind::Output => "output",
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a bounded dequeue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Frame(AudioFrame),
    /// Nothing arrived before the deadline. Not an error.
    TimedOut,
    /// The queue was closed and fully drained.
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub len: usize,
    pub capacity: usize,
    pub enqueued: u64,
    pub dequeued: u64,
    pub dropped: u64,
    pub cleared: u64,
}

struct QueueState {
    frames: VecDeque<AudioFrame>,
    closed: bool,
    held: bool,
}

/// Bounded FIFO of audio frames with a drop-newest policy.
///
/// Every state change happens under one lock, so a clear, a hold or a close
/// is atomic with respect to concurrent pushes.
pub(crate) struct FrameQueue {
    kind: QueueKind,
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    dropped: AtomicU64,
    cleared: AtomicU64,
}

impl FrameQueue {
    pub(crate) fn new(kind: QueueKind, capacity: usize) -> Self {
        Self {
            kind,
            capacity,
            state: Mutex::new(QueueState {
                frames: VecDeque::with_capacity(capacity),
                closed: false,
                held: false,
            }),
            notify: Notify::new(),
            enqueued: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            cleared: AtomicU64::new(0),
        }
    }

    pub(crate) fn kind(&self) -> QueueKind {
        self.kind
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn push(&self, frame: AudioFrame) -> Result<(), FrameRejection> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(FrameRejection::Closed { queue: self.kind });
            }
            if state.held {
                self.dropped.fetch_add(1, Ordering::SeqCst);
                return Err(FrameRejection::Held { queue: self.kind });
            }
            if state.frames.len() >= self.capacity {
                self.dropped.fetch_add(1, Ordering::SeqCst);
                return Err(FrameRejection::Saturated {
                    queue: self.kind,
                    capacity: self.capacity,
                });
            }
            state.frames.push_back(frame);
        }

        self.enqueued.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_one();
        Ok(())
    }

    /// Waits up to `wait` for the next frame. Frames queued before a close are
    /// still handed out; `Closed` is returned only once the queue is empty.
    pub(crate) async fn pop(&self, wait: Duration) -> Received {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if let Some(frame) = state.frames.pop_front() {
                    self.dequeued.fetch_add(1, Ordering::SeqCst);
                    return Received::Frame(frame);
                }
                if state.closed {
                    return Received::Closed;
                }
            }

            if timeout_at(deadline, notified).await.is_err() {
                return Received::TimedOut;
            }
        }
    }

    pub(crate) fn clear(&self) -> usize {
        let removed = {
            let mut state = self.state.lock();
            let removed = state.frames.len();
            state.frames.clear();
            removed
        };
        self.cleared.fetch_add(removed as u64, Ordering::SeqCst);
        removed
    }

    /// Empties the queue and refuses new frames until `release` is called.
    pub(crate) fn hold_and_clear(&self) -> usize {
        let removed = {
            let mut state = self.state.lock();
            state.held = true;
            let removed = state.frames.len();
            state.frames.clear();
            removed
        };
        self.cleared.fetch_add(removed as u64, Ordering::SeqCst);
        removed
    }

    pub(crate) fn release(&self) -> bool {
        let mut state = self.state.lock();
        std::mem::replace(&mut state.held, false)
    }

    /// Returns `false` if the queue was already closed.
    pub(crate) fn close(&self) -> bool {
        let first = {
            let mut state = self.state.lock();
            !std::mem::replace(&mut state.closed, true)
        };
        self.notify.notify_waiters();
        self.notify.notify_one();
        first
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub(crate) fn is_held(&self) -> bool {
        self.state.lock().held
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().frames.len()
    }

    pub(crate) fn stats(&self) -> QueueStats {
        QueueStats {
            len: self.len(),
            capacity: self.capacity,
            enqueued: self.enqueued.load(Ordering::SeqCst),
            dequeued: self.dequeued.load(Ordering::SeqCst),
            dropped: self.dropped.load(Ordering::SeqCst),
            cleared: self.cleared.load(Ordering::SeqCst),
        }
    }

    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> Vec<AudioFrame> {
        self.state.lock().frames.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn frame(tag: u8) -> AudioFrame {
        AudioFrame::from(vec![tag])
    }

    #[test]
    fn full_queue_drops_the_newest_frame() {
        let queue = FrameQueue::new(QueueKind::Input, 2);
        queue.push(frame(b'A')).expect("A fits");
        queue.push(frame(b'B')).expect("B fits");

        let rejection = queue.push(frame(b'C')).expect_err("C should be dropped");
        assert_eq!(
            rejection,
            FrameRejection::Saturated {
                queue: QueueKind::Input,
                capacity: 2
            }
        );
        assert_eq!(queue.snapshot(), vec![frame(b'A'), frame(b'B')]);

        let stats = queue.stats();
        assert_eq!(stats.len, 2);
        assert_eq!(stats.enqueued, 2);
        assert_eq!(stats.dropped, 1);
    }

    #[tokio::test]
    async fn pop_times_out_on_empty_queue() {
        let queue = FrameQueue::new(QueueKind::Input, 4);
        let started = Instant::now();
        assert_eq!(queue.pop(Duration::from_millis(30)).await, Received::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn pop_wakes_when_a_frame_arrives() {
        let queue = Arc::new(FrameQueue::new(QueueKind::Output, 4));
        let producer = Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.push(frame(7)).expect("push");
        });

        assert_eq!(
            queue.pop(Duration::from_millis(600)).await,
            Received::Frame(frame(7))
        );
    }

    #[tokio::test]
    async fn close_drains_remaining_frames_before_reporting_closed() {
        let queue = FrameQueue::new(QueueKind::Output, 4);
        queue.push(frame(1)).expect("push");
        assert!(queue.close());
        assert!(!queue.close());

        assert_eq!(
            queue.push(frame(2)),
            Err(FrameRejection::Closed {
                queue: QueueKind::Output
            })
        );
        assert_eq!(
            queue.pop(Duration::from_millis(50)).await,
            Received::Frame(frame(1))
        );
        assert_eq!(queue.pop(Duration::from_millis(50)).await, Received::Closed);
    }

    #[tokio::test]
    async fn close_wakes_a_blocked_consumer() {
        let queue = Arc::new(FrameQueue::new(QueueKind::Output, 4));
        let consumer = Arc::clone(&queue);
        let waiter = tokio::spawn(async move { consumer.pop(Duration::from_secs(5)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        let received = tokio::time::timeout(Duration::from_millis(600), waiter)
            .await
            .expect("consumer should wake")
            .expect("consumer task");
        assert_eq!(received, Received::Closed);
    }

    #[test]
    fn held_queue_refuses_frames_until_released() {
        let queue = FrameQueue::new(QueueKind::Output, 4);
        queue.push(frame(1)).expect("push");
        assert_eq!(queue.hold_and_clear(), 1);
        assert_eq!(queue.len(), 0);
        assert!(matches!(
            queue.push(frame(2)),
            Err(FrameRejection::Held { .. })
        ));

        assert!(queue.release());
        queue.push(frame(3)).expect("push after release");
        assert_eq!(queue.snapshot(), vec![frame(3)]);
        assert_eq!(queue.stats().cleared, 1);
    }
}
