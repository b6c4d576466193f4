//! Bounded frame queue between the hardware callback and the orchestrator.
//!
//! When the queue is full, pushing a new frame **drops the oldest** one and
//! bumps an overflow counter.  The producer (a cpal callback) therefore never
//! waits on the consumer; latency stays bounded at the cost of completeness.
//!
//! # Example
//!
//! ```rust
//! use ptt_translator::audio::{AudioFrame, FrameQueue};
//!
//! let queue = FrameQueue::new(2);
//! for i in 0..3 {
//!     queue.push(AudioFrame::mono(vec![i; 4], 16_000));
//! }
//! assert_eq!(queue.overflows(), 1);
//! assert_eq!(queue.try_pop().unwrap().samples[0], 1);
//! ```

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use super::error::DeviceError;
use super::frame::AudioFrame;

/// Result of waiting on a [`FrameQueue`].
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureRead {
    /// Next frame in capture order.
    Frame(AudioFrame),
    /// The stream was closed and every buffered frame has been consumed.
    EndOfStream,
}

struct QueueInner {
    frames: VecDeque<AudioFrame>,
    overflows: u64,
    closed: bool,
    /// Set when the device failed mid-stream; reported once drained.
    failure: Option<String>,
}

/// Fixed-capacity, drop-oldest queue of [`AudioFrame`]s.
pub struct FrameQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
    notify: Notify,
}

impl FrameQueue {
    /// # Panics
    ///
    /// Panics if `capacity == 0`.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "FrameQueue capacity must be > 0");
        Self {
            inner: Mutex::new(QueueInner {
                frames: VecDeque::with_capacity(capacity),
                overflows: 0,
                closed: false,
                failure: None,
            }),
            capacity,
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a frame, evicting the oldest when full.
    ///
    /// Returns `false` when a frame had to be dropped.  Frames pushed after
    /// [`close`](Self::close) are discarded.
    pub fn push(&self, frame: AudioFrame) -> bool {
        let kept_all = {
            let mut inner = self.lock();
            if inner.closed {
                return false;
            }
            let mut kept_all = true;
            if inner.frames.len() == self.capacity {
                inner.frames.pop_front();
                inner.overflows += 1;
                kept_all = false;
            }
            inner.frames.push_back(frame);
            kept_all
        };
        self.notify.notify_one();
        kept_all
    }

    /// Pop the oldest frame without waiting.
    pub fn try_pop(&self) -> Option<AudioFrame> {
        self.lock().frames.pop_front()
    }

    /// Wait for the next frame.
    ///
    /// Buffered frames are still delivered after `close`; once drained the
    /// queue reports [`CaptureRead::EndOfStream`], or the device failure if
    /// one was recorded.  Cancel-safe: a frame is only removed when returned.
    pub async fn recv(&self) -> Result<CaptureRead, DeviceError> {
        loop {
            {
                let mut inner = self.lock();
                if let Some(frame) = inner.frames.pop_front() {
                    return Ok(CaptureRead::Frame(frame));
                }
                if let Some(reason) = inner.failure.take() {
                    return Err(DeviceError::Disconnected {
                        direction: "input",
                        reason,
                    });
                }
                if inner.closed {
                    return Ok(CaptureRead::EndOfStream);
                }
            }
            self.notify.notified().await;
        }
    }

    /// Stop accepting frames; waiting readers drain what is left.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    /// Record a mid-stream device failure and close the queue.
    pub fn fail(&self, reason: impl Into<String>) {
        {
            let mut inner = self.lock();
            inner.failure = Some(reason.into());
            inner.closed = true;
        }
        self.notify.notify_one();
    }

    /// Frames dropped because the consumer fell behind.
    pub fn overflows(&self) -> u64 {
        self.lock().overflows
    }

    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
