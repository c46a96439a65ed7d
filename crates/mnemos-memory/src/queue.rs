//! Bounded extraction queue
//!
//! Many producers, one consumer. `enqueue` never blocks and never fails: when
//! the buffer is full the oldest job is evicted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::warn;

use mnemos_core::ExtractionJob;

pub struct ExtractionQueue {
    buffer: Mutex<VecDeque<ExtractionJob>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl ExtractionQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Append a job. Returns the evicted job when the queue was full.
    pub fn enqueue(&self, job: ExtractionJob) -> Option<ExtractionJob> {
        let evicted = {
            let mut buffer = self.buffer.lock();
            let evicted = if buffer.len() >= self.capacity {
                buffer.pop_front()
            } else {
                None
            };
            buffer.push_back(job);
            evicted
        };

        if let Some(old) = &evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(
                "[queue] full at {}; dropped oldest job for turn {}",
                self.capacity, old.turn.id
            );
        }
        self.notify.notify_one();
        evicted
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Pop up to `max` jobs, oldest first.
    pub fn take(&self, max: usize) -> Vec<ExtractionJob> {
        let mut buffer = self.buffer.lock();
        let n = max.min(buffer.len());
        buffer.drain(..n).collect()
    }

    pub fn drain_all(&self) -> Vec<ExtractionJob> {
        self.buffer.lock().drain(..).collect()
    }

    /// Wait until `batch_size` jobs are queued or `flush_interval` has passed,
    /// whichever comes first. Returns whether any job is waiting.
    pub async fn wait_for_batch(&self, batch_size: usize, flush_interval: Duration) -> bool {
        let deadline = Instant::now() + flush_interval;
        loop {
            let len = self.len();
            if len >= batch_size.max(1) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return len > 0;
            }
            let _ = tokio::time::timeout(deadline - now, self.notify.notified()).await;
        }
    }

    /// Wake the consumer without adding work.
    pub fn wake(&self) {
        self.notify.notify_one();
    }
}
