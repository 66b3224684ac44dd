//! Tracking of in-progress broker tasks.
//!
//! Watch tasks and step sends hold a [`TaskToken`] for as long as they run, so
//! callers can await a quiescent broker instead of guessing with sleeps.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Counts outstanding tasks and wakes waiters when the count reaches zero.
#[derive(Debug, Default)]
pub struct TaskTracker {
    active: AtomicUsize,
    idle: Notify,
}

/// Proof of one outstanding task; dropping it marks the task finished.
#[derive(Debug)]
pub struct TaskToken {
    tracker: Arc<TaskTracker>,
}

impl TaskTracker {
    /// Create a tracker with nothing outstanding.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register one task.
    pub fn token(self: &Arc<Self>) -> TaskToken {
        self.active.fetch_add(1, Ordering::AcqRel);
        TaskToken {
            tracker: Arc::clone(self),
        }
    }

    /// Number of outstanding tasks.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Resolve once no task is outstanding.
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.idle.notified();
            if self.active() == 0 {
                return;
            }
            idle.await;
        }
    }
}

impl Drop for TaskToken {
    fn drop(&mut self) {
        if self.tracker.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}
