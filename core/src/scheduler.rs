//! Shared task scheduler
//!
//! Thin layer over the tokio runtime that every timer in the crate goes
//! through: endpoint retransmission and delayed acks, proxy batch flushes
//! and scheduled probe runs. A scheduled task is cancelled through its
//! [`TaskHandle`]; dropping the handle leaves the task running.

use rand::Rng;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::debug;

/// Handle to a scheduled task
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: u64,
    abort: AbortHandle,
}

impl TaskHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

/// Schedules one-shot and periodic work on the current tokio runtime
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    next_id: Arc<AtomicU64>,
    scheduled: Arc<AtomicU64>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` once after `delay`
    pub fn schedule_once<F>(&self, delay: Duration, task: F) -> TaskHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.scheduled.fetch_add(1, Ordering::Relaxed);
        let handle = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            task.await;
        });
        TaskHandle {
            id,
            abort: handle.abort_handle(),
        }
    }

    /// Run `task` every `period`, first after one period
    pub fn schedule_periodic<F, Fut>(&self, period: Duration, mut task: F) -> TaskHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.scheduled.fetch_add(1, Ordering::Relaxed);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                task().await;
            }
        });
        TaskHandle {
            id,
            abort: handle.abort_handle(),
        }
    }

    /// Cancel a scheduled task; a task that already ran is unaffected
    pub fn cancel(&self, task: &TaskHandle) {
        if !task.abort.is_finished() {
            debug!("Cancelling scheduled task {}", task.id);
        }
        task.abort.abort();
    }

    /// Number of tasks scheduled so far
    pub fn scheduled_count(&self) -> u64 {
        self.scheduled.load(Ordering::Relaxed)
    }
}

/// Apply a random variation of up to `variation` (fraction) around `base`
pub fn jitter(base: Duration, variation: f64) -> Duration {
    if variation <= 0.0 || base.is_zero() {
        return base;
    }
    let factor = 1.0 + rand::thread_rng().gen_range(-variation..variation);
    base.mul_f64(factor.max(0.0))
}
