//! Fixed-delay task scheduler.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::utils::{ClusterBenchError, Timer};

use futures::future::BoxFuture;

use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Handle of a scheduled recurring task. Cancelling only sets a flag: the
/// task notices it after its current wait and stops before doing any more
/// work. An in-flight unit of work is never interrupted. Dropping the handle
/// cancels the task as well.
pub struct ScheduledTask {
    cancelled: Arc<AtomicBool>,
    fired: Arc<AtomicU64>,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Number of times the work has been started.
    pub fn fired(&self) -> u64 {
        self.fired.load(Ordering::Acquire)
    }

    /// Returns true once the task loop has ended.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Schedules recurring background tasks onto the tokio runtime.
pub struct TaskScheduler {
    me: String,
}

impl TaskScheduler {
    pub fn new(me: impl Into<String>) -> Self {
        TaskScheduler { me: me.into() }
    }

    /// Runs `work` every `delay` until cancelled, each run starting `delay`
    /// after the previous one finished. Must be called within a tokio
    /// runtime.
    pub fn schedule_fixed_delay<F>(
        &self,
        delay: Duration,
        work: F,
    ) -> Result<ScheduledTask, ClusterBenchError>
    where
        F: FnMut() -> BoxFuture<'static, ()> + Send + 'static,
    {
        if delay.is_zero() {
            return logged_err!(self.me; "invalid fixed delay {:?}", delay);
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        let fired = Arc::new(AtomicU64::new(0));
        let handle = tokio::spawn(Self::fixed_delay_thread(
            self.me.clone(),
            delay,
            work,
            cancelled.clone(),
            fired.clone(),
        ));
        pf_debug!(self.me; "scheduled task every {:?}", delay);

        Ok(ScheduledTask {
            cancelled,
            fired,
            handle,
        })
    }

    /// Recurring task loop.
    async fn fixed_delay_thread<F>(
        me: String,
        delay: Duration,
        mut work: F,
        cancelled: Arc<AtomicBool>,
        fired: Arc<AtomicU64>,
    ) where
        F: FnMut() -> BoxFuture<'static, ()> + Send + 'static,
    {
        let mut timer = Timer::new();
        loop {
            if let Err(e) = timer.kickoff(delay) {
                pf_error!(me; "error kicking off timer: {}", e);
                break;
            }
            timer.timeout().await;

            // checked after the wait, before acting
            if cancelled.load(Ordering::Acquire) {
                break;
            }
            fired.fetch_add(1, Ordering::AcqRel);
            work().await;
        }

        pf_debug!(me; "scheduled task stopped after {} firings",
                      fired.load(Ordering::Acquire));
    }
}
