//! Timer/timeout utility implemented using `tokio::time::Sleep`.

use std::pin::Pin;

use crate::utils::ClusterBenchError;

use tokio::time::{self, Duration, Instant, Sleep};

/// A deadline far enough in the future to stand for "never".
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365);

/// Timer utility for signalling after a given timeout. Supports kicking off
/// again with a different duration and cancelling a pending deadline.
///
/// Must be used within the context of a tokio runtime.
#[derive(Debug)]
pub struct Timer {
    /// Inner `tokio::time::Sleep` future, wrapped in a pinned box to support
    /// await multiple times.
    sleep: Pin<Box<Sleep>>,

    /// Timeout duration used by the last kick-off.
    last_dur: Duration,

    /// True if a deadline is currently pending.
    armed: bool,
}

impl Timer {
    /// Creates a new timer utility that immediately times-out after a
    /// zero-length duration.
    pub fn new() -> Self {
        Timer {
            sleep: Box::pin(time::sleep(Duration::ZERO)),
            last_dur: Duration::ZERO,
            armed: false,
        }
    }

    /// Get the last timeout duration used.
    pub fn get_dur(&self) -> Duration {
        self.last_dur
    }

    /// Returns true if a deadline is pending.
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Kicks off the timer with the given duration.
    pub fn kickoff(&mut self, dur: Duration) -> Result<(), ClusterBenchError> {
        if dur.is_zero() {
            return Err(ClusterBenchError(format!(
                "invalid timeout duration {} ns",
                dur.as_nanos()
            )));
        }

        self.last_dur = dur;
        self.armed = true;
        self.sleep.as_mut().reset(Instant::now() + dur);
        Ok(())
    }

    /// Cancels the pending deadline, if any. A following `timeout()` waits
    /// until the next kick-off.
    pub fn cancel(&mut self) -> Result<(), ClusterBenchError> {
        self.armed = false;
        self.sleep.as_mut().reset(Instant::now() + FAR_FUTURE);
        Ok(())
    }

    /// Waits for the timer to timeout. Typically, this should be used as a
    /// branch of a `tokio::select!`.
    pub async fn timeout(&mut self) {
        self.sleep.as_mut().await;
        self.armed = false;
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
