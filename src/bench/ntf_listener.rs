//! Notification benchmark listener.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::bench::{Notification, NotificationListener};
use crate::utils::ClusterBenchError;

use tokio::sync::watch;

/// Counts notifications of the expected payload size. The bounded variant
/// signals completion once, when the count reaches its target.
pub struct NtfBenchListener {
    expected_size: usize,
    received: AtomicU64,
    target: Option<u64>,

    /// Completion flag; only ever flipped from false to true.
    tx_done: watch::Sender<bool>,

    /// Times the completion has been signalled.
    completions: AtomicU64,
}

impl NtfBenchListener {
    /// Creates a listener with no completion target.
    pub fn new(expected_size: usize) -> Self {
        NtfBenchListener {
            expected_size,
            received: AtomicU64::new(0),
            target: None,
            tx_done: watch::channel(false).0,
            completions: AtomicU64::new(0),
        }
    }

    /// Creates a listener that completes after `target` matching
    /// notifications.
    pub fn new_bounded(expected_size: usize, target: u64) -> Self {
        NtfBenchListener {
            expected_size,
            received: AtomicU64::new(0),
            target: Some(target),
            tx_done: watch::channel(target == 0).0,
            completions: AtomicU64::new(0),
        }
    }

    /// Number of matching notifications received so far.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Acquire)
    }

    pub fn is_done(&self) -> bool {
        *self.tx_done.borrow()
    }

    /// Times the target count was reached; at most 1.
    pub fn completions(&self) -> u64 {
        self.completions.load(Ordering::Acquire)
    }

    /// Waits until the target count is reached.
    pub async fn all_done(&self) -> Result<(), ClusterBenchError> {
        if self.target.is_none() {
            return Err(ClusterBenchError::msg(
                "listener has no completion target",
            ));
        }
        let mut rx_done = self.tx_done.subscribe();
        while !*rx_done.borrow_and_update() {
            rx_done.changed().await?;
        }
        Ok(())
    }
}

impl NotificationListener for NtfBenchListener {
    fn on_notification(&self, ntf: &Notification) {
        if ntf.size() != self.expected_size {
            return;
        }
        let cnt = self.received.fetch_add(1, Ordering::AcqRel) + 1;
        // exactly one arrival observes the target count
        if self.target == Some(cnt) {
            self.completions.fetch_add(1, Ordering::AcqRel);
            self.tx_done.send_replace(true);
        }
    }
}
