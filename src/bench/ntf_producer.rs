//! Notification benchmark producer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::bench::{Notification, NotificationBroker, OfferResult};
use crate::rpc::make_payload;

use serde::{Deserialize, Serialize};

/// How a producer publishes.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum ProducerMode {
    /// Waits for queue space; failures are counted.
    Blocking,

    /// Never waits; a rejected offer is counted as an error, not retried.
    NonBlocking,
}

/// Publishes one fixed payload a given number of times.
pub struct NtfBenchProducer {
    me: String,
    broker: Arc<NotificationBroker>,
    mode: ProducerMode,
    ntf_ok: AtomicU64,
    ntf_error: AtomicU64,
}

impl NtfBenchProducer {
    pub fn new(
        me: impl Into<String>,
        broker: Arc<NotificationBroker>,
        mode: ProducerMode,
    ) -> Self {
        NtfBenchProducer {
            me: me.into(),
            broker,
            mode,
            ntf_ok: AtomicU64::new(0),
            ntf_error: AtomicU64::new(0),
        }
    }

    pub fn ntf_ok(&self) -> u64 {
        self.ntf_ok.load(Ordering::Relaxed)
    }

    pub fn ntf_error(&self) -> u64 {
        self.ntf_error.load(Ordering::Relaxed)
    }

    /// Builds a payload of `payload_size` items once and publishes it
    /// `iterations` times.
    pub async fn run(&self, iterations: usize, payload_size: usize) {
        let ntf = Notification::new(make_payload(payload_size));
        for _ in 0..iterations {
            let ok = match self.mode {
                ProducerMode::Blocking => {
                    self.broker.put_notification(ntf.clone()).await.is_ok()
                }
                ProducerMode::NonBlocking => matches!(
                    self.broker.offer_notification(ntf.clone()),
                    Ok(OfferResult::Accepted(_))
                ),
            };
            if ok {
                self.ntf_ok.fetch_add(1, Ordering::Relaxed);
            } else {
                self.ntf_error.fetch_add(1, Ordering::Relaxed);
            }
        }
        pf_debug!(self.me; "producer done: ok {} err {}",
                           self.ntf_ok(), self.ntf_error());
    }
}
