//! Notification benchmark harness: producers publishing in parallel through
//! one broker to a set of counting listeners.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use super::rpcbench::ExecGuard;
use crate::bench::{
    ExecStatus, NotificationBroker, NtfBenchListener, NtfBenchProducer,
    ProducerMode,
};
use crate::utils::ClusterBenchError;

use futures::future;

use serde::{Deserialize, Serialize};

use tokio::time::{self, Duration, Instant};

/// Configuration parameters struct.
#[derive(Debug, Clone)]
pub struct NtfBenchConfig {
    /// Capacity of the broker's notification queue.
    pub queue_cap: usize,

    /// Wall-clock limit of one test run.
    pub timeout_s: u64,

    /// How long to keep counting after non-blocking producers finish.
    pub drain_ms: u64,
}

impl Default for NtfBenchConfig {
    fn default() -> Self {
        NtfBenchConfig {
            queue_cap: 1024,
            timeout_s: 300,
            drain_ms: 200,
        }
    }
}

/// Parameters of one notification test.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct NtfStartTestInput {
    pub producer_mode: ProducerMode,
    pub producers: usize,
    pub listeners: usize,
    pub iterations: usize,
    pub payload_size: usize,
}

/// Summary of one notification test.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct NtfRunResult {
    elapsed: Duration,
    listener_ok: u64,
    producer_ok: u64,
    producer_error: u64,
    rate: f64,
}

impl NtfRunResult {
    /// `rate` counts published notifications, failed or not, per second.
    pub fn new(
        elapsed: Duration,
        listener_ok: u64,
        producer_ok: u64,
        producer_error: u64,
    ) -> Self {
        let secs = elapsed.as_secs_f64();
        let rate = if secs > 0.0 {
            (producer_ok + producer_error) as f64 / secs
        } else {
            0.0
        };
        NtfRunResult {
            elapsed,
            listener_ok,
            producer_ok,
            producer_error,
            rate,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Matching notifications received, summed over listeners.
    pub fn listener_ok(&self) -> u64 {
        self.listener_ok
    }

    pub fn producer_ok(&self) -> u64 {
        self.producer_ok
    }

    pub fn producer_error(&self) -> u64 {
        self.producer_error
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }
}

/// The notification benchmark module.
pub struct NtfBenchmark {
    me: String,
    broker: Arc<NotificationBroker>,
    config: NtfBenchConfig,

    /// Runs share the broker, so only one may execute at a time.
    executing: AtomicBool,
}

impl NtfBenchmark {
    /// Creates the benchmark module along with its broker.
    pub async fn new_and_setup(
        me: impl Into<String>,
        config_str: Option<&str>,
    ) -> Result<Self, ClusterBenchError> {
        let me = me.into();
        let config = parsed_config!(config_str => NtfBenchConfig;
                                    queue_cap, timeout_s, drain_ms)?;
        if config.timeout_s == 0 {
            return logged_err!(me; "invalid config.timeout_s '{}'",
                                   config.timeout_s);
        }

        let broker = Arc::new(
            NotificationBroker::new_and_setup(me.clone(), config.queue_cap)
                .await?,
        );
        Ok(NtfBenchmark {
            me,
            broker,
            config,
            executing: AtomicBool::new(false),
        })
    }

    /// Runs one notification test. With blocking producers, waits for every
    /// listener to count all notifications; with non-blocking ones, waits a
    /// drain window instead. Both waits are bounded by the run timeout.
    /// Refused if another test is executing.
    pub async fn start_test(
        &self,
        input: NtfStartTestInput,
    ) -> Result<NtfRunResult, ClusterBenchError> {
        let _guard = match ExecGuard::acquire(&self.executing) {
            Some(guard) => guard,
            None => return logged_err!(self.me; "a test is already executing"),
        };
        let expected = (input.producers * input.iterations) as u64;
        let listeners: Vec<Arc<NtfBenchListener>> = (0..input.listeners)
            .map(|_| {
                Arc::new(match input.producer_mode {
                    ProducerMode::Blocking => {
                        NtfBenchListener::new_bounded(input.payload_size, expected)
                    }
                    ProducerMode::NonBlocking => {
                        NtfBenchListener::new(input.payload_size)
                    }
                })
            })
            .collect();
        // unsubscribed on every exit path when dropped
        let _regs: Vec<_> = listeners
            .iter()
            .map(|l| self.broker.register_listener(l.clone()))
            .collect();

        let producers: Vec<Arc<NtfBenchProducer>> = (0..input.producers)
            .map(|_| {
                Arc::new(NtfBenchProducer::new(
                    self.me.clone(),
                    self.broker.clone(),
                    input.producer_mode,
                ))
            })
            .collect();
        pf_info!(self.me; "starting {} {:?} producers x {} ntfs to {} listeners",
                          input.producers, input.producer_mode,
                          input.iterations, input.listeners);

        let timeout = Duration::from_secs(self.config.timeout_s);
        let start = Instant::now();
        let deadline = start + timeout;

        let mut handles: Vec<_> = producers
            .iter()
            .map(|p| {
                let p = p.clone();
                let (iterations, size) = (input.iterations, input.payload_size);
                tokio::spawn(async move { p.run(iterations, size).await })
            })
            .collect();
        if time::timeout_at(deadline, future::join_all(handles.iter_mut()))
            .await
            .is_err()
        {
            pf_warn!(self.me; "producers timed out, reporting partial results");
        }
        for h in &handles {
            h.abort();
        }

        match input.producer_mode {
            ProducerMode::Blocking => {
                let all_done =
                    future::join_all(listeners.iter().map(|l| l.all_done()));
                if time::timeout_at(deadline, all_done).await.is_err() {
                    pf_warn!(self.me; "listeners timed out, reporting partial results");
                }
            }
            ProducerMode::NonBlocking => {
                let drain = Instant::now()
                    + Duration::from_millis(self.config.drain_ms);
                time::sleep_until(drain.min(deadline)).await;
            }
        }
        let elapsed = start.elapsed();
        let completed = listeners.iter().map(|l| l.completions()).sum::<u64>();

        let result = NtfRunResult::new(
            elapsed,
            listeners.iter().map(|l| l.received()).sum(),
            producers.iter().map(|p| p.ntf_ok()).sum(),
            producers.iter().map(|p| p.ntf_error()).sum(),
        );
        pf_info!(self.me; "finished: {} ok {} err, {} received in {} ms, {}/{} listeners completed",
                          result.producer_ok(), result.producer_error(),
                          result.listener_ok(), elapsed.as_millis(),
                          completed, input.listeners);
        Ok(result)
    }

    /// Whether a test is currently running.
    pub fn exec_status(&self) -> ExecStatus {
        ExecGuard::status(&self.executing)
    }
}
