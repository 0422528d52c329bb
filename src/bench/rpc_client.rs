//! Benchmark RPC client driver: concurrent workers issuing sequential calls
//! through their own invokers, with results aggregated into a run summary.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::rpc::{
    make_payload, PayloadItem, RouteId, RpcInput, RpcInvoker, RpcOutput,
    RpcRegistry, RpcRequest, ServiceId,
};
use crate::utils::lock;

use futures::future::{self, FutureExt};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use serde::{Deserialize, Serialize};

use statistical::{mean, standard_deviation};

use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};

/// Summary of one benchmark run.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct BenchmarkRunResult {
    elapsed: Duration,
    ok: u64,
    error: u64,
    rate: f64,
    lat_mean_us: f64,
    lat_stdev_us: f64,
}

impl BenchmarkRunResult {
    /// Computes the summary from raw counts and per-call latencies (us).
    pub fn new(elapsed: Duration, ok: u64, error: u64, lats: &[f64]) -> Self {
        let secs = elapsed.as_secs_f64();
        let rate = if secs > 0.0 {
            (ok + error) as f64 / secs
        } else {
            0.0
        };
        let lat_mean_us = if lats.is_empty() { 0.0 } else { mean(lats) };
        let lat_stdev_us = if lats.len() < 2 {
            0.0
        } else {
            standard_deviation(lats, Some(lat_mean_us))
        };

        BenchmarkRunResult {
            elapsed,
            ok,
            error,
            rate,
            lat_mean_us,
            lat_stdev_us,
        }
    }

    /// Result of a run that issued no calls.
    pub fn zero() -> Self {
        Self::new(Duration::ZERO, 0, 0, &[])
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed.as_millis() as u64
    }

    pub fn ok(&self) -> u64 {
        self.ok
    }

    pub fn error(&self) -> u64 {
        self.error
    }

    /// Calls per second, successful or not.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn lat_mean_us(&self) -> f64 {
        self.lat_mean_us
    }

    pub fn lat_stdev_us(&self) -> f64 {
        self.lat_stdev_us
    }
}

/// Per-worker counters, updated as soon as each call completes so that a
/// timed-out run can still report what was done.
#[derive(Default)]
struct WorkerStats {
    ok: AtomicU64,
    error: AtomicU64,
    lats: Mutex<Vec<f64>>,
}

impl WorkerStats {
    fn record(&self, ok: bool, lat: Duration) {
        if ok {
            self.ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.error.fetch_add(1, Ordering::Relaxed);
        }
        lock(&self.lats).push(lat.as_micros() as f64);
    }
}

/// Benchmark driver against one service, either its global implementation
/// or a set of routes picked at random per call. Every worker dispatches
/// through an invoker of its own.
pub struct RpcBenchClient {
    me: String,
    registry: RpcRegistry,
    service: ServiceId,
    routes: Arc<Vec<RouteId>>,
}

impl RpcBenchClient {
    /// Creates a driver for the global implementation of `service`.
    pub fn new_global(
        me: impl Into<String>,
        registry: &RpcRegistry,
        service: ServiceId,
    ) -> Self {
        Self::new_routed(me, registry, service, vec![])
    }

    /// Creates a driver spreading calls over `routes` of `service`. With no
    /// routes, calls go to the global implementation.
    pub fn new_routed(
        me: impl Into<String>,
        registry: &RpcRegistry,
        service: ServiceId,
        routes: Vec<RouteId>,
    ) -> Self {
        RpcBenchClient {
            me: me.into(),
            registry: registry.clone(),
            service,
            routes: Arc::new(routes),
        }
    }

    /// Runs `concurrency` workers doing `iterations` calls each, with
    /// payloads of `payload_size` items. Waits at most `timeout`; on timeout
    /// the workers are aborted and whatever they recorded is reported.
    pub async fn run_test(
        &self,
        iterations: usize,
        concurrency: usize,
        payload_size: usize,
        timeout: Duration,
    ) -> BenchmarkRunResult {
        if iterations == 0 || concurrency == 0 {
            return BenchmarkRunResult::zero();
        }
        pf_info!(self.me; "starting {} workers x {} calls of {} items",
                          concurrency, iterations, payload_size);

        let stats: Vec<Arc<WorkerStats>> = (0..concurrency)
            .map(|_| Arc::new(WorkerStats::default()))
            .collect();

        let start = Instant::now();
        let mut handles: Vec<JoinHandle<()>> = stats
            .iter()
            .map(|s| {
                tokio::spawn(Self::worker_task(
                    self.me.clone(),
                    self.registry.invoker(),
                    self.service.clone(),
                    self.routes.clone(),
                    iterations,
                    make_payload(payload_size),
                    s.clone(),
                ))
            })
            .collect();

        match time::timeout(timeout, future::join_all(handles.iter_mut()))
            .await
        {
            Ok(results) => {
                for res in results {
                    if let Err(e) = res {
                        pf_error!(self.me; "worker task failed: {}", e);
                    }
                }
            }
            Err(_) => {
                pf_warn!(self.me; "benchmark timed out after {:?}, reporting partial results",
                                  timeout);
            }
        }
        let elapsed = start.elapsed();

        // snapshot before aborting so late completions do not count
        let (mut ok, mut error) = (0, 0);
        let mut lats = Vec::with_capacity(iterations * concurrency);
        for s in &stats {
            ok += s.ok.load(Ordering::Relaxed);
            error += s.error.load(Ordering::Relaxed);
            lats.extend(lock(&s.lats).iter().copied());
        }
        for h in &handles {
            h.abort();
        }

        let result = BenchmarkRunResult::new(elapsed, ok, error, &lats);
        pf_info!(self.me; "finished: ok {} err {} in {} ms, {:.1} calls/s",
                          result.ok(), result.error(),
                          result.elapsed_ms(), result.rate());
        result
    }

    /// One benchmark worker; call i+1 is issued only after call i completed.
    async fn worker_task(
        me: String,
        invoker: RpcInvoker,
        service: ServiceId,
        routes: Arc<Vec<RouteId>>,
        iterations: usize,
        payload: Vec<PayloadItem>,
        stats: Arc<WorkerStats>,
    ) {
        let mut rng = StdRng::from_entropy();
        for _ in 0..iterations {
            let input = RpcInput::Payload {
                items: payload.clone(),
            };
            let req = if routes.is_empty() {
                RpcRequest::global(input)
            } else {
                let route = &routes[rng.gen_range(0..routes.len())];
                RpcRequest::routed(route.clone(), input)
            };

            // a panicking handler counts as a failed call
            let start = Instant::now();
            let call = AssertUnwindSafe(invoker.invoke(&service, req));
            let ok = match call.catch_unwind().await {
                Ok(Ok(RpcOutput::Payload { items })) => {
                    items.len() == payload.len()
                }
                Ok(_) => false,
                Err(_) => {
                    pf_warn!(me; "rpc handler of '{}' panicked", service);
                    false
                }
            };
            stats.record(ok, start.elapsed());
        }
    }
}
