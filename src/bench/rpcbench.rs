//! RPC benchmark control surface: hosts the benchmark servers and runs
//! benchmark tests against them on request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::bench::{BenchRpcServer, BenchmarkRunResult, RpcBenchClient};
use crate::rpc::{
    Registration, RouteId, RoutedRegistration, RpcRegistry, ServiceId,
};
use crate::utils::ClusterBenchError;

use serde::{Deserialize, Serialize};

use tokio::time::Duration;

/// Service name of the global benchmark server.
pub const GLOBAL_BENCH_SERVICE: &str = "rpcbench-global";

/// Service name of the routed benchmark servers.
pub const ROUTED_BENCH_SERVICE: &str = "rpcbench-routed";

/// Route of the `i`-th routed benchmark server.
pub fn bench_route(i: usize) -> RouteId {
    format!("rpcbench-route-{}", i)
}

/// Configuration parameters struct.
#[derive(Debug, Clone)]
pub struct RpcBenchConfig {
    /// Wall-clock limit of one test run.
    pub timeout_s: u64,

    /// Number of routed benchmark servers to host.
    pub routed_servers: usize,
}

impl Default for RpcBenchConfig {
    fn default() -> Self {
        RpcBenchConfig {
            timeout_s: 300,
            routed_servers: 4,
        }
    }
}

/// Which benchmark servers a test targets.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum BenchOperation {
    Global,
    Routed,
}

/// Parameters of one benchmark test.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct StartTestInput {
    pub operation: BenchOperation,
    pub num_threads: usize,
    pub iterations: usize,
    pub payload_size: usize,
}

/// Whether a test is currently running.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum ExecStatus {
    Idle,
    Executing,
}

/// Reply of `test_status()`.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct TestStatusOutput {
    /// Calls served by the global server.
    pub global_server_cnt: u64,

    /// Calls served by all routed servers.
    pub routed_server_cnt: u64,

    pub exec_status: ExecStatus,
}

/// Holds the executing flag of a benchmark module for the length of one
/// test, resetting it on every exit path.
pub(super) struct ExecGuard<'a>(&'a AtomicBool);

impl<'a> ExecGuard<'a> {
    /// Sets the flag, or returns `None` if a test is already executing.
    pub(super) fn acquire(executing: &'a AtomicBool) -> Option<Self> {
        if executing.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(ExecGuard(executing))
        }
    }

    pub(super) fn status(executing: &AtomicBool) -> ExecStatus {
        if executing.load(Ordering::Acquire) {
            ExecStatus::Executing
        } else {
            ExecStatus::Idle
        }
    }
}

impl Drop for ExecGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The RPC benchmark module.
pub struct RpcBenchmark {
    me: String,
    registry: RpcRegistry,
    config: RpcBenchConfig,

    global_server: Arc<BenchRpcServer>,
    routed_servers: Vec<Arc<BenchRpcServer>>,
    routes: Vec<RouteId>,

    /// Registrations of the servers, released on drop.
    _global_reg: Registration,
    _routed_regs: Vec<RoutedRegistration>,

    executing: AtomicBool,
}

impl RpcBenchmark {
    /// Creates the benchmark module and registers its global server plus
    /// `routed_servers` routed servers.
    pub fn new_and_setup(
        me: impl Into<String>,
        registry: &RpcRegistry,
        config_str: Option<&str>,
    ) -> Result<Self, ClusterBenchError> {
        let me = me.into();
        let config = parsed_config!(config_str => RpcBenchConfig;
                                    timeout_s, routed_servers)?;
        if config.timeout_s == 0 {
            return logged_err!(me; "invalid config.timeout_s '{}'",
                                   config.timeout_s);
        }

        let global_server = Arc::new(BenchRpcServer::new(me.clone()));
        let global_reg = registry.register(
            ServiceId::new(GLOBAL_BENCH_SERVICE),
            global_server.clone(),
        )?;

        let mut routed_servers = Vec::with_capacity(config.routed_servers);
        let mut routed_regs = Vec::with_capacity(config.routed_servers);
        let mut routes = Vec::with_capacity(config.routed_servers);
        for i in 0..config.routed_servers {
            let server = Arc::new(BenchRpcServer::new(me.clone()));
            let route = bench_route(i);
            routed_regs.push(registry.register_routed_at(
                ServiceId::new(ROUTED_BENCH_SERVICE),
                route.clone(),
                server.clone(),
            )?);
            routed_servers.push(server);
            routes.push(route);
        }
        pf_info!(me; "rpcbench set up with 1 global and {} routed servers",
                     routed_servers.len());

        Ok(RpcBenchmark {
            me,
            registry: registry.clone(),
            config,
            global_server,
            routed_servers,
            routes,
            _global_reg: global_reg,
            _routed_regs: routed_regs,
            executing: AtomicBool::new(false),
        })
    }

    /// Runs one benchmark test. Refused if another test is executing.
    /// Server counters are reset at the start of every test.
    pub async fn start_test(
        &self,
        input: StartTestInput,
    ) -> Result<BenchmarkRunResult, ClusterBenchError> {
        let _guard = match ExecGuard::acquire(&self.executing) {
            Some(guard) => guard,
            None => return logged_err!(self.me; "a test is already executing"),
        };

        self.global_server.reset();
        for server in &self.routed_servers {
            server.reset();
        }

        let client = match input.operation {
            BenchOperation::Global => RpcBenchClient::new_global(
                self.me.clone(),
                &self.registry,
                ServiceId::new(GLOBAL_BENCH_SERVICE),
            ),
            BenchOperation::Routed => RpcBenchClient::new_routed(
                self.me.clone(),
                &self.registry,
                ServiceId::new(ROUTED_BENCH_SERVICE),
                self.routes.clone(),
            ),
        };

        Ok(client
            .run_test(
                input.iterations,
                input.num_threads,
                input.payload_size,
                Duration::from_secs(self.config.timeout_s),
            )
            .await)
    }

    /// Served call counts and execution status.
    pub fn test_status(&self) -> TestStatusOutput {
        TestStatusOutput {
            global_server_cnt: self.global_server.invocation_count(),
            routed_server_cnt: self
                .routed_servers
                .iter()
                .map(|s| s.invocation_count())
                .sum(),
            exec_status: ExecGuard::status(&self.executing),
        }
    }
}
