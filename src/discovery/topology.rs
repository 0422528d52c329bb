//! Leader-only periodic topology discovery of one device node.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::discovery::{ScheduledTask, TaskScheduler};
use crate::leadership::{
    GateRegistration, LeadershipGate, ServiceGroupId, SingletonService,
};
use crate::rpc::{
    RouteId, RpcHandler, RpcInput, RpcOutput, RpcRegistry, RpcRequest,
    ServiceId,
};
use crate::utils::{lock, ClusterBenchError};

use async_trait::async_trait;

use futures::future::{self, BoxFuture, FutureExt};

use tokio::time::Duration;

/// Service name of the routed discovery RPC.
pub const DISCOVERY_SERVICE: &str = "topology-discovery";

/// Configuration parameters struct.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Delay between the end of one probe and the start of the next.
    pub delay_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig { delay_ms: 10000 }
    }
}

/// Routed RPC answering discovery probes for one device node.
pub struct TopologyDiscoveryRpc {
    node: RouteId,
    probes: AtomicU64,
}

impl TopologyDiscoveryRpc {
    pub fn new(node: impl Into<RouteId>) -> Self {
        TopologyDiscoveryRpc {
            node: node.into(),
            probes: AtomicU64::new(0),
        }
    }

    pub fn probes(&self) -> u64 {
        self.probes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RpcHandler for TopologyDiscoveryRpc {
    async fn handle(
        &self,
        req: RpcRequest,
    ) -> Result<RpcOutput, ClusterBenchError> {
        match req.input {
            RpcInput::Discover => {
                let probes = self.probes.fetch_add(1, Ordering::Relaxed) + 1;
                Ok(RpcOutput::Discovered {
                    node: self.node.clone(),
                    probes,
                })
            }
            other => Err(ClusterBenchError::msg(format!(
                "unexpected discovery input {:?}",
                other
            ))),
        }
    }
}

/// Outcome counters of discovery probes.
#[derive(Default)]
struct ProbeStats {
    ok: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

/// Singleton service probing the discovery RPC of one node at a fixed delay
/// while this node is leader.
pub struct TopologyDiscoveryContext {
    me: String,
    node: RouteId,
    registry: RpcRegistry,
    scheduler: TaskScheduler,
    config: DiscoveryConfig,
    stats: Arc<ProbeStats>,

    /// Recurring probe task, present only while leader.
    task: Mutex<Option<ScheduledTask>>,

    gate_reg: Mutex<Option<GateRegistration>>,
}

impl TopologyDiscoveryContext {
    /// Creates an idle discovery context for device `node`.
    pub fn new(
        me: impl Into<String>,
        node: impl Into<RouteId>,
        registry: &RpcRegistry,
        config_str: Option<&str>,
    ) -> Result<Self, ClusterBenchError> {
        let me = me.into();
        let config = parsed_config!(config_str => DiscoveryConfig;
                                    delay_ms)?;
        if config.delay_ms == 0 {
            return logged_err!(me; "invalid config.delay_ms '{}'",
                                   config.delay_ms);
        }

        Ok(TopologyDiscoveryContext {
            scheduler: TaskScheduler::new(me.clone()),
            me,
            node: node.into(),
            registry: registry.clone(),
            config,
            stats: Arc::new(ProbeStats::default()),
            task: Mutex::new(None),
            gate_reg: Mutex::new(None),
        })
    }

    /// Registers the context with a leadership gate.
    pub fn start(
        self,
        gate: &LeadershipGate,
    ) -> Result<Arc<Self>, ClusterBenchError> {
        let ctx = Arc::new(self);
        let reg = gate.register(ctx.clone())?;
        *lock(&ctx.gate_reg) = Some(reg);
        Ok(ctx)
    }

    /// Stops probing and unregisters from the gate, logging any error.
    pub async fn close(&self) {
        if let Err(e) = self.close_service_instance().await {
            pf_warn!(self.me; "error stopping discovery of '{}': {}", self.node, e);
        }
        let reg = lock(&self.gate_reg).take();
        if let Some(reg) = reg {
            if let Err(e) = reg.close() {
                pf_warn!(self.me; "unexpected error closing gate registration of '{}': {}",
                                  self.node, e);
            }
        }
    }

    /// Probes answered.
    pub fn probes_ok(&self) -> u64 {
        self.stats.ok.load(Ordering::Acquire)
    }

    /// Probes skipped because no discovery RPC was bound for the node.
    pub fn probes_skipped(&self) -> u64 {
        self.stats.skipped.load(Ordering::Acquire)
    }

    /// Probes that reached the RPC but failed.
    pub fn probes_failed(&self) -> u64 {
        self.stats.failed.load(Ordering::Acquire)
    }

    /// Total discovery firings across all leadership terms.
    pub fn firings(&self) -> u64 {
        self.probes_ok() + self.probes_skipped() + self.probes_failed()
    }

    /// Returns true while a probe task is scheduled.
    pub fn is_active(&self) -> bool {
        lock(&self.task).is_some()
    }
}

impl SingletonService for TopologyDiscoveryContext {
    fn group(&self) -> ServiceGroupId {
        ServiceGroupId::new(format!("{}-{}", DISCOVERY_SERVICE, self.node))
    }

    fn instantiate_service_instance(&self) {
        let mut task = lock(&self.task);
        assert!(
            task.is_none(),
            "({}) discovery of '{}' already active",
            self.me,
            self.node
        );

        let me = self.me.clone();
        let node = self.node.clone();
        let stats = self.stats.clone();
        let invoker = self.registry.invoker();
        let service = ServiceId::new(DISCOVERY_SERVICE);
        let work = move || -> BoxFuture<'static, ()> {
            let handler = match invoker.lookup_routed(&service, &node) {
                Some(handler) => handler,
                None => {
                    pf_trace!(me; "no discovery rpc for '{}', skipping", node);
                    stats.skipped.fetch_add(1, Ordering::AcqRel);
                    return future::ready(()).boxed();
                }
            };
            let (me, node, stats) = (me.clone(), node.clone(), stats.clone());
            async move {
                let req = RpcRequest::routed(node.clone(), RpcInput::Discover);
                match handler.handle(req).await {
                    Ok(_) => {
                        stats.ok.fetch_add(1, Ordering::AcqRel);
                    }
                    Err(e) => {
                        pf_warn!(me; "discovery of '{}' failed: {}", node, e);
                        stats.failed.fetch_add(1, Ordering::AcqRel);
                    }
                }
            }
            .boxed()
        };

        match self.scheduler.schedule_fixed_delay(
            Duration::from_millis(self.config.delay_ms),
            work,
        ) {
            Ok(scheduled) => {
                pf_info!(self.me; "started discovery of '{}'", self.node);
                *task = Some(scheduled);
            }
            Err(e) => {
                pf_error!(self.me; "failed to schedule discovery of '{}': {}",
                                   self.node, e);
            }
        }
    }

    fn close_service_instance(
        &self,
    ) -> BoxFuture<'static, Result<(), ClusterBenchError>> {
        if let Some(task) = lock(&self.task).take() {
            task.cancel();
            pf_info!(self.me; "stopped discovery of '{}' after {} firings",
                              self.node, task.fired());
        }
        future::ready(Ok(())).boxed()
    }
}
