//! Cluster-singleton RPC service wrapper: exposes RPC handlers through the
//! registry only while this node is leader of the service group.

use std::sync::{Arc, Mutex};

use crate::leadership::{
    GateRegistration, LeadershipGate, ServiceGroupId, SingletonService,
};
use crate::rpc::{
    HandlerRef, Registration, RouteId, RoutedRegistration, RpcRegistry,
    ServiceId,
};
use crate::utils::{lock, ClusterBenchError};

use futures::future::{self, BoxFuture, FutureExt};

use serde::{Deserialize, Serialize};

/// Lifecycle state of a singleton wrapper.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum SingletonState {
    /// Not registered with any gate.
    Idle,

    /// Registered with a gate, no handler exposed.
    RegisteredFollower,

    /// Leader; handlers exposed.
    ActiveLeader,
}

/// Registrations held while active.
#[derive(Default)]
struct ActiveRegs {
    active: bool,
    global: Option<Registration>,
    routed: Option<RoutedRegistration>,
}

/// Global handler to expose while leader.
struct GlobalRpc {
    service: ServiceId,
    handler: HandlerRef,
}

/// Routed handler and its routes to expose while leader.
struct RoutedRpc {
    service: ServiceId,
    handler: HandlerRef,
    routes: Vec<RouteId>,
}

/// A cluster-singleton wrapper around a global and/or a routed RPC handler.
pub struct SingletonRpcService {
    me: String,
    group: ServiceGroupId,
    registry: RpcRegistry,
    global: Option<GlobalRpc>,
    routed: Option<RoutedRpc>,

    /// Transition fields; instantiate and close may come from any thread.
    regs: Mutex<ActiveRegs>,

    /// Registration with the leadership gate, `None` while idle.
    gate_reg: Mutex<Option<GateRegistration>>,
}

impl SingletonRpcService {
    /// Creates an idle wrapper exposing nothing yet.
    pub fn new(
        me: impl Into<String>,
        group: ServiceGroupId,
        registry: RpcRegistry,
    ) -> Self {
        SingletonRpcService {
            me: me.into(),
            group,
            registry,
            global: None,
            routed: None,
            regs: Mutex::new(ActiveRegs::default()),
            gate_reg: Mutex::new(None),
        }
    }

    /// Sets the global handler to expose while leader.
    pub fn with_global(mut self, service: ServiceId, handler: HandlerRef) -> Self {
        self.global = Some(GlobalRpc { service, handler });
        self
    }

    /// Sets the routed handler and the routes to bind it to while leader.
    pub fn with_routed(
        mut self,
        service: ServiceId,
        handler: HandlerRef,
        routes: Vec<RouteId>,
    ) -> Self {
        self.routed = Some(RoutedRpc {
            service,
            handler,
            routes,
        });
        self
    }

    /// Registers the wrapper with a leadership gate, entering
    /// `RegisteredFollower` (or `ActiveLeader` shortly after if this node is
    /// already leader).
    pub fn start(
        self,
        gate: &LeadershipGate,
    ) -> Result<Arc<Self>, ClusterBenchError> {
        let service = Arc::new(self);
        let reg = gate.register(service.clone())?;
        *lock(&service.gate_reg) = Some(reg);
        pf_info!(service.me; "singleton '{}' registered", service.group);
        Ok(service)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SingletonState {
        if lock(&self.regs).active {
            SingletonState::ActiveLeader
        } else if lock(&self.gate_reg).is_some() {
            SingletonState::RegisteredFollower
        } else {
            SingletonState::Idle
        }
    }

    /// Explicit teardown back to `Idle`. Closes the gate registration,
    /// logging and swallowing any error, then releases the instance if still
    /// active. Never fails.
    pub async fn close(&self) {
        let reg = lock(&self.gate_reg).take();
        if let Some(reg) = reg {
            if let Err(e) = reg.close() {
                pf_warn!(self.me; "unexpected error closing gate registration of '{}': {}",
                                  self.group, e);
            }
        }
        if let Err(e) = self.close_service_instance().await {
            pf_warn!(self.me; "error releasing '{}': {}", self.group, e);
        }
        pf_info!(self.me; "singleton '{}' closed", self.group);
    }
}

impl SingletonService for SingletonRpcService {
    fn group(&self) -> ServiceGroupId {
        self.group.clone()
    }

    fn instantiate_service_instance(&self) {
        let mut regs = lock(&self.regs);
        assert!(
            !regs.active && regs.global.is_none() && regs.routed.is_none(),
            "({}) instance of '{}' already active",
            self.me,
            self.group
        );
        pf_info!(self.me; "instantiating '{}' as leader", self.group);

        if let Some(rpc) = &self.global {
            match self
                .registry
                .register(rpc.service.clone(), rpc.handler.clone())
            {
                Ok(reg) => regs.global = Some(reg),
                Err(e) => pf_error!(self.me; "failed to expose '{}': {}",
                                             rpc.service, e),
            }
        }

        if let Some(rpc) = &self.routed {
            let routed = self
                .registry
                .register_routed(rpc.service.clone(), rpc.handler.clone());
            for route in &rpc.routes {
                if let Err(e) = routed.register_path(route.clone()) {
                    pf_error!(self.me; "failed to bind route '{}' of '{}': {}",
                                       route, rpc.service, e);
                }
            }
            regs.routed = Some(routed);
        }

        regs.active = true;
    }

    fn close_service_instance(
        &self,
    ) -> BoxFuture<'static, Result<(), ClusterBenchError>> {
        let mut regs = lock(&self.regs);
        if regs.active {
            pf_info!(self.me; "closing instance of '{}'", self.group);
        }

        if let Some(routed) = regs.routed.take() {
            for route in routed.paths() {
                routed.unregister_path(&route);
            }
            routed.close();
        }
        if let Some(global) = regs.global.take() {
            global.close();
        }
        regs.active = false;

        // cleanup is synchronous
        future::ready(Ok(())).boxed()
    }
}

#[cfg(test)]
mod singleton_tests {
    use super::*;
    use crate::leadership::{election_channel, LeadershipState};
    use crate::rpc::{RpcHandler, RpcInput, RpcOutput, RpcRequest};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::time::{self, Duration};

    struct ParamEcho;

    #[async_trait]
    impl RpcHandler for ParamEcho {
        async fn handle(
            &self,
            req: RpcRequest,
        ) -> Result<RpcOutput, ClusterBenchError> {
            match req.input {
                RpcInput::Param { value } => Ok(RpcOutput::Sample {
                    output_param: value,
                    invocations: 1,
                    host_name: "h".into(),
                    ip_addresses: vec![],
                    uptime_ms: 0,
                }),
                _ => Err(ClusterBenchError::msg("unexpected input")),
            }
        }
    }

    fn wrapper(registry: &RpcRegistry) -> SingletonRpcService {
        SingletonRpcService::new(
            "s",
            ServiceGroupId::new("sample"),
            registry.clone(),
        )
        .with_global(ServiceId::new("global-rpc"), Arc::new(ParamEcho))
        .with_routed(
            ServiceId::new("routed-rpc"),
            Arc::new(ParamEcho),
            vec!["rpc-key".into()],
        )
    }

    #[test]
    #[should_panic(expected = "already active")]
    fn instantiate_twice_panics() {
        let registry = RpcRegistry::new("r");
        let svc = wrapper(&registry);
        svc.instantiate_service_instance();
        svc.instantiate_service_instance();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_is_reentrant() -> Result<(), ClusterBenchError> {
        let registry = RpcRegistry::new("r");
        let svc = wrapper(&registry);
        svc.instantiate_service_instance();
        assert!(registry.lookup(&ServiceId::new("global-rpc")).is_some());
        svc.close_service_instance().await?;
        svc.close_service_instance().await?;
        assert!(registry.lookup(&ServiceId::new("global-rpc")).is_none());
        assert!(registry
            .lookup_routed(&ServiceId::new("routed-rpc"), "rpc-key")
            .is_none());
        // may become leader again after a close
        svc.instantiate_service_instance();
        assert!(registry.lookup(&ServiceId::new("global-rpc")).is_some());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn lifecycle_through_gate() -> Result<(), ClusterBenchError> {
        let registry = RpcRegistry::new("r");
        let (tx_elect, rx_elect) = election_channel();
        let gate = LeadershipGate::new_and_setup("g", rx_elect).await?;
        let svc = wrapper(&registry).start(&gate)?;
        assert_eq!(svc.state(), SingletonState::RegisteredFollower);
        assert!(registry.lookup(&ServiceId::new("global-rpc")).is_none());

        tx_elect.send(LeadershipState::Leader)?;
        gate.wait_for_state(LeadershipState::Leader).await?;
        assert_eq!(svc.state(), SingletonState::ActiveLeader);
        let out = registry
            .invoker()
            .invoke(
                &ServiceId::new("routed-rpc"),
                RpcRequest::routed(
                    "rpc-key",
                    RpcInput::Param { value: "x".into() },
                ),
            )
            .await?;
        assert!(matches!(out, RpcOutput::Sample { output_param, .. } if output_param == "x"));

        tx_elect.send(LeadershipState::Follower)?;
        gate.wait_for_state(LeadershipState::Follower).await?;
        assert_eq!(svc.state(), SingletonState::RegisteredFollower);
        assert!(registry.lookup(&ServiceId::new("global-rpc")).is_none());

        svc.close().await;
        assert_eq!(svc.state(), SingletonState::Idle);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn drop_while_leader_releases() -> Result<(), ClusterBenchError> {
        let registry = RpcRegistry::new("r");
        let (tx_elect, rx_elect) = election_channel();
        let gate = LeadershipGate::new_and_setup("g", rx_elect).await?;
        let svc = wrapper(&registry).start(&gate)?;
        tx_elect.send(LeadershipState::Leader)?;
        gate.wait_for_state(LeadershipState::Leader).await?;
        assert!(registry.lookup(&ServiceId::new("global-rpc")).is_some());

        // no close(); dropping the owners must release everything
        let weak = Arc::downgrade(&svc);
        drop(svc);
        drop(gate);
        assert!(weak.upgrade().is_none());
        assert!(registry.lookup(&ServiceId::new("global-rpc")).is_none());
        assert!(registry
            .lookup_routed(&ServiceId::new("routed-rpc"), "rpc-key")
            .is_none());

        // gate thread ends, releasing the election receiver
        for _ in 0..100 {
            if tx_elect.is_closed() {
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        assert!(tx_elect.is_closed());
        Ok(())
    }

    /// Panics when instantiated, taking the gate thread down with it.
    struct Faulty(AtomicU64);

    impl SingletonService for Faulty {
        fn group(&self) -> ServiceGroupId {
            ServiceGroupId::new("faulty")
        }

        fn instantiate_service_instance(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
            panic!("faulty instantiation");
        }

        fn close_service_instance(
            &self,
        ) -> BoxFuture<'static, Result<(), ClusterBenchError>> {
            future::ready(Ok(())).boxed()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_swallows_gate_errors() -> Result<(), ClusterBenchError> {
        let registry = RpcRegistry::new("r");
        let (tx_elect, rx_elect) = election_channel();
        let gate = LeadershipGate::new_and_setup("g", rx_elect).await?;
        let svc = wrapper(&registry).start(&gate)?;
        let faulty = Arc::new(Faulty(AtomicU64::new(0)));
        let _faulty_reg = gate.register(faulty.clone())?;

        tx_elect.send(LeadershipState::Leader)?;
        for _ in 0..100 {
            if faulty.0.load(Ordering::SeqCst) > 0 {
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(svc.state(), SingletonState::ActiveLeader);

        // gate thread is gone; teardown must still complete
        svc.close().await;
        assert_eq!(svc.state(), SingletonState::Idle);
        assert!(registry.lookup(&ServiceId::new("global-rpc")).is_none());
        Ok(())
    }
}
