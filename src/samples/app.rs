//! Sample cluster-singleton application: a local RPC served on every node,
//! plus a global and a routed RPC served only by the leader.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::leadership::{
    LeadershipGate, ServiceGroupId, SingletonRpcService, SingletonState,
};
use crate::rpc::{
    Registration, RpcHandler, RpcInput, RpcOutput, RpcRegistry, RpcRequest,
    ServiceId,
};
use crate::samples::HostInfo;
use crate::utils::ClusterBenchError;

use async_trait::async_trait;

pub const SAMPLE_GROUP: &str = "singleton-app-sample";
pub const LOCAL_RPC: &str = "sample-local-rpc";
pub const GLOBAL_RPC: &str = "sample-global-rpc";
pub const ROUTED_RPC: &str = "sample-routed-rpc";

/// Route the routed sample RPC is bound to.
pub const ROUTED_RPC_KEY: &str = "rpc-key";

/// Sample RPC echoing its parameter along with host information and its own
/// invocation count.
pub struct SampleRpc {
    me: String,
    host: Arc<HostInfo>,
    invocations: AtomicU64,
}

impl SampleRpc {
    pub fn new(me: impl Into<String>, host: Arc<HostInfo>) -> Self {
        SampleRpc {
            me: me.into(),
            host,
            invocations: AtomicU64::new(0),
        }
    }

    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RpcHandler for SampleRpc {
    async fn handle(
        &self,
        req: RpcRequest,
    ) -> Result<RpcOutput, ClusterBenchError> {
        pf_debug!(self.me; "sample rpc input {:?}", req);
        let output_param = match req.input {
            RpcInput::Param { value } => value,
            _ => String::new(),
        };
        Ok(RpcOutput::Sample {
            output_param,
            invocations: self.invocations.fetch_add(1, Ordering::Relaxed) + 1,
            host_name: self.host.host_name().to_string(),
            ip_addresses: self.host.ip_addresses().to_vec(),
            uptime_ms: self.host.uptime_ms(),
        })
    }
}

/// The sample application module.
pub struct SingletonAppProvider {
    me: String,
    local_reg: Registration,
    singleton: Arc<SingletonRpcService>,
}

impl SingletonAppProvider {
    /// Registers the local RPC right away and the leader-only RPCs with the
    /// leadership gate.
    pub fn new_and_setup(
        me: impl Into<String>,
        registry: &RpcRegistry,
        gate: &LeadershipGate,
    ) -> Result<Self, ClusterBenchError> {
        let me = me.into();
        let host = Arc::new(HostInfo::collect(&me));

        let local_reg = registry.register(
            ServiceId::new(LOCAL_RPC),
            Arc::new(SampleRpc::new(me.clone(), host.clone())),
        )?;

        let singleton = SingletonRpcService::new(
            me.clone(),
            ServiceGroupId::new(SAMPLE_GROUP),
            registry.clone(),
        )
        .with_global(
            ServiceId::new(GLOBAL_RPC),
            Arc::new(SampleRpc::new(me.clone(), host.clone())),
        )
        .with_routed(
            ServiceId::new(ROUTED_RPC),
            Arc::new(SampleRpc::new(me.clone(), host)),
            vec![ROUTED_RPC_KEY.into()],
        )
        .start(gate)?;

        pf_info!(me; "singleton app sample initialized");
        Ok(SingletonAppProvider {
            me,
            local_reg,
            singleton,
        })
    }

    /// Lifecycle state of the leader-only part.
    pub fn state(&self) -> SingletonState {
        self.singleton.state()
    }

    /// Tears everything down, local RPC included.
    pub async fn close(&self) {
        self.singleton.close().await;
        self.local_reg.close();
        pf_info!(self.me; "singleton app sample closed");
    }
}
