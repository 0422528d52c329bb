//! Cluster-singleton-gated RPC and notification services with
//! request/response and publish/subscribe benchmarking.
//!
//! RPC handlers live in an in-process registry; singleton services expose
//! theirs only while this node is leader, as told by an external election
//! through a leadership gate.

#[macro_use]
mod utils;

pub mod bench;
pub mod discovery;
pub mod leadership;
pub mod rpc;
pub mod samples;

pub use utils::{logger_init, ClusterBenchError, Timer};

pub use bench::{
    BenchOperation, BenchmarkRunResult, ExecStatus, NtfBenchmark,
    NtfRunResult, NtfStartTestInput, ProducerMode, RpcBenchmark,
    StartTestInput, TestStatusOutput,
};
pub use discovery::{ScheduledTask, TaskScheduler, TopologyDiscoveryContext};
pub use leadership::{
    election_channel, LeadershipGate, LeadershipState, ServiceGroupId,
    SingletonRpcService, SingletonService, SingletonState,
};
pub use rpc::{
    RpcHandler, RpcInput, RpcInvoker, RpcOutput, RpcRegistry, RpcRequest,
    ServiceId,
};
pub use samples::SingletonAppProvider;
