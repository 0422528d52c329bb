//! Request/response RPC benchmark and fire-and-forget notification
//! benchmark.

mod notification;
mod ntf_listener;
mod ntf_producer;
mod ntfbench;
mod rpc_client;
mod rpc_server;
mod rpcbench;

pub use notification::{
    DeliveryFuture, ListenerRegistration, Notification, NotificationBroker,
    NotificationListener, OfferResult,
};
pub use ntf_listener::NtfBenchListener;
pub use ntf_producer::{NtfBenchProducer, ProducerMode};
pub use ntfbench::{NtfBenchConfig, NtfBenchmark, NtfRunResult, NtfStartTestInput};
pub use rpc_client::{BenchmarkRunResult, RpcBenchClient};
pub use rpc_server::BenchRpcServer;
pub use rpcbench::{
    bench_route, BenchOperation, ExecStatus, RpcBenchConfig, RpcBenchmark,
    StartTestInput, TestStatusOutput, GLOBAL_BENCH_SERVICE,
    ROUTED_BENCH_SERVICE,
};
