//! Local RPC registry, dispatch transport, and message records.

mod messages;
mod registry;

pub use messages::{
    make_payload, PayloadItem, RouteId, RpcInput, RpcOutput, RpcRequest,
    ServiceId,
};
pub use registry::{
    HandlerRef, Registration, RoutedRegistration, RpcHandler, RpcInvoker,
    RpcRegistry,
};
