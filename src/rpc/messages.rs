//! RPC identities and request/reply records.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of an RPC service contract.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Serialize, Deserialize)]
pub struct ServiceId(String);

impl ServiceId {
    /// Creates a service identity from its name.
    pub fn new(name: impl Into<String>) -> Self {
        ServiceId(name.into())
    }

    /// Name of the service contract.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Route key of a routed RPC, e.g. a device node name.
pub type RouteId = String;

/// One opaque element of a benchmark payload.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub struct PayloadItem {
    pub id: u32,
}

/// Builds a payload of `size` items with ids `0..size`.
pub fn make_payload(size: usize) -> Vec<PayloadItem> {
    (0..size as u32).map(|id| PayloadItem { id }).collect()
}

/// Input record of an RPC call.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum RpcInput {
    /// Benchmark payload, expected to be echoed back.
    Payload { items: Vec<PayloadItem> },

    /// Free-form parameter taken by the singleton sample services.
    Param { value: String },

    /// Topology discovery probe of the routed node.
    Discover,
}

/// Output record of a successful RPC call.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub enum RpcOutput {
    /// Echoed benchmark payload.
    Payload { items: Vec<PayloadItem> },

    /// Reply of a singleton sample service.
    Sample {
        output_param: String,
        invocations: u64,
        host_name: String,
        ip_addresses: Vec<String>,
        uptime_ms: u64,
    },

    /// Reply of a topology discovery probe.
    Discovered { node: RouteId, probes: u64 },
}

/// RPC call request. `route` selects a routed implementation; `None` means
/// the global one.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub route: Option<RouteId>,
    pub input: RpcInput,
}

impl RpcRequest {
    /// Request to the global implementation.
    pub fn global(input: RpcInput) -> Self {
        RpcRequest { route: None, input }
    }

    /// Request to the implementation bound to `route`.
    pub fn routed(route: impl Into<RouteId>, input: RpcInput) -> Self {
        RpcRequest {
            route: Some(route.into()),
            input,
        }
    }
}

#[cfg(test)]
mod messages_tests {
    use super::*;

    #[test]
    fn payload_ids_in_order() {
        let items = make_payload(4);
        assert_eq!(items.len(), 4);
        assert_eq!(items[0], PayloadItem { id: 0 });
        assert_eq!(items[3], PayloadItem { id: 3 });
        assert!(make_payload(0).is_empty());
    }

    #[test]
    fn request_routing() {
        let g = RpcRequest::global(RpcInput::Discover);
        assert_eq!(g.route, None);
        let r = RpcRequest::routed("node-1", RpcInput::Discover);
        assert_eq!(r.route.as_deref(), Some("node-1"));
    }
}
