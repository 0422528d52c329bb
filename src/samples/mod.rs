//! Sample cluster-singleton application.

mod app;
mod hostinfo;

pub use app::{
    SampleRpc, SingletonAppProvider, GLOBAL_RPC, LOCAL_RPC, ROUTED_RPC,
    ROUTED_RPC_KEY, SAMPLE_GROUP,
};
pub use hostinfo::HostInfo;
