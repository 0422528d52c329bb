//! Leadership gate and the cluster-singleton service wrapper built on it.

mod gate;
mod singleton;

pub use gate::{
    election_channel, GateRegistration, LeadershipGate, LeadershipState,
    ServiceGroupId, SingletonService,
};
pub use singleton::{SingletonRpcService, SingletonState};
