//! Leadership-gated periodic discovery.

mod scheduler;
mod topology;

pub use scheduler::{ScheduledTask, TaskScheduler};
pub use topology::{
    DiscoveryConfig, TopologyDiscoveryContext, TopologyDiscoveryRpc,
    DISCOVERY_SERVICE,
};
