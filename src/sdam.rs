//! Server discovery and monitoring: the client's view of the deployment and the background task
//! that keeps it current.

mod description;
mod monitor;
mod topology;
#[cfg(test)]
mod test;

pub use self::description::{ServerDescription, ServerType, TopologyDescription, TopologyType};

pub(crate) use self::{
    monitor::{DEFAULT_HEARTBEAT_FREQUENCY, MIN_HEARTBEAT_FREQUENCY},
    topology::Topology,
};
