use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use rand::seq::IndexedRandom;

use crate::{
    error::Error,
    hello::HelloReply,
    options::ServerAddress,
    selection_criteria::{ReadPreference, SelectionCriteria},
};

const DEFAULT_LOCAL_THRESHOLD: Duration = Duration::from_millis(15);

/// Enum representing the possible types of servers that the driver can connect to.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
#[non_exhaustive]
pub enum ServerType {
    /// A single, non-replica set mongod.
    Standalone,

    /// A router used in sharded deployments.
    Mongos,

    /// The primary node in a replica set.
    RsPrimary,

    /// A secondary node in a replica set.
    RsSecondary,

    /// A non-data bearing node in a replica set which can participate in elections.
    RsArbiter,

    /// Hidden, starting up, or recovering nodes in a replica set.
    RsOther,

    /// A member of an uninitialized replica set or a member that has been removed from the replica
    /// set config.
    RsGhost,

    /// A server that the driver hasn't yet communicated with or can't connect to.
    #[default]
    Unknown,
}

impl ServerType {
    pub(crate) fn is_data_bearing(self) -> bool {
        matches!(
            self,
            ServerType::Standalone
                | ServerType::RsPrimary
                | ServerType::RsSecondary
                | ServerType::Mongos
        )
    }

    fn is_replica_set_member(self) -> bool {
        matches!(
            self,
            ServerType::RsPrimary
                | ServerType::RsSecondary
                | ServerType::RsArbiter
                | ServerType::RsOther
        )
    }
}

/// The possible types for a topology.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
#[non_exhaustive]
pub enum TopologyType {
    /// A single mongod server.
    Single,

    /// A replica set with no primary.
    ReplicaSetNoPrimary,

    /// A replica set with a primary.
    ReplicaSetWithPrimary,

    /// A sharded topology.
    Sharded,

    /// A topology whose type is not known.
    #[default]
    Unknown,
}

/// A description of the most up-to-date information known about a server.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ServerDescription {
    pub(crate) address: ServerAddress,
    pub(crate) server_type: ServerType,
    pub(crate) round_trip_time: Option<Duration>,
    pub(crate) set_name: Option<String>,
    pub(crate) hosts: Vec<ServerAddress>,
    pub(crate) max_wire_version: Option<i32>,
    pub(crate) error: Option<Error>,
}

impl PartialEq for ServerDescription {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
            && self.server_type == other.server_type
            && self.set_name == other.set_name
            && self.hosts == other.hosts
            && self.max_wire_version == other.max_wire_version
            && self.error.as_ref().map(ToString::to_string)
                == other.error.as_ref().map(ToString::to_string)
    }
}

impl ServerDescription {
    /// A server that has not been checked yet.
    pub(crate) fn new(address: ServerAddress) -> Self {
        Self {
            address,
            server_type: ServerType::Unknown,
            round_trip_time: None,
            set_name: None,
            hosts: Vec::new(),
            max_wire_version: None,
            error: None,
        }
    }

    pub(crate) fn from_hello_reply(reply: &HelloReply) -> Self {
        let response = &reply.command_response;
        Self {
            address: reply.server_address.clone(),
            server_type: response.server_type(),
            round_trip_time: Some(reply.round_trip_time),
            set_name: response.set_name.clone(),
            hosts: response
                .all_hosts()
                .filter_map(|host| ServerAddress::parse(host).ok())
                .collect(),
            max_wire_version: response.max_wire_version,
            error: None,
        }
    }

    /// A server that could not be reached, or whose connection failed mid-operation.
    pub(crate) fn with_error(address: ServerAddress, error: Error) -> Self {
        Self {
            error: Some(error),
            ..Self::new(address)
        }
    }

    /// The address of the server.
    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// The type of the server.
    pub fn server_type(&self) -> ServerType {
        self.server_type
    }

    /// The round trip time of the most recent heartbeat.
    pub fn round_trip_time(&self) -> Option<Duration> {
        self.round_trip_time
    }

    /// The name of the replica set the server belongs to, if any.
    pub fn set_name(&self) -> Option<&str> {
        self.set_name.as_deref()
    }

    /// The other members the server reported, if it is a replica set member.
    pub fn hosts(&self) -> &[ServerAddress] {
        &self.hosts
    }

    /// The error from the last failed check, if the server is unreachable.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    pub(crate) fn is_available(&self) -> bool {
        self.server_type != ServerType::Unknown
    }
}

/// An immutable snapshot of the deployment as the client currently sees it.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub struct TopologyDescription {
    pub(crate) topology_type: TopologyType,
    pub(crate) set_name: Option<String>,
    pub(crate) servers: HashMap<ServerAddress, ServerDescription>,
}

impl TopologyDescription {
    pub(crate) fn new(hosts: &[ServerAddress]) -> Self {
        Self {
            topology_type: TopologyType::Unknown,
            set_name: None,
            servers: hosts
                .iter()
                .map(|address| (address.clone(), ServerDescription::new(address.clone())))
                .collect(),
        }
    }

    /// The type of the deployment.
    pub fn topology_type(&self) -> TopologyType {
        self.topology_type
    }

    /// The replica set name, once discovered.
    pub fn set_name(&self) -> Option<&str> {
        self.set_name.as_deref()
    }

    /// The known servers.
    pub fn servers(&self) -> impl Iterator<Item = &ServerDescription> {
        self.servers.values()
    }

    /// The description of the server at `address`, if it is part of the topology.
    pub fn server(&self, address: &ServerAddress) -> Option<&ServerDescription> {
        self.servers.get(address)
    }

    pub(crate) fn server_addresses(&self) -> HashSet<ServerAddress> {
        self.servers.keys().cloned().collect()
    }

    /// Whether every known server failed its last check.
    pub(crate) fn all_servers_errored(&self) -> bool {
        !self.servers.is_empty() && self.servers.values().all(|s| s.error.is_some())
    }

    /// Applies a fresh server description, adding or removing servers as the description
    /// dictates. Descriptions for servers no longer part of the topology are ignored.
    pub(crate) fn update(&mut self, description: ServerDescription) {
        if !self.servers.contains_key(&description.address) {
            return;
        }

        match self.topology_type {
            TopologyType::Single => {}
            TopologyType::Unknown => match description.server_type {
                ServerType::Standalone if self.servers.len() == 1 => {
                    self.topology_type = TopologyType::Single;
                }
                ServerType::Standalone => {
                    self.servers.remove(&description.address);
                    return;
                }
                ServerType::Mongos => self.topology_type = TopologyType::Sharded,
                server_type if server_type.is_replica_set_member() => {
                    self.topology_type = TopologyType::ReplicaSetNoPrimary;
                    self.set_name = description.set_name.clone();
                }
                _ => {}
            },
            TopologyType::Sharded => {
                if !matches!(
                    description.server_type,
                    ServerType::Mongos | ServerType::Unknown
                ) {
                    self.servers.remove(&description.address);
                    return;
                }
            }
            TopologyType::ReplicaSetNoPrimary | TopologyType::ReplicaSetWithPrimary => {
                if matches!(
                    description.server_type,
                    ServerType::Standalone | ServerType::Mongos
                ) || (description.server_type.is_replica_set_member()
                    && description.set_name != self.set_name)
                {
                    self.servers.remove(&description.address);
                    self.update_replica_set_type();
                    return;
                }
            }
        }

        if description.server_type.is_replica_set_member() {
            self.add_hosts(&description);
        }
        if description.server_type == ServerType::RsPrimary {
            // A primary's member list is authoritative, and there can only be one primary.
            let members: HashSet<&ServerAddress> = description
                .hosts
                .iter()
                .chain(std::iter::once(&description.address))
                .collect();
            self.servers.retain(|address, _| members.contains(address));
            for server in self.servers.values_mut() {
                if server.server_type == ServerType::RsPrimary
                    && server.address != description.address
                {
                    *server = ServerDescription::new(server.address.clone());
                }
            }
        }

        self.servers
            .insert(description.address.clone(), description);
        self.update_replica_set_type();
    }

    fn add_hosts(&mut self, description: &ServerDescription) {
        for host in &description.hosts {
            self.servers
                .entry(host.clone())
                .or_insert_with(|| ServerDescription::new(host.clone()));
        }
    }

    fn update_replica_set_type(&mut self) {
        if matches!(
            self.topology_type,
            TopologyType::ReplicaSetNoPrimary | TopologyType::ReplicaSetWithPrimary
        ) {
            self.topology_type = if self
                .servers
                .values()
                .any(|s| s.server_type == ServerType::RsPrimary)
            {
                TopologyType::ReplicaSetWithPrimary
            } else {
                TopologyType::ReplicaSetNoPrimary
            };
        }
    }

    /// Picks a server at random from the suitable servers within the latency window.
    pub(crate) fn select_server(&self, criteria: &SelectionCriteria) -> Option<ServerAddress> {
        let in_window = self.suitable_servers_in_latency_window(criteria);
        in_window
            .choose(&mut rand::rng())
            .map(|server| server.address.clone())
    }

    pub(crate) fn suitable_servers_in_latency_window(
        &self,
        criteria: &SelectionCriteria,
    ) -> Vec<&ServerDescription> {
        let mut suitable_servers = match criteria {
            SelectionCriteria::ReadPreference(read_pref) => self.suitable_servers(*read_pref),
            SelectionCriteria::Predicate(filter) => self
                .servers
                .values()
                .filter(|s| {
                    (self.topology_type == TopologyType::Single
                        || s.server_type.is_data_bearing())
                        && s.is_available()
                        && filter(s)
                })
                .collect(),
        };

        let shortest_rtt = suitable_servers
            .iter()
            .filter_map(|s| s.round_trip_time)
            .min();
        if let Some(shortest_rtt) = shortest_rtt {
            let max_rtt = shortest_rtt.saturating_add(DEFAULT_LOCAL_THRESHOLD);
            suitable_servers.retain(|s| s.round_trip_time.map_or(true, |rtt| rtt <= max_rtt));
        }
        suitable_servers
    }

    fn suitable_servers(&self, read_pref: ReadPreference) -> Vec<&ServerDescription> {
        match self.topology_type {
            TopologyType::Unknown => Vec::new(),
            TopologyType::Single => self.servers.values().filter(|s| s.is_available()).collect(),
            TopologyType::Sharded => self.servers_with_type(&[ServerType::Mongos]),
            TopologyType::ReplicaSetNoPrimary | TopologyType::ReplicaSetWithPrimary => {
                let primaries = || self.servers_with_type(&[ServerType::RsPrimary]);
                let secondaries = || self.servers_with_type(&[ServerType::RsSecondary]);
                match read_pref {
                    ReadPreference::Primary => primaries(),
                    ReadPreference::Secondary => secondaries(),
                    ReadPreference::PrimaryPreferred => {
                        let servers = primaries();
                        if servers.is_empty() {
                            secondaries()
                        } else {
                            servers
                        }
                    }
                    ReadPreference::SecondaryPreferred => {
                        let servers = secondaries();
                        if servers.is_empty() {
                            primaries()
                        } else {
                            servers
                        }
                    }
                    ReadPreference::Nearest => {
                        self.servers_with_type(&[ServerType::RsPrimary, ServerType::RsSecondary])
                    }
                }
            }
        }
    }

    fn servers_with_type(&self, types: &[ServerType]) -> Vec<&ServerDescription> {
        self.servers
            .values()
            .filter(|s| types.contains(&s.server_type))
            .collect()
    }

    pub(crate) fn server_selection_error_message(&self, criteria: &SelectionCriteria) -> String {
        let servers: Vec<String> = self
            .servers
            .values()
            .map(|s| match s.error {
                Some(ref error) => format!("{} ({:?}, error: {})", s.address, s.server_type, error),
                None => format!("{} ({:?})", s.address, s.server_type),
            })
            .collect();
        if self.servers.values().any(ServerDescription::is_available) {
            format!(
                "None of the available servers are suitable for criteria {}. Topology: {:?} [{}]",
                criteria,
                self.topology_type,
                servers.join(", ")
            )
        } else {
            format!(
                "No available servers. Topology: {:?} [{}]",
                self.topology_type,
                servers.join(", ")
            )
        }
    }
}
