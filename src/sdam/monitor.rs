use std::{
    collections::{HashMap, HashSet},
    time::{Duration, Instant},
};

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;

use super::{
    description::ServerDescription,
    topology::{TopologyUpdater, TopologyWatcher},
};
use crate::{
    cmap::{establish::ConnectionEstablisher, Connection},
    event::sdam::{
        ServerHeartbeatFailedEvent,
        ServerHeartbeatStartedEvent,
        ServerHeartbeatSucceededEvent,
    },
    options::ServerAddress,
    trace::{TracingRepresentation, TOPOLOGY_TRACING_EVENT_TARGET},
};

pub(crate) const DEFAULT_HEARTBEAT_FREQUENCY: Duration = Duration::from_secs(10);

pub(crate) const MIN_HEARTBEAT_FREQUENCY: Duration = Duration::from_millis(500);

/// Monitoring connections are not pooled and never carry application commands.
const MONITORING_CONNECTION_ID: u32 = 0;

/// Background task that periodically checks every known server with `hello` and publishes the
/// results to the topology.
pub(super) struct Monitor {
    establisher: ConnectionEstablisher,
    updater: TopologyUpdater,
    watcher: TopologyWatcher,
    heartbeat_frequency: Duration,
    cancellation: CancellationToken,

    /// One dedicated connection per server, kept open between checks.
    connections: HashMap<ServerAddress, Connection>,
}

impl Monitor {
    pub(super) fn new(
        establisher: ConnectionEstablisher,
        updater: TopologyUpdater,
        watcher: TopologyWatcher,
        heartbeat_frequency: Duration,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            establisher,
            updater,
            watcher,
            heartbeat_frequency: heartbeat_frequency.max(MIN_HEARTBEAT_FREQUENCY),
            cancellation,
            connections: HashMap::new(),
        }
    }

    pub(super) async fn execute(mut self) {
        let check_requested = self.updater.check_requested.clone();
        let cancellation = self.cancellation.clone();

        loop {
            let checked = tokio::select! {
                _ = cancellation.cancelled() => break,
                checked = self.check_all() => checked,
            };

            // Newly discovered servers are checked right away.
            if self.watcher.observe_latest().server_addresses() != checked {
                continue;
            }

            tokio::select! {
                _ = cancellation.cancelled() => break,
                _ = check_requested.notified() => {},
                _ = tokio::time::sleep(self.heartbeat_frequency) => {},
            }
        }

        tracing::debug!(
            target: TOPOLOGY_TRACING_EVENT_TARGET,
            "Topology monitor stopped",
        );
    }

    /// Checks every server in the latest snapshot concurrently, returning the set checked.
    async fn check_all(&mut self) -> HashSet<ServerAddress> {
        let addresses = self.watcher.observe_latest().server_addresses();
        self.connections
            .retain(|address, _| addresses.contains(address));

        let checks = addresses.iter().cloned().map(|address| {
            let connection = self.connections.remove(&address);
            let establisher = self.establisher.clone();
            let updater = self.updater.clone();
            tokio::task::spawn_blocking(move || {
                let connection = check_server(&establisher, &updater, &address, connection);
                (address, connection)
            })
        });

        for (address, connection) in join_all(checks).await.into_iter().flatten() {
            if let Some(connection) = connection {
                self.connections.insert(address, connection);
            }
        }
        addresses
    }
}

/// Sends one heartbeat to `address`, opening a monitoring connection first if needed. Returns the
/// connection to keep for the next check, if it is still usable.
fn check_server(
    establisher: &ConnectionEstablisher,
    updater: &TopologyUpdater,
    address: &ServerAddress,
    connection: Option<Connection>,
) -> Option<Connection> {
    updater.emit(|| {
        ServerHeartbeatStartedEvent {
            server_address: address.clone(),
        }
        .into()
    });

    let start = Instant::now();
    let result = match connection {
        Some(mut connection) => establisher
            .hello(&mut connection, None)
            .map(|reply| (connection, reply)),
        None => establisher.connect_and_handshake(MONITORING_CONNECTION_ID, address),
    };
    let duration = start.elapsed();

    match result {
        Ok((connection, reply)) => {
            tracing::trace!(
                target: TOPOLOGY_TRACING_EVENT_TARGET,
                serverAddress = address.tracing_representation(),
                durationMS = duration.as_millis(),
                "Server heartbeat succeeded",
            );
            let description = ServerDescription::from_hello_reply(&reply);
            updater.emit(|| {
                ServerHeartbeatSucceededEvent {
                    duration,
                    reply: reply.raw_command_response,
                    server_address: address.clone(),
                }
                .into()
            });
            updater.update(description);
            Some(connection)
        }
        Err(error) => {
            tracing::debug!(
                target: TOPOLOGY_TRACING_EVENT_TARGET,
                serverAddress = address.tracing_representation(),
                durationMS = duration.as_millis(),
                failure = error.tracing_representation(),
                "Server heartbeat failed",
            );
            updater.emit(|| {
                ServerHeartbeatFailedEvent {
                    duration,
                    failure: error.clone(),
                    server_address: address.clone(),
                }
                .into()
            });
            updater.update(ServerDescription::with_error(address.clone(), error));
            None
        }
    }
}
