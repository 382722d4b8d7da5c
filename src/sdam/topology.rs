use std::{
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use derive_where::derive_where;
use tokio::{
    runtime::Handle,
    sync::{watch, Notify},
};
use tokio_util::sync::CancellationToken;

use super::{
    description::{ServerDescription, TopologyDescription},
    monitor::Monitor,
    DEFAULT_HEARTBEAT_FREQUENCY,
};
use crate::{
    cmap::establish::ConnectionEstablisher,
    error::{Error, Result},
    event::sdam::{
        handle_sdam_event,
        SdamEvent,
        SdamHandlers,
        ServerClosedEvent,
        ServerDescriptionChangedEvent,
        ServerOpeningEvent,
        TopologyDescriptionChangedEvent,
    },
    options::{ClientOptions, ServerAddress, DEFAULT_SERVER_SELECTION_TIMEOUT},
    runtime::{self, AsyncJoinHandle},
    selection_criteria::SelectionCriteria,
    trace::{
        TracingRepresentation,
        SERVER_SELECTION_TRACING_EVENT_TARGET,
        TOPOLOGY_TRACING_EVENT_TARGET,
    },
};

/// The client's view of the deployment. Owns the background monitor and answers server
/// selection requests from the latest published snapshot.
#[derive(Debug)]
pub(crate) struct Topology {
    watcher: TopologyWatcher,
    updater: TopologyUpdater,
    runtime: Handle,
    server_selection_timeout: Duration,
    cancellation: CancellationToken,
    monitor: Mutex<Option<AsyncJoinHandle<()>>>,
}

impl Topology {
    pub(crate) fn new(
        options: &ClientOptions,
        establisher: ConnectionEstablisher,
        handlers: Arc<SdamHandlers>,
        runtime: Handle,
    ) -> Self {
        let description = TopologyDescription::new(&options.hosts);
        let addresses = description.server_addresses();
        let (sender, receiver) = watch::channel(description);
        let watcher = TopologyWatcher { receiver };
        let updater = TopologyUpdater {
            sender: Arc::new(sender),
            check_requested: Arc::new(Notify::new()),
            handlers,
        };
        for address in addresses {
            updater.emit(|| ServerOpeningEvent { address }.into());
        }

        let cancellation = CancellationToken::new();
        let monitor = Monitor::new(
            establisher,
            updater.clone(),
            watcher.clone(),
            options.heartbeat_freq.unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY),
            cancellation.clone(),
        );
        let monitor = runtime::spawn(&runtime, monitor.execute());

        Self {
            watcher,
            updater,
            runtime,
            server_selection_timeout: options
                .server_selection_timeout
                .unwrap_or(DEFAULT_SERVER_SELECTION_TIMEOUT),
            cancellation,
            monitor: Mutex::new(Some(monitor)),
        }
    }

    pub(crate) fn watch(&self) -> TopologyWatcher {
        self.watcher.clone()
    }

    pub(crate) fn updater(&self) -> &TopologyUpdater {
        &self.updater
    }

    /// Selects a server matching `criteria`, waiting for the monitor to publish new snapshots
    /// until the server selection timeout elapses.
    ///
    /// This blocks the calling thread and must not be called from an async context.
    pub(crate) fn select_server(&self, criteria: &SelectionCriteria) -> Result<ServerAddress> {
        let mut watcher = self.watcher.clone();
        let start = Instant::now();

        loop {
            let description = watcher.observe_latest();
            if let Some(address) = description.select_server(criteria) {
                tracing::debug!(
                    target: SERVER_SELECTION_TRACING_EVENT_TARGET,
                    selector = criteria.tracing_representation(),
                    serverAddress = address.tracing_representation(),
                    "Server selection succeeded",
                );
                return Ok(address);
            }

            let elapsed = start.elapsed();
            if description.all_servers_errored() || elapsed >= self.server_selection_timeout {
                let error = Error::server_selection(
                    description.server_selection_error_message(criteria),
                );
                tracing::debug!(
                    target: SERVER_SELECTION_TRACING_EVENT_TARGET,
                    selector = criteria.tracing_representation(),
                    failure = error.tracing_representation(),
                    "Server selection failed",
                );
                return Err(error);
            }

            self.updater.request_check();
            self.runtime
                .block_on(watcher.wait_for_update(self.server_selection_timeout - elapsed));
        }
    }

    /// Stops the monitor. Servers are reported closed to SDAM handlers.
    pub(crate) fn shutdown(&self) {
        if self.cancellation.is_cancelled() {
            return;
        }
        self.cancellation.cancel();
        for address in self.watcher.clone().observe_latest().server_addresses() {
            self.updater.emit(|| ServerClosedEvent { address }.into());
        }
    }

    /// Waits for the monitor task to exit after `shutdown`.
    pub(crate) async fn wait_for_monitor(&self) {
        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(monitor) = monitor {
            monitor.await;
        }
    }
}

impl Drop for Topology {
    fn drop(&mut self) {
        self.cancellation.cancel();
    }
}

/// Observes the snapshots published by a [`TopologyUpdater`].
#[derive(Debug, Clone)]
pub(crate) struct TopologyWatcher {
    receiver: watch::Receiver<TopologyDescription>,
}

impl TopologyWatcher {
    /// Clones the latest snapshot and marks it seen.
    pub(crate) fn observe_latest(&mut self) -> TopologyDescription {
        self.receiver.borrow_and_update().clone()
    }

    /// Waits until a snapshot newer than the last observed one is published. Returns whether one
    /// was.
    pub(crate) async fn wait_for_update(&mut self, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, self.receiver.changed()).await,
            Ok(Ok(()))
        )
    }
}

/// Publishes new topology snapshots and the SDAM events describing how they differ.
#[derive(Clone)]
#[derive_where(Debug)]
pub(crate) struct TopologyUpdater {
    #[derive_where(skip)]
    sender: Arc<watch::Sender<TopologyDescription>>,
    pub(super) check_requested: Arc<Notify>,
    handlers: Arc<SdamHandlers>,
}

impl TopologyUpdater {
    /// Applies a new server description to the topology.
    pub(crate) fn update(&self, server: ServerDescription) {
        let mut diff = None;
        self.sender.send_modify(|topology| {
            let previous = topology.clone();
            topology.update(server);
            diff = Some((previous, topology.clone()));
        });
        if let Some((previous, new)) = diff {
            self.publish_diff(previous, new);
        }
    }

    /// Marks the server at `address` unreachable and asks the monitor to check it again right
    /// away.
    pub(crate) fn mark_server_unknown(&self, address: ServerAddress, error: Error) {
        tracing::debug!(
            target: TOPOLOGY_TRACING_EVENT_TARGET,
            serverAddress = address.tracing_representation(),
            failure = error.tracing_representation(),
            "Server marked unknown after a network error",
        );
        self.update(ServerDescription::with_error(address, error));
        self.request_check();
    }

    pub(crate) fn request_check(&self) {
        self.check_requested.notify_one();
    }

    pub(crate) fn emit(&self, make_event: impl FnOnce() -> SdamEvent) {
        self.handlers.emit(make_event, |handler, event| handle_sdam_event(handler, event));
    }

    fn publish_diff(&self, previous: TopologyDescription, new: TopologyDescription) {
        if previous == new {
            return;
        }

        for (address, new_server) in new.servers.iter() {
            match previous.servers.get(address) {
                None => self.emit(|| {
                    ServerOpeningEvent {
                        address: address.clone(),
                    }
                    .into()
                }),
                Some(previous_server) if previous_server != new_server => {
                    tracing::debug!(
                        target: TOPOLOGY_TRACING_EVENT_TARGET,
                        serverAddress = address.tracing_representation(),
                        previousType = ?previous_server.server_type,
                        newType = ?new_server.server_type,
                        "Server description changed",
                    );
                    self.emit(|| {
                        Box::new(ServerDescriptionChangedEvent {
                            address: address.clone(),
                            previous_description: previous_server.clone(),
                            new_description: new_server.clone(),
                        })
                        .into()
                    });
                }
                Some(_) => {}
            }
        }
        for address in previous.servers.keys() {
            if !new.servers.contains_key(address) {
                self.emit(|| {
                    ServerClosedEvent {
                        address: address.clone(),
                    }
                    .into()
                });
            }
        }

        tracing::debug!(
            target: TOPOLOGY_TRACING_EVENT_TARGET,
            previousType = ?previous.topology_type,
            newType = ?new.topology_type,
            servers = new.servers.len(),
            "Topology description changed",
        );
        self.emit(|| {
            Box::new(TopologyDescriptionChangedEvent {
                previous_description: previous,
                new_description: new,
            })
            .into()
        });
    }
}
