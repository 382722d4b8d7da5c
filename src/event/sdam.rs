//! Contains the events and functionality for monitoring Server Discovery and Monitoring.

use std::time::Duration;

use bson::Document;

use crate::{
    error::Error,
    options::ServerAddress,
    sdam::{ServerDescription, TopologyDescription},
};

/// Published when a server is added to the topology.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerOpeningEvent {
    /// The address of the server.
    pub address: ServerAddress,
}

/// Published when a server is removed from the topology, or when the client shuts down.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerClosedEvent {
    /// The address of the server.
    pub address: ServerAddress,
}

/// Published when a server's description changes.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerDescriptionChangedEvent {
    /// The address of the server.
    pub address: ServerAddress,

    /// The previous server description.
    pub previous_description: ServerDescription,

    /// The new server description.
    pub new_description: ServerDescription,
}

/// Published when the topology description changes.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyDescriptionChangedEvent {
    /// The previous topology description.
    pub previous_description: TopologyDescription,

    /// The new topology description.
    pub new_description: TopologyDescription,
}

/// Published when the monitor sends a heartbeat to a server.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatStartedEvent {
    /// The address of the server.
    pub server_address: ServerAddress,
}

/// Published when a heartbeat succeeds.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatSucceededEvent {
    /// The execution time of the hello, including the round trip.
    pub duration: Duration,

    /// The server's reply to the hello.
    pub reply: Document,

    /// The address of the server.
    pub server_address: ServerAddress,
}

/// Published when a heartbeat fails.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatFailedEvent {
    /// The time spent before the failure.
    pub duration: Duration,

    /// The failure that occurred.
    pub failure: Error,

    /// The address of the server.
    pub server_address: ServerAddress,
}

/// Any SDAM event. Callbacks registered with
/// [`Client::add_sdam_event_callback`](crate::Client::add_sdam_event_callback) receive this type.
#[derive(Clone, Debug, derive_more::From)]
#[non_exhaustive]
#[allow(missing_docs)]
pub enum SdamEvent {
    ServerDescriptionChanged(Box<ServerDescriptionChangedEvent>),
    ServerOpening(ServerOpeningEvent),
    ServerClosed(ServerClosedEvent),
    TopologyDescriptionChanged(Box<TopologyDescriptionChangedEvent>),
    ServerHeartbeatStarted(ServerHeartbeatStartedEvent),
    ServerHeartbeatSucceeded(ServerHeartbeatSucceededEvent),
    ServerHeartbeatFailed(ServerHeartbeatFailedEvent),
}

/// Applications can implement this trait to specify custom logic to run on each SDAM event sent
/// by the driver.
///
/// ```rust
/// # use std::sync::Arc;
/// #
/// # use mongodb_core::{
/// #     error::Result,
/// #     event::sdam::{SdamEventHandler, ServerDescriptionChangedEvent},
/// #     Client,
/// # };
/// #
/// struct FailureLogger;
///
/// impl SdamEventHandler for FailureLogger {
///     fn handle_server_description_changed_event(&self, event: ServerDescriptionChangedEvent) {
///         if let Some(error) = event.new_description.error() {
///             eprintln!("{} is unreachable: {}", event.address, error);
///         }
///     }
/// }
///
/// # async fn do_stuff() -> Result<()> {
/// let client = Client::with_uri_str("mongodb://example.com", None)?;
/// let logger = Arc::new(FailureLogger);
/// client.add_sdam_event_handler(&logger);
/// # client.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub trait SdamEventHandler: Send + Sync {
    /// A [`Client`](crate::Client) will call this method on each registered handler when a server
    /// description changes.
    fn handle_server_description_changed_event(&self, _event: ServerDescriptionChangedEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler when a server
    /// is initialized.
    fn handle_server_opening_event(&self, _event: ServerOpeningEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler when a server
    /// is closed.
    fn handle_server_closed_event(&self, _event: ServerClosedEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler when its
    /// topology description changes.
    fn handle_topology_description_changed_event(&self, _event: TopologyDescriptionChangedEvent) {
    }

    /// A [`Client`](crate::Client) will call this method on each registered handler when the
    /// server monitor sends a hello to a server.
    fn handle_server_heartbeat_started_event(&self, _event: ServerHeartbeatStartedEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler when a hello
    /// sent by the server monitor succeeds.
    fn handle_server_heartbeat_succeeded_event(&self, _event: ServerHeartbeatSucceededEvent) {}

    /// A [`Client`](crate::Client) will call this method on each registered handler when a hello
    /// sent by the server monitor fails.
    fn handle_server_heartbeat_failed_event(&self, _event: ServerHeartbeatFailedEvent) {}
}

pub(crate) fn handle_sdam_event(handler: &dyn SdamEventHandler, event: SdamEvent) {
    match event {
        SdamEvent::ServerDescriptionChanged(event) => {
            handler.handle_server_description_changed_event(*event)
        }
        SdamEvent::ServerOpening(event) => handler.handle_server_opening_event(event),
        SdamEvent::ServerClosed(event) => handler.handle_server_closed_event(event),
        SdamEvent::TopologyDescriptionChanged(event) => {
            handler.handle_topology_description_changed_event(*event)
        }
        SdamEvent::ServerHeartbeatStarted(event) => {
            handler.handle_server_heartbeat_started_event(event)
        }
        SdamEvent::ServerHeartbeatSucceeded(event) => {
            handler.handle_server_heartbeat_succeeded_event(event)
        }
        SdamEvent::ServerHeartbeatFailed(event) => {
            handler.handle_server_heartbeat_failed_event(event)
        }
    }
}

pub(crate) type SdamHandlers = crate::event::HandlerRegistry<dyn SdamEventHandler, SdamEvent>;
