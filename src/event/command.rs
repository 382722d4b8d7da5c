//! Command monitoring: one started event per command, then exactly one succeeded or failed
//! event with the same request id.

use std::time::Duration;

use bson::Document;

use crate::{error::Error, options::ServerAddress};

/// The connection a command was sent on.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ConnectionInfo {
    /// Pool-assigned, starting at 1 and never reused within a client.
    pub id: u32,
    pub address: ServerAddress,
}

/// Published just before a command is written to the connection.
#[allow(missing_docs)]
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct CommandStartedEvent {
    /// The full command as sent, including `$db` and any session fields.
    pub command: Document,
    pub db: String,
    pub command_name: String,

    /// Matches the `request_id` of the succeeded or failed event that follows.
    pub request_id: i32,
    pub connection: ConnectionInfo,
}

/// Published once a reply with `ok: 1` has been read.
#[allow(missing_docs)]
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct CommandSucceededEvent {
    /// Measured from just before sending until the reply was decoded.
    pub duration: Duration,
    pub reply: Document,
    pub command_name: String,
    pub request_id: i32,
    pub connection: ConnectionInfo,
}

/// Published when sending fails, reading fails, or the server replies with an error.
#[allow(missing_docs)]
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct CommandFailedEvent {
    pub duration: Duration,
    pub command_name: String,
    pub failure: Error,
    pub request_id: i32,
    pub connection: ConnectionInfo,
}

/// Usage events for commands.
#[derive(Clone, Debug)]
#[allow(missing_docs)]
#[non_exhaustive]
pub enum CommandEvent {
    Started(CommandStartedEvent),
    Succeeded(CommandSucceededEvent),
    Failed(CommandFailedEvent),
}

impl CommandEvent {
    /// The name of the command this event describes.
    pub fn command_name(&self) -> &str {
        match self {
            CommandEvent::Started(event) => event.command_name.as_str(),
            CommandEvent::Succeeded(event) => event.command_name.as_str(),
            CommandEvent::Failed(event) => event.command_name.as_str(),
        }
    }

    /// The request id shared by the started event and its completion event.
    pub fn request_id(&self) -> i32 {
        match self {
            CommandEvent::Started(event) => event.request_id,
            CommandEvent::Succeeded(event) => event.request_id,
            CommandEvent::Failed(event) => event.request_id,
        }
    }

    /// The connection the command ran on.
    pub fn connection(&self) -> &ConnectionInfo {
        match self {
            CommandEvent::Started(event) => &event.connection,
            CommandEvent::Succeeded(event) => &event.connection,
            CommandEvent::Failed(event) => &event.connection,
        }
    }
}

/// Receives command events. Every method has an empty default, so implement only what you need.
///
/// ```rust
/// # use std::sync::Arc;
/// # use mongodb_core::{Client, event::command::{CommandEventHandler, CommandFailedEvent}};
/// struct Failures;
///
/// impl CommandEventHandler for Failures {
///     fn handle_command_failed_event(&self, event: CommandFailedEvent) {
///         eprintln!("{} failed after {:?}: {}", event.command_name, event.duration, event.failure);
///     }
/// }
///
/// # fn register(client: &Client) {
/// let failures = Arc::new(Failures);
/// client.add_command_event_handler(&failures);
/// // The client holds the handler weakly; keep `failures` alive for as long as it should run.
/// # }
/// ```
pub trait CommandEventHandler: Send + Sync {
    fn handle_command_started_event(&self, _event: CommandStartedEvent) {}

    fn handle_command_succeeded_event(&self, _event: CommandSucceededEvent) {}

    fn handle_command_failed_event(&self, _event: CommandFailedEvent) {}
}

pub(crate) fn handle_command_event(handler: &dyn CommandEventHandler, event: CommandEvent) {
    match event {
        CommandEvent::Started(event) => handler.handle_command_started_event(event),
        CommandEvent::Succeeded(event) => handler.handle_command_succeeded_event(event),
        CommandEvent::Failed(event) => handler.handle_command_failed_event(event),
    }
}

pub(crate) type CommandHandlers =
    crate::event::HandlerRegistry<dyn CommandEventHandler, CommandEvent>;
