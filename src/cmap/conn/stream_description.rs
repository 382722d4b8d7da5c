use std::time::Duration;

use crate::{hello::HelloReply, options::ServerAddress, sdam::ServerType};

/// The default maximum size of a BSON object, used until a server reports its own.
const DEFAULT_MAX_BSON_OBJECT_SIZE: i64 = 16 * 1024 * 1024;

/// Contains information about a given server in a format digestible by a connection.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamDescription {
    /// The address of the server.
    pub(crate) server_address: ServerAddress,

    /// The type of the server when the handshake occurred.
    pub(crate) initial_server_type: ServerType,

    /// The maximum wire version that the server understands.
    pub(crate) max_wire_version: Option<i32>,

    /// How long sessions started on this server will stay alive without
    /// executing an operation before the server kills them.
    pub(crate) logical_session_timeout: Option<Duration>,

    /// The maximum size of writes (excluding command overhead) that should be sent to the server.
    pub(crate) max_bson_object_size: i64,
}

impl StreamDescription {
    /// Constructs a new StreamDescription from a `HelloReply`.
    pub(crate) fn from_hello_reply(reply: &HelloReply) -> Self {
        Self {
            server_address: reply.server_address.clone(),
            initial_server_type: reply.command_response.server_type(),
            max_wire_version: reply.command_response.max_wire_version,
            logical_session_timeout: reply
                .command_response
                .logical_session_timeout_minutes
                .map(|mins| Duration::from_secs(mins.max(0) as u64 * 60)),
            max_bson_object_size: reply
                .command_response
                .max_bson_object_size
                .unwrap_or(DEFAULT_MAX_BSON_OBJECT_SIZE),
        }
    }

    /// Whether the server on the other end of the stream is a mongos.
    pub fn is_mongos(&self) -> bool {
        self.initial_server_type == ServerType::Mongos
    }

    /// The address of the server on the other end of the stream.
    pub fn server_address(&self) -> &ServerAddress {
        &self.server_address
    }

    /// The maximum wire version the server understands, if it reported one.
    pub fn max_wire_version(&self) -> Option<i32> {
        self.max_wire_version
    }

    /// Whether the server supports logical sessions.
    pub fn supports_sessions(&self) -> bool {
        self.logical_session_timeout.is_some()
    }

    #[cfg(test)]
    pub(crate) fn new_testing() -> Self {
        Self {
            server_address: ServerAddress::default(),
            initial_server_type: ServerType::Standalone,
            max_wire_version: Some(21),
            logical_session_timeout: Some(Duration::from_secs(30 * 60)),
            max_bson_object_size: DEFAULT_MAX_BSON_OBJECT_SIZE,
        }
    }
}
