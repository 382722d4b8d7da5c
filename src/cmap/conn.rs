pub(crate) mod command;
pub(crate) mod stream;
pub(crate) mod stream_description;
pub(crate) mod wire;

use std::{
    sync::{Arc, Weak},
    time::Instant,
};

use derive_where::derive_where;

use self::{
    command::{Command, RawCommandResponse},
    stream::WireStream,
    stream_description::StreamDescription,
    wire::Message,
};
use super::ConnectionPoolInner;
use crate::{
    client::session::SessionInner,
    error::{Error, Result},
    event::command::ConnectionInfo,
    options::ServerAddress,
};

/// A single physical channel to a server.
///
/// A connection is leased to at most one operation at a time. While it is checked out it keeps a
/// weak reference to its pool so that dropping it, rather than releasing it, still keeps the
/// pool's accounting correct.
#[derive_where(Debug)]
pub struct Connection {
    pub(crate) id: u32,
    pub(crate) address: ServerAddress,
    /// Populated by the handshake.
    pub(crate) stream_description: Option<StreamDescription>,
    stream: Box<dyn WireStream>,

    /// Set when a round trip failed; the connection is closed instead of being checked in.
    broken: bool,

    /// When the connection was last checked in.
    pub(crate) ready_and_available_time: Option<Instant>,

    /// The pool this connection is checked out of. `None` while it sits in the pool's free list.
    #[derive_where(skip)]
    pub(super) pool: Option<Weak<ConnectionPoolInner>>,

    /// The session this connection is pinned to, if any.
    #[derive_where(skip)]
    pub(crate) pinned_to: Option<Weak<SessionInner>>,
}

impl Connection {
    pub(crate) fn new(id: u32, address: ServerAddress, stream: Box<dyn WireStream>) -> Self {
        Self {
            id,
            address,
            stream_description: None,
            stream,
            broken: false,
            ready_and_available_time: None,
            pool: None,
            pinned_to: None,
        }
    }

    /// The driver-assigned id of this connection, unique within its pool.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The address of the server this connection is open to.
    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// The description of the server recorded during the handshake.
    pub fn stream_description(&self) -> Result<&StreamDescription> {
        self.stream_description.as_ref().ok_or_else(|| {
            Error::internal(format!(
                "connection {} to {} was used before its handshake completed",
                self.id, self.address
            ))
        })
    }

    /// Whether this connection is currently pinned to a session.
    pub fn is_pinned(&self) -> bool {
        self.pinned_session().is_some()
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            address: self.address.clone(),
        }
    }

    pub(crate) fn pinned_session(&self) -> Option<Arc<SessionInner>> {
        self.pinned_to.as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn is_broken(&self) -> bool {
        self.broken
    }

    pub(crate) fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Sends `command` and reads the server's reply.
    ///
    /// The reply is returned as-is; `ok: 0` replies are not mapped to errors here. Any failure to
    /// write, read or decode marks the connection broken.
    pub(crate) fn send_command(
        &mut self,
        command: &Command,
        request_id: i32,
    ) -> Result<RawCommandResponse> {
        let message = Message::from_command(command.to_wire_document(), request_id);
        let bytes = message.encode()?;

        let result = self
            .stream
            .round_trip(&bytes)
            .and_then(|reply| Message::decode(&reply));
        let reply = match result {
            Ok(reply) => reply,
            Err(error) => {
                self.broken = true;
                return Err(error);
            }
        };

        if reply.response_to != request_id {
            self.broken = true;
            return Err(Error::invalid_response(format!(
                "expected a response to request {} but got a response to request {}",
                request_id, reply.response_to
            )));
        }

        Ok(RawCommandResponse::new(
            self.address.clone(),
            reply.document_payload,
        ))
    }

    /// Closes the underlying stream without touching pool accounting.
    pub(crate) fn close(mut self) {
        self.pool = None;
        self.pinned_to = None;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // A connection dropped while checked out never made it back to the pool; free its slot.
        if let Some(pool) = self.pool.take().and_then(|pool| pool.upgrade()) {
            pool.discard(self);
        }
        self.stream.shutdown();
    }
}
