use std::{sync::Arc, time::Instant};

use bson::Document;
use derive_where::derive_where;

use super::conn::{
    stream::{ConnectOptions, Connector, TcpConnector},
    stream_description::StreamDescription,
    wire::next_request_id,
    Connection,
};
use crate::{
    error::Result,
    hello::{client_metadata, hello_command, HelloReply},
    options::{ClientOptions, ServerAddress, Tls, DEFAULT_CONNECT_TIMEOUT},
};

/// Contains the logic to establish a connection: opening the stream and performing the initial
/// handshake.
#[derive(Clone)]
#[derive_where(Debug)]
pub(crate) struct ConnectionEstablisher {
    connector: Arc<dyn Connector>,

    connect_options: ConnectOptions,

    /// Sent in the `client` field of the first hello on every stream.
    #[derive_where(skip)]
    metadata: Document,
}

impl ConnectionEstablisher {
    pub(crate) fn new(options: &ClientOptions) -> Self {
        let connector = options
            .connector
            .clone()
            .unwrap_or_else(|| Arc::new(TcpConnector));

        let tls = match options.tls {
            Some(Tls::Enabled(ref tls_options)) => Some(tls_options.clone()),
            _ => None,
        };

        let connect_timeout = match options.connect_timeout {
            Some(timeout) if timeout.is_zero() => None,
            Some(timeout) => Some(timeout),
            None => Some(DEFAULT_CONNECT_TIMEOUT),
        };

        Self {
            connector,
            connect_options: ConnectOptions {
                connect_timeout,
                tls,
            },
            metadata: client_metadata(options.app_name.as_deref()),
        }
    }

    /// Opens a stream to `address` and performs the handshake on it.
    pub(crate) fn establish_connection(&self, id: u32, address: &ServerAddress) -> Result<Connection> {
        self.connect_and_handshake(id, address)
            .map(|(connection, _)| connection)
    }

    /// Like `establish_connection`, but also returns the handshake reply so a monitor can record
    /// it.
    pub(crate) fn connect_and_handshake(
        &self,
        id: u32,
        address: &ServerAddress,
    ) -> Result<(Connection, HelloReply)> {
        let stream = self.connector.connect(address, &self.connect_options)?;
        let mut connection = Connection::new(id, address.clone(), stream);
        let reply = self.handshake(&mut connection)?;
        Ok((connection, reply))
    }

    /// Sends the initial hello, including the client metadata, and records the server's
    /// description on the connection.
    pub(crate) fn handshake(&self, connection: &mut Connection) -> Result<HelloReply> {
        let reply = self.hello(connection, Some(&self.metadata))?;
        connection.stream_description = Some(StreamDescription::from_hello_reply(&reply));
        Ok(reply)
    }

    /// Sends a hello on an already-established connection and times the round trip.
    pub(crate) fn hello(
        &self,
        connection: &mut Connection,
        metadata: Option<&Document>,
    ) -> Result<HelloReply> {
        let command = hello_command(metadata);
        let start = Instant::now();
        let response = connection.send_command(&command, next_request_id())?;
        HelloReply::parse(response, start.elapsed())
    }
}
