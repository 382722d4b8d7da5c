use std::{
    fmt::Debug,
    io::{self, Write},
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    time::Duration,
};

use crate::{
    cmap::conn::wire::Message,
    error::{Error, Result},
    options::{ServerAddress, TlsOptions},
};

const KEEPALIVE_TIME: Duration = Duration::from_secs(120);

/// The options a [`Connector`] is given when opening a stream.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct ConnectOptions {
    /// How long to wait for the stream to be established.
    pub connect_timeout: Option<Duration>,

    /// The TLS configuration to use, if TLS is enabled.
    pub tls: Option<TlsOptions>,
}

/// Opens physical streams to servers.
///
/// A client uses its connector for both pooled connections and monitoring streams. Connectors are
/// called from blocking worker threads, never from async tasks.
pub trait Connector: Send + Sync + Debug {
    /// Opens a new stream to the server at `address`.
    fn connect(&self, address: &ServerAddress, options: &ConnectOptions)
        -> Result<Box<dyn WireStream>>;
}

/// A physical channel to a server that carries complete wire protocol messages.
pub trait WireStream: Send + Debug {
    /// Writes one complete wire message and blocks until the server's reply message has been read
    /// in full.
    fn round_trip(&mut self, message: &[u8]) -> Result<Vec<u8>>;

    /// Closes the stream. Errors are ignored.
    fn shutdown(&mut self) {}
}

/// A [`Connector`] that opens plain TCP streams with keepalive enabled.
///
/// TLS is not supported; a client configured with TLS must be given a connector that supports it.
#[derive(Clone, Copy, Debug, Default)]
#[non_exhaustive]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(
        &self,
        address: &ServerAddress,
        options: &ConnectOptions,
    ) -> Result<Box<dyn WireStream>> {
        if options.tls.is_some() {
            return Err(Error::invalid_argument(
                "TcpConnector cannot open TLS streams; configure a Connector that supports TLS",
            ));
        }

        let resolved: Vec<SocketAddr> = (address.host.as_str(), address.port())
            .to_socket_addrs()?
            .collect();
        if resolved.is_empty() {
            return Err(Error::from(io::Error::new(
                io::ErrorKind::NotFound,
                format!("No DNS results for domain {}", address),
            )));
        }

        let mut last_error = None;
        for socket_address in resolved {
            match tcp_try_connect(&socket_address, options.connect_timeout) {
                Ok(stream) => return Ok(Box::new(TcpWireStream { stream })),
                Err(error) => last_error = Some(error),
            }
        }
        Err(last_error.unwrap_or_else(|| Error::internal("no address was attempted")))
    }
}

fn tcp_try_connect(address: &SocketAddr, connect_timeout: Option<Duration>) -> Result<TcpStream> {
    let stream = match connect_timeout {
        Some(timeout) if !timeout.is_zero() => TcpStream::connect_timeout(address, timeout)?,
        _ => TcpStream::connect(address)?,
    };
    stream.set_nodelay(true)?;

    let sock_ref = socket2::SockRef::from(&stream);
    let conf = socket2::TcpKeepalive::new().with_time(KEEPALIVE_TIME);
    sock_ref.set_tcp_keepalive(&conf)?;

    Ok(stream)
}

#[derive(Debug)]
struct TcpWireStream {
    stream: TcpStream,
}

impl WireStream for TcpWireStream {
    fn round_trip(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        self.stream.write_all(message)?;
        self.stream.flush()?;
        Message::read_bytes_from(&mut self.stream)
    }

    fn shutdown(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}
