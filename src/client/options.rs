//! Contains the options used to configure a [`Client`](crate::Client) and the sessions it
//! starts.

mod parse;
#[cfg(test)]
mod test;

use std::{
    fmt,
    hash::{Hash, Hasher},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use derive_where::derive_where;
use serde::{de::Error as SerdeError, Deserialize, Deserializer};
use typed_builder::TypedBuilder;

use crate::{
    cmap::Connector,
    concern::{ReadConcern, WriteConcern},
    error::{Error, Result},
    selection_criteria::ReadPreference,
};

pub(crate) const DEFAULT_PORT: u16 = 27017;

/// The default maximum number of connections a client's pool may hold.
pub const DEFAULT_MAX_POOL_SIZE: u32 = 100;

/// The default number of operations a client runs concurrently.
pub const DEFAULT_THREAD_POOL_SIZE: u32 = 5;

pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// An enum representing the address of a MongoDB server.
#[derive(Clone, Debug, Eq)]
#[non_exhaustive]
pub struct ServerAddress {
    /// The hostname or IP address where the MongoDB server can be found.
    pub host: String,

    /// The TCP port that the MongoDB server is listening on.
    ///
    /// The default is 27017.
    pub port: Option<u16>,
}

impl<'de> Deserialize<'de> for ServerAddress {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        Self::parse(s.as_str()).map_err(|e| D::Error::custom(format!("{}", e)))
    }
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: None,
        }
    }
}

impl PartialEq for ServerAddress {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host
            && self.port.unwrap_or(DEFAULT_PORT) == other.port.unwrap_or(DEFAULT_PORT)
    }
}

impl Hash for ServerAddress {
    fn hash<H>(&self, state: &mut H)
    where
        H: Hasher,
    {
        self.host.hash(state);
        self.port.unwrap_or(DEFAULT_PORT).hash(state);
    }
}

impl FromStr for ServerAddress {
    type Err = Error;

    fn from_str(address: &str) -> Result<Self> {
        ServerAddress::parse(address)
    }
}

impl ServerAddress {
    /// Parses an address string into a `ServerAddress`.
    pub fn parse(address: impl AsRef<str>) -> Result<Self> {
        let address = address.as_ref();
        let mut parts = address.split(':');
        let host = match parts.next() {
            Some(part) if !part.is_empty() => part,
            _ => {
                return Err(Error::invalid_argument(format!(
                    "invalid server address: \"{}\"",
                    address
                )))
            }
        };

        let port = match parts.next() {
            Some(part) => {
                let port = u16::from_str(part).map_err(|_| {
                    Error::invalid_argument(format!(
                        "port must be valid 16-bit unsigned integer, instead got: {}",
                        part
                    ))
                })?;

                if port == 0 {
                    return Err(Error::invalid_argument(format!(
                        "invalid server address: \"{}\"; port must be non-zero",
                        address
                    )));
                }
                if parts.next().is_some() {
                    return Err(Error::invalid_argument(format!(
                        "address \"{}\" contains more than one unescaped ':'",
                        address
                    )));
                }

                Some(port)
            }
            None => None,
        };

        Ok(ServerAddress {
            host: host.to_lowercase(),
            port,
        })
    }

    pub(crate) fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}:{}", self.host, self.port())
    }
}

/// Specifies whether TLS configuration should be used with the operations that the
/// [`Client`](crate::Client) performs.
#[derive(Clone, Debug, PartialEq)]
pub enum Tls {
    /// Enable TLS with the specified options.
    Enabled(TlsOptions),

    /// Disable TLS.
    Disabled,
}

impl From<TlsOptions> for Tls {
    fn from(options: TlsOptions) -> Self {
        Self::Enabled(options)
    }
}

/// Specifies the TLS configuration that the [`Client`](crate::Client) should use. These options
/// are handed to the [`Connector`] as-is.
#[derive(Clone, Debug, Default, PartialEq, TypedBuilder)]
#[builder(field_defaults(default, setter(strip_option)))]
#[non_exhaustive]
pub struct TlsOptions {
    /// Whether or not the client should return an error if the server presents an invalid
    /// certificate. This setting should _not_ be set to `true` in production.
    pub allow_invalid_certificates: Option<bool>,

    /// Whether or not the client should return an error if the hostname of the server does not
    /// match its certificate.
    pub allow_invalid_hostnames: Option<bool>,

    /// The path to the CA file that the client should use for TLS.
    pub ca_file_path: Option<String>,

    /// The path to the certificate file that the client should present to the server.
    pub cert_key_file_path: Option<String>,

    /// The password for the private key in `cert_key_file_path`, if it is encrypted.
    pub cert_key_file_password: Option<String>,
}

/// The user credential parsed from a connection string. Authentication itself is performed by
/// the [`Connector`].
#[derive(Clone, Default, PartialEq)]
#[derive_where(Debug)]
#[non_exhaustive]
pub struct Credential {
    /// The username to authenticate with.
    pub username: Option<String>,

    /// The database used to authenticate.
    pub source: Option<String>,

    /// The password to authenticate with.
    #[derive_where(skip)]
    pub password: Option<String>,
}

/// How binary data is encoded by the serialization layer built on top of this crate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum DataCodingStrategy {
    /// Encode and decode using the type's own serialization.
    #[default]
    Deferred,
    /// Encode as BSON binary with the generic subtype.
    Binary,
    /// Encode as a base64 string.
    Base64,
}

/// How dates are encoded by the serialization layer built on top of this crate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum DateCodingStrategy {
    /// Encode and decode using the type's own serialization.
    Deferred,
    /// Encode as a BSON datetime.
    #[default]
    BsonDateTime,
    /// Encode as an integer count of milliseconds since the Unix epoch.
    MillisecondsSince1970,
    /// Encode as a floating point count of seconds since the Unix epoch.
    SecondsSince1970,
    /// Encode as an ISO-8601 string.
    Iso8601,
}

/// How UUIDs are encoded by the serialization layer built on top of this crate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum UuidCodingStrategy {
    /// Encode and decode using the type's own serialization.
    Deferred,
    /// Encode as BSON binary with the UUID subtype.
    #[default]
    Binary,
}

/// Contains the options that can be used to create a new [`Client`](crate::Client).
///
/// Options set explicitly here take precedence over the same option given in a connection string;
/// see [`Client::with_uri_str`](crate::Client::with_uri_str).
#[derive(Clone, Default, TypedBuilder)]
#[derive_where(Debug)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct ClientOptions {
    /// The initial list of seeds that the client should connect to.
    ///
    /// Note that by default, the driver will autodiscover other nodes in the cluster. To connect
    /// directly to a single server (rather than autodiscovering the rest of the cluster), pass a
    /// single host. Left empty, a connection string's hosts are used, or `localhost:27017`.
    pub hosts: Vec<ServerAddress>,

    /// The application name that the client will send to the server as part of the handshake.
    pub app_name: Option<String>,

    /// The credential parsed from the connection string, if any.
    pub credential: Option<Credential>,

    /// The database named in the path of the connection string, if any.
    pub default_database: Option<String>,

    /// The maximum number of connections that the pool can have at a given time. This includes
    /// connections which are currently checked out of the pool.
    ///
    /// The default is 100.
    pub max_pool_size: Option<u32>,

    /// The maximum number of operations the client executes concurrently.
    ///
    /// The default is 5.
    pub thread_pool_size: Option<u32>,

    /// The amount of time each monitoring thread should wait between performing server checks.
    ///
    /// The default value is 10 seconds.
    pub heartbeat_freq: Option<Duration>,

    /// The connect timeout passed to each underlying stream when attempting to connect to the
    /// server.
    ///
    /// The default value is 10 seconds.
    pub connect_timeout: Option<Duration>,

    /// The amount of time the client should attempt to select a server for an operation before
    /// timing out.
    ///
    /// The default value is 30 seconds.
    pub server_selection_timeout: Option<Duration>,

    /// The amount of time that a thread should block while waiting to check out a connection
    /// before returning an error. A value of `None` means wait indefinitely.
    pub wait_queue_timeout: Option<Duration>,

    /// The default read concern for operations performed on the client.
    pub read_concern: Option<ReadConcern>,

    /// The default write concern for operations performed on the client.
    pub write_concern: Option<WriteConcern>,

    /// The default read preference for operations performed on the client.
    pub read_preference: Option<ReadPreference>,

    /// Whether or not the client should retry a read operation if the operation fails.
    ///
    /// The default value is true.
    pub retry_reads: Option<bool>,

    /// Whether or not the client should retry a write operation if the operation fails.
    ///
    /// The default value is true.
    pub retry_writes: Option<bool>,

    /// The TLS configuration for the client to use in its connections with the server.
    pub tls: Option<Tls>,

    /// The strategy the serialization layer uses for binary data.
    pub data_coding_strategy: Option<DataCodingStrategy>,

    /// The strategy the serialization layer uses for dates.
    pub date_coding_strategy: Option<DateCodingStrategy>,

    /// The strategy the serialization layer uses for UUIDs.
    pub uuid_coding_strategy: Option<UuidCodingStrategy>,

    /// The transport used to open connections. Defaults to a plain TCP connector.
    #[derive_where(skip)]
    pub connector: Option<Arc<dyn Connector>>,
}

impl ClientOptions {
    /// Parses a MongoDB connection string into a `ClientOptions` struct. If the string is
    /// malformed or one of the options has an invalid value, an error will be returned.
    ///
    /// The format of a MongoDB connection string is described
    /// [here](https://www.mongodb.com/docs/manual/reference/connection-string/#connection-string-formats).
    ///
    /// The following options are supported in the options query string:
    ///
    ///   * `appName`: maps to the `app_name` field
    ///   * `connectTimeoutMS`: maps to the `connect_timeout` field
    ///   * `heartbeatFrequencyMS`: maps to the `heartbeat_freq` field
    ///   * `journal`: maps to the `journal` field of the `write_concern` field
    ///   * `maxPoolSize`: maps to the `max_pool_size` field
    ///   * `readConcernLevel`: maps to the `read_concern` field
    ///   * `readPreference`: maps to the `read_preference` field
    ///   * `retryReads`: maps to the `retry_reads` field
    ///   * `retryWrites`: maps to the `retry_writes` field
    ///   * `serverSelectionTimeoutMS`: maps to the `server_selection_timeout` field
    ///   * `ssl`: an alias of the `tls` option
    ///   * `threadPoolSize`: maps to the `thread_pool_size` field
    ///   * `tls`: maps to the TLS variant of the `tls` field`.
    ///   * `tlsAllowInvalidCertificates`, `tlsAllowInvalidHostnames`, `tlsCAFile`,
    ///     `tlsCertificateKeyFile`, `tlsCertificateKeyFilePassword`: map to the fields of the
    ///     `TlsOptions` in the `tls` field
    ///   * `w`, `wTimeoutMS`: map to the `write_concern` field
    ///   * `waitQueueTimeoutMS`: maps to the `wait_queue_timeout` field
    pub fn parse(uri: impl AsRef<str>) -> Result<Self> {
        parse::ClientOptionsParser::parse(uri.as_ref()).map(Into::into)
    }

    /// Applies the options in `other` to these options if a value is not already present.
    pub(crate) fn merge(&mut self, other: ClientOptions) {
        merge_options!(
            other,
            self,
            [
                app_name,
                credential,
                default_database,
                max_pool_size,
                thread_pool_size,
                heartbeat_freq,
                connect_timeout,
                server_selection_timeout,
                wait_queue_timeout,
                read_concern,
                write_concern,
                read_preference,
                retry_reads,
                retry_writes,
                tls,
                data_coding_strategy,
                date_coding_strategy,
                uuid_coding_strategy,
                connector
            ]
        );
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_pool_size == Some(0) {
            return Err(Error::invalid_argument("cannot specify maxPoolSize=0"));
        }
        if self.thread_pool_size == Some(0) {
            return Err(Error::invalid_argument("cannot specify threadPoolSize=0"));
        }
        if let Some(ref write_concern) = self.write_concern {
            write_concern.validate()?;
        }
        Ok(())
    }

    pub(crate) fn effective_max_pool_size(&self) -> u32 {
        self.max_pool_size.unwrap_or(DEFAULT_MAX_POOL_SIZE)
    }

    pub(crate) fn effective_thread_pool_size(&self) -> u32 {
        self.thread_pool_size.unwrap_or(DEFAULT_THREAD_POOL_SIZE)
    }
}

/// Contains the options that can be used to create a new
/// [`ClientSession`](crate::ClientSession).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct SessionOptions {
    /// If true, all read operations performed using this client session will share the same
    /// causal consistency metadata. The default is true.
    pub causal_consistency: Option<bool>,

    /// The default options to use for transactions started on this session.
    pub default_transaction_options: Option<TransactionOptions>,
}

/// Contains the options that can be used for a transaction.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct TransactionOptions {
    /// The read concern to use for the transaction.
    pub read_concern: Option<ReadConcern>,

    /// The write concern to use when committing or aborting a transaction.
    pub write_concern: Option<WriteConcern>,

    /// The read preference for all read operations in the transaction.
    pub read_preference: Option<ReadPreference>,
}

/// Specifies the options to a [`Client::list_databases`](crate::Client::list_databases)
/// operation.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct ListDatabasesOptions {
    /// Determines which databases to return based on the user's access privileges. This option is
    /// only supported on server versions 4.0.5+.
    pub authorized_databases: Option<bool>,
}
