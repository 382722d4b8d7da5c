//! Contains the `Error` and `Result` types that `mongodb_core` uses.

use std::{collections::HashSet, fmt, sync::Arc};

use serde::Deserialize;
use thiserror::Error;

use crate::options::ServerAddress;

/// Label attached to every network error.
pub const NETWORK_ERROR: &str = "NetworkError";

/// The result type for all methods that can return an error in the `mongodb_core` crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in the `mongodb_core` crate. The inner [`ErrorKind`] is boxed to keep
/// `Result`s small.
#[derive(Clone, Debug, Error)]
#[error("Kind: {kind}, labels: {labels:?}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,
    labels: HashSet<String>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, labels: Option<impl IntoIterator<Item = String>>) -> Self {
        let mut labels: HashSet<String> = labels
            .map(|labels| labels.into_iter().collect())
            .unwrap_or_default();
        if kind.is_network_error() {
            labels.insert(NETWORK_ERROR.to_string());
        }
        Self {
            kind: Box::new(kind),
            labels,
        }
    }

    pub(crate) fn internal(message: impl Into<String>) -> Error {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Error {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_response(message: impl Into<String>) -> Error {
        ErrorKind::InvalidResponse {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn logic(message: impl Into<String>) -> Error {
        ErrorKind::Logic {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn client_closed() -> Error {
        Error::logic("Client was already closed")
    }

    pub(crate) fn executor_closed() -> Error {
        Error::logic("Operation executor was already closed")
    }

    pub(crate) fn pool_closed() -> Error {
        Error::logic("Connection pool was already closed")
    }

    pub(crate) fn session_ended() -> Error {
        Error::logic("Tried to use an ended session")
    }

    pub(crate) fn command(err: CommandError) -> Error {
        let labels = err.labels.clone();
        Error::new(ErrorKind::Command(err), Some(labels))
    }

    pub(crate) fn server_selection(message: impl Into<String>) -> Error {
        ErrorKind::ServerSelection {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn wait_queue_timeout(address: &ServerAddress) -> Error {
        ErrorKind::WaitQueueTimeout {
            address: address.clone(),
        }
        .into()
    }

    pub(crate) fn pool_cleared(address: &ServerAddress, cause: &Error) -> Error {
        ErrorKind::ConnectionPoolCleared {
            message: format!(
                "Connection to {} was closed after a network error: {}",
                address, cause
            ),
        }
        .into()
    }

    /// Whether this error is a connectivity error: no connection could be established or a
    /// connection failed mid-operation.
    pub fn is_network_error(&self) -> bool {
        self.kind.is_network_error()
    }

    /// Whether this error was caused by misusing the API, e.g. by using a client after it was
    /// shut down.
    pub fn is_logic_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Logic { .. })
    }

    /// Whether this error was reported by the server in reply to a command.
    pub fn is_command_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Command(_))
    }

    /// The server error code, if any.
    pub fn code(&self) -> Option<i32> {
        match self.kind.as_ref() {
            ErrorKind::Command(err) => Some(err.code),
            _ => None,
        }
    }

    /// Returns the labels for this error.
    pub fn labels(&self) -> &HashSet<String> {
        &self.labels
    }

    /// Whether this error contains the specified label.
    pub fn contains_label<T: AsRef<str>>(&self, label: T) -> bool {
        self.labels.contains(label.as_ref())
    }

    pub(crate) fn add_label<T: AsRef<str>>(&mut self, label: T) {
        self.labels.insert(label.as_ref().to_string());
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Error::new(err.into(), None::<Option<String>>)
    }
}

impl From<bson::de::Error> for ErrorKind {
    fn from(err: bson::de::Error) -> Self {
        Self::BsonDeserialization(err)
    }
}

impl From<bson::ser::Error> for ErrorKind {
    fn from(err: bson::ser::Error) -> Self {
        Self::BsonSerialization(err)
    }
}

impl From<bson::raw::Error> for ErrorKind {
    fn from(err: bson::raw::Error) -> Self {
        Self::InvalidResponse {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<std::io::ErrorKind> for ErrorKind {
    fn from(err: std::io::ErrorKind) -> Self {
        Self::Io(Arc::new(err.into()))
    }
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The API was misused: the client, executor or pool was closed, a session was used after it
    /// ended, or a session was used with a client other than the one that started it.
    #[error("Logic error: {message}")]
    #[non_exhaustive]
    Logic { message: String },

    /// An invalid argument was provided.
    #[error("An invalid argument was provided: {message}")]
    #[non_exhaustive]
    InvalidArgument { message: String },

    /// The server returned an error to an attempted operation.
    #[error("Command failed: {0}")]
    Command(CommandError),

    /// Wrapper around [`std::io::Error`].
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// No server suitable for the operation could be reached.
    #[error("Server selection error: {message}")]
    #[non_exhaustive]
    ServerSelection { message: String },

    /// A connection was closed because its server became unreachable.
    #[error("{message}")]
    #[non_exhaustive]
    ConnectionPoolCleared { message: String },

    /// Timed out waiting for a connection to become available in the pool.
    #[error("Timed out while checking out a connection from connection pool with address {address}")]
    #[non_exhaustive]
    WaitQueueTimeout { address: ServerAddress },

    /// The server returned an invalid reply to a database operation.
    #[error("The server returned an invalid reply to a database operation: {message}")]
    #[non_exhaustive]
    InvalidResponse { message: String },

    /// Wrapper around `bson::de::Error`.
    #[error("{0}")]
    BsonDeserialization(bson::de::Error),

    /// Wrapper around `bson::ser::Error`.
    #[error("{0}")]
    BsonSerialization(bson::ser::Error),

    /// A result had a shape that should never occur. This indicates a bug in `mongodb_core`.
    #[error("Internal error: {message}")]
    #[non_exhaustive]
    Internal { message: String },
}

impl ErrorKind {
    fn is_network_error(&self) -> bool {
        matches!(
            self,
            Self::Io(..)
                | Self::ServerSelection { .. }
                | Self::ConnectionPoolCleared { .. }
                | Self::WaitQueueTimeout { .. }
        )
    }
}

/// An error that occurred due to a database command failing.
#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct CommandError {
    /// Identifies the type of error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default = "String::new")]
    pub message: String,

    /// Labels attached by the server.
    #[serde(rename = "errorLabels", default)]
    pub(crate) labels: Vec<String>,
}

impl fmt::Display for CommandError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "Error code {} ({}): {}",
            self.code, self.code_name, self.message
        )
    }
}
