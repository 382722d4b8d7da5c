use std::time::Duration;

use bson::{doc, Document};
use serde::Deserialize;

use crate::{
    cmap::{Command, RawCommandResponse},
    error::Result,
    options::ServerAddress,
    sdam::ServerType,
};

/// Construct a hello command, including the client metadata when this is the first message on a
/// new stream.
pub(crate) fn hello_command(metadata: Option<&Document>) -> Command {
    let mut body = doc! { "hello": 1, "helloOk": true };
    if let Some(metadata) = metadata {
        body.insert("client", metadata.clone());
    }
    Command::new("hello", "admin", body)
}

/// The client metadata sent in the handshake.
pub(crate) fn client_metadata(app_name: Option<&str>) -> Document {
    let mut metadata = doc! {
        "driver": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
        "os": {
            "type": std::env::consts::OS,
            "architecture": std::env::consts::ARCH,
        },
        "platform": format!("rustc {}", rustc_version_runtime::version()),
    };
    if let Some(name) = app_name {
        metadata.insert("application", doc! { "name": name });
    }
    metadata
}

/// The parsed reply to a hello command, along with the round trip time it took.
#[derive(Debug, Clone)]
pub(crate) struct HelloReply {
    pub(crate) server_address: ServerAddress,
    pub(crate) command_response: HelloCommandResponse,
    pub(crate) raw_command_response: Document,
    pub(crate) round_trip_time: Duration,
}

impl HelloReply {
    pub(crate) fn parse(response: RawCommandResponse, round_trip_time: Duration) -> Result<Self> {
        response.validate()?;
        Ok(Self {
            server_address: response.source_address().clone(),
            command_response: response.body()?,
            raw_command_response: response.raw().clone(),
            round_trip_time,
        })
    }
}

/// The response to a `hello` command.
///
/// See the documentation [here](https://www.mongodb.com/docs/manual/reference/command/hello/) for more details.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HelloCommandResponse {
    /// Whether the server is writable. If true, this instance is a primary in a replica set, a
    /// mongos instance, or a standalone mongod.
    pub(crate) is_writable_primary: Option<bool>,

    /// Legacy name for `is_writable_primary` field.
    #[serde(rename = "ismaster")]
    pub(crate) is_master: Option<bool>,

    /// The list of all hosts.
    pub(crate) hosts: Option<Vec<String>>,

    /// The list of all passives in a replica set.
    pub(crate) passives: Option<Vec<String>>,

    /// The list of all arbiters in a replica set.
    pub(crate) arbiters: Option<Vec<String>>,

    /// An optional message. This contains the value "isdbgrid" when returned from a mongos.
    pub(crate) msg: Option<String>,

    /// The name of the replica set, if any.
    pub(crate) set_name: Option<String>,

    /// Whether the server is hidden.
    pub(crate) hidden: Option<bool>,

    /// Whether the server is a secondary.
    pub(crate) secondary: Option<bool>,

    /// Whether the server is an arbiter.
    pub(crate) arbiter_only: Option<bool>,

    /// Whether the server is a replica set member that has not been initialized yet.
    #[serde(rename = "isreplicaset")]
    pub(crate) is_replica_set: Option<bool>,

    /// The time in minutes that a session remains active after its most recent use.
    pub(crate) logical_session_timeout_minutes: Option<i64>,

    /// The maximum permitted size of a BSON object in bytes.
    pub(crate) max_bson_object_size: Option<i64>,

    /// The maximum wire version that the server understands.
    pub(crate) max_wire_version: Option<i32>,
}

impl HelloCommandResponse {
    pub(crate) fn server_type(&self) -> ServerType {
        if self.msg.as_deref() == Some("isdbgrid") {
            ServerType::Mongos
        } else if self.set_name.is_some() {
            if self.hidden == Some(true) {
                ServerType::RsOther
            } else if self.is_writable_primary == Some(true) || self.is_master == Some(true) {
                ServerType::RsPrimary
            } else if self.secondary == Some(true) {
                ServerType::RsSecondary
            } else if self.arbiter_only == Some(true) {
                ServerType::RsArbiter
            } else {
                ServerType::RsOther
            }
        } else if self.is_replica_set == Some(true) {
            ServerType::RsGhost
        } else {
            ServerType::Standalone
        }
    }

    /// Every member this server reports as part of its replica set.
    pub(crate) fn all_hosts(&self) -> impl Iterator<Item = &String> {
        self.hosts
            .iter()
            .chain(self.passives.iter())
            .chain(self.arbiters.iter())
            .flatten()
    }
}
