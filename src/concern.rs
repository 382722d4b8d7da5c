//! Contains the types for read concerns and write concerns.


use std::time::Duration;

use bson::{Document, Timestamp};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;

use crate::error::{Error, Result};

/// The consistency and isolation a read asks of a replica set or sharded cluster.
///
/// A `ReadConcern` with no level is the server's default read concern. Clients and databases never
/// store one; see [`ReadConcern::is_server_default`].
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ReadConcern {
    /// The level of the read concern.
    pub level: Option<ReadConcernLevel>,
}

impl ReadConcern {
    /// Creates a read concern with level "majority".
    pub fn majority() -> Self {
        ReadConcernLevel::Majority.into()
    }

    /// Creates a read concern with level "local".
    pub fn local() -> Self {
        ReadConcernLevel::Local.into()
    }

    /// Creates a read concern with level "linearizable".
    pub fn linearizable() -> Self {
        ReadConcernLevel::Linearizable.into()
    }

    /// Creates a read concern with level "available".
    pub fn available() -> Self {
        ReadConcernLevel::Available.into()
    }

    /// Creates a read concern with level "snapshot".
    pub fn snapshot() -> Self {
        ReadConcernLevel::Snapshot.into()
    }

    /// Creates a read concern with a custom level.
    pub fn custom(level: impl AsRef<str>) -> Self {
        ReadConcernLevel::from_str(level.as_ref()).into()
    }

    /// The read concern the server applies when none is sent.
    pub fn server_default() -> Self {
        Self { level: None }
    }

    /// Whether this read concern is identical to the one the server applies when none is sent.
    pub fn is_server_default(&self) -> bool {
        self.level.is_none()
    }

    /// Builds the `readConcern` document to attach to a command, adding `afterClusterTime` for
    /// causally consistent reads.
    pub(crate) fn to_command_document(&self, after_cluster_time: Option<Timestamp>) -> Document {
        let mut doc = Document::new();
        if let Some(ref level) = self.level {
            doc.insert("level", level.as_str());
        }
        if let Some(ts) = after_cluster_time {
            doc.insert("afterClusterTime", ts);
        }
        doc
    }
}

impl From<ReadConcernLevel> for ReadConcern {
    fn from(level: ReadConcernLevel) -> Self {
        Self { level: Some(level) }
    }
}

/// The level of a [`ReadConcern`]. Levels are sent to the server by name.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum ReadConcernLevel {
    /// `"local"`: the instance's most recent data, with no durability guarantee.
    Local,

    /// `"majority"`: data acknowledged by a majority of the replica set.
    Majority,

    /// `"linearizable"`: majority-acknowledged data that reflects every write that completed
    /// before the read started.
    Linearizable,

    /// `"available"`: like `local`, but may return orphaned documents on sharded clusters.
    Available,

    /// `"snapshot"`: majority-committed data as of a single point in time.
    Snapshot,

    /// Any other level name, passed through unchanged.
    Custom(String),
}

impl ReadConcernLevel {
    pub(crate) fn from_str(s: &str) -> Self {
        match s {
            "local" => ReadConcernLevel::Local,
            "majority" => ReadConcernLevel::Majority,
            "linearizable" => ReadConcernLevel::Linearizable,
            "available" => ReadConcernLevel::Available,
            "snapshot" => ReadConcernLevel::Snapshot,
            s => ReadConcernLevel::Custom(s.to_string()),
        }
    }

    /// Gets the string representation of the `ReadConcernLevel`.
    pub(crate) fn as_str(&self) -> &str {
        match self {
            ReadConcernLevel::Local => "local",
            ReadConcernLevel::Majority => "majority",
            ReadConcernLevel::Linearizable => "linearizable",
            ReadConcernLevel::Available => "available",
            ReadConcernLevel::Snapshot => "snapshot",
            ReadConcernLevel::Custom(ref s) => s,
        }
    }
}

impl<'de> Deserialize<'de> for ReadConcernLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(ReadConcernLevel::from_str(&s))
    }
}

impl Serialize for ReadConcernLevel {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.as_str().serialize(serializer)
    }
}

/// Specifies the level of acknowledgement requested from the server for write operations.
///
/// A `WriteConcern` with every field unset is the server's default write concern.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, TypedBuilder, Serialize, Deserialize)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct WriteConcern {
    /// Which servers must acknowledge the write.
    pub w: Option<Acknowledgment>,

    /// How long the server waits for the acknowledgement in `w` before reporting a write concern
    /// error.
    #[serde(rename = "wtimeout", serialize_with = "serialize_duration_option_as_millis")]
    #[serde(deserialize_with = "deserialize_duration_option_from_millis", default)]
    pub w_timeout: Option<Duration>,

    /// Whether the write must reach the on-disk journal before it is acknowledged.
    #[serde(rename = "j", alias = "journal")]
    pub journal: Option<bool>,
}

/// How many servers must acknowledge a write: the `w` field of a [`WriteConcern`].
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum Acknowledgment {
    /// A fixed number of servers. Zero requests no acknowledgement at all.
    Nodes(u32),

    /// A majority of the data-bearing voting members.
    Majority,

    /// A write concern name defined in the replica set's configuration.
    Custom(String),
}

impl Serialize for Acknowledgment {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Acknowledgment::Majority => serializer.serialize_str("majority"),
            Acknowledgment::Nodes(n) => {
                serializer.serialize_i32(i32::try_from(*n).unwrap_or(i32::MAX))
            }
            Acknowledgment::Custom(name) => serializer.serialize_str(name),
        }
    }
}

impl<'de> Deserialize<'de> for Acknowledgment {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum IntOrString {
            Int(u32),
            String(String),
        }
        match IntOrString::deserialize(deserializer)? {
            IntOrString::String(s) => Ok(s.into()),
            IntOrString::Int(i) => Ok(i.into()),
        }
    }
}

impl From<u32> for Acknowledgment {
    fn from(i: u32) -> Self {
        Acknowledgment::Nodes(i)
    }
}

impl From<&str> for Acknowledgment {
    fn from(s: &str) -> Self {
        match s {
            "majority" => Acknowledgment::Majority,
            name => Acknowledgment::Custom(name.to_string()),
        }
    }
}

impl From<String> for Acknowledgment {
    fn from(s: String) -> Self {
        match s.as_str() {
            "majority" => Acknowledgment::Majority,
            _ => Acknowledgment::Custom(s),
        }
    }
}

impl WriteConcern {
    /// A write concern requiring acknowledgement from `v` nodes.
    pub fn nodes(v: u32) -> Self {
        Acknowledgment::Nodes(v).into()
    }

    /// A write concern requiring acknowledgement from a majority of nodes.
    pub fn majority() -> Self {
        Acknowledgment::Majority.into()
    }

    /// A write concern using a custom server-side write concern name.
    pub fn custom(s: impl AsRef<str>) -> Self {
        Acknowledgment::from(s.as_ref()).into()
    }

    /// Whether this write concern is identical to the one the server applies when none is sent.
    pub fn is_server_default(&self) -> bool {
        self.w.is_none() && self.w_timeout.is_none() && self.journal.is_none()
    }

    /// Rejects `w: 0` combined with `j: true`, and timeouts that do not fit the wire format.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.w == Some(Acknowledgment::Nodes(0)) && self.journal == Some(true) {
            return Err(Error::invalid_argument(
                "write concern cannot have w=0 and j=true",
            ));
        }

        if let Some(w_timeout) = self.w_timeout {
            if w_timeout > Duration::from_millis(i64::MAX as u64) {
                return Err(Error::invalid_argument(
                    "write concern `w_timeout` field cannot exceed i64::MAX milliseconds",
                ));
            }
        }

        Ok(())
    }
}

impl From<Acknowledgment> for WriteConcern {
    fn from(w: Acknowledgment) -> Self {
        WriteConcern {
            w: Some(w),
            w_timeout: None,
            journal: None,
        }
    }
}

fn serialize_duration_option_as_millis<S: Serializer>(
    val: &Option<Duration>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match val {
        Some(duration) => {
            serializer.serialize_i64(duration.as_millis().min(i64::MAX as u128) as i64)
        }
        None => serializer.serialize_none(),
    }
}

fn deserialize_duration_option_from_millis<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let millis = Option::<i64>::deserialize(deserializer)?;
    Ok(millis.map(|m| Duration::from_millis(m.max(0) as u64)))
}
