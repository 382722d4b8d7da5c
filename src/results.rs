//! Contains the types of results returned by client-level operations.

use serde::{Deserialize, Deserializer};

use crate::bson::{Bson, Document};

/// Information about a database, as returned by
/// [`Client::list_databases`](crate::Client::list_databases).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct DatabaseSpecification {
    /// The name of the database.
    pub name: String,

    /// The amount of disk space in bytes that is consumed by the database.
    #[serde(deserialize_with = "deserialize_size")]
    pub size_on_disk: u64,

    /// Whether the database has any data.
    #[serde(default)]
    pub empty: bool,

    /// For sharded clusters, this field includes a document which maps each shard to the size in
    /// bytes of the database on disk on that shard. For non sharded environments, this field
    /// is `None`.
    pub shards: Option<Document>,
}

/// The reply to a `listDatabases` command, in whichever shape was requested.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ListDatabasesResult {
    /// Full specifications, when `nameOnly` was false.
    Specs(Vec<DatabaseSpecification>),

    /// Only the names, when `nameOnly` was true.
    Names(Vec<String>),
}

/// Servers report sizes as whichever numeric type fits.
fn deserialize_size<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let size = match Bson::deserialize(deserializer)? {
        Bson::Int32(i) => i64::from(i),
        Bson::Int64(i) => i,
        Bson::Double(f) if f.fract() == 0.0 => f as i64,
        other => {
            return Err(serde::de::Error::custom(format!(
                "expected sizeOnDisk to be an integer, got {other:?}"
            )))
        }
    };
    u64::try_from(size).map_err(|_| {
        serde::de::Error::custom(format!("sizeOnDisk must not be negative, got {size}"))
    })
}
