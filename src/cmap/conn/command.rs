use bson::{Bson, Document, Timestamp};
use serde::de::DeserializeOwned;

use crate::{
    client::session::ClusterTime,
    error::{CommandError, Error, Result},
    options::ServerAddress,
    selection_criteria::ReadPreference,
};

/// `Command` is a driver side abstraction of a server command containing all the information
/// necessary to serialize it to a wire message.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub(crate) name: String,
    pub(crate) target_db: String,
    pub(crate) body: Document,
}

impl Command {
    /// Constructs a new command named `name` that runs against `target_db`.
    pub fn new(name: impl Into<String>, target_db: impl Into<String>, body: Document) -> Self {
        Self {
            name: name.into(),
            target_db: target_db.into(),
            body,
        }
    }

    /// The name of the command.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The database the command runs against.
    pub fn target_db(&self) -> &str {
        &self.target_db
    }

    /// The command document, without `$db` or session fields.
    pub fn body(&self) -> &Document {
        &self.body
    }

    pub(crate) fn set_session(&mut self, lsid: &Document) {
        self.body.insert("lsid", lsid.clone());
    }

    pub(crate) fn set_cluster_time(&mut self, cluster_time: &ClusterTime) {
        // this should never fail.
        if let Ok(doc) = bson::to_bson(cluster_time) {
            self.body.insert("$clusterTime", doc);
        }
    }

    pub(crate) fn set_txn_number(&mut self, txn_number: i64) {
        self.body.insert("txnNumber", txn_number);
    }

    pub(crate) fn set_start_transaction(&mut self) {
        self.body.insert("startTransaction", true);
    }

    pub(crate) fn set_autocommit(&mut self) {
        self.body.insert("autocommit", false);
    }

    pub(crate) fn set_read_preference(&mut self, read_preference: ReadPreference) {
        self.body
            .insert("$readPreference", read_preference.to_document());
    }

    /// Adds `afterClusterTime` to the command's read concern, creating one if necessary.
    pub(crate) fn set_after_cluster_time(&mut self, operation_time: Timestamp) {
        match self.body.get_mut("readConcern") {
            Some(Bson::Document(read_concern)) => {
                read_concern.insert("afterClusterTime", operation_time);
            }
            _ => {
                let mut read_concern = Document::new();
                read_concern.insert("afterClusterTime", operation_time);
                self.body.insert("readConcern", read_concern);
            }
        }
    }

    pub(crate) fn is_read_concern_set(&self) -> bool {
        self.body.contains_key("readConcern")
    }

    /// The document sent on the wire.
    pub(crate) fn to_wire_document(&self) -> Document {
        let mut doc = self.body.clone();
        doc.insert("$db", self.target_db.clone());
        doc
    }
}

/// A server reply to a [`Command`], before it is interpreted by an operation.
#[derive(Debug, Clone)]
pub struct RawCommandResponse {
    source: ServerAddress,
    raw: Document,
}

impl RawCommandResponse {
    pub(crate) fn new(source: ServerAddress, raw: Document) -> Self {
        Self { source, raw }
    }

    #[cfg(test)]
    pub(crate) fn with_document(raw: Document) -> Self {
        Self::new(ServerAddress::default(), raw)
    }

    /// Whether this response indicates a success or not (i.e. if "ok: 1").
    pub fn is_success(&self) -> bool {
        match self.raw.get("ok") {
            Some(Bson::Int32(i)) => *i == 1,
            Some(Bson::Int64(i)) => *i == 1,
            Some(Bson::Double(f)) => *f == 1.0,
            Some(Bson::Boolean(b)) => *b,
            _ => false,
        }
    }

    /// Returns an error if this response corresponds to a command failure.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.is_success() {
            return Ok(());
        }
        let command_error: CommandError = bson::from_document(self.raw.clone())
            .map_err(|_| Error::invalid_response("invalid server response"))?;
        Err(Error::command(command_error))
    }

    /// Deserialize the body of the response.
    pub fn body<T: DeserializeOwned>(&self) -> Result<T> {
        bson::from_document(self.raw.clone()).map_err(|e| Error::invalid_response(e.to_string()))
    }

    /// The full reply document.
    pub fn raw(&self) -> &Document {
        &self.raw
    }

    pub(crate) fn into_document(self) -> Document {
        self.raw
    }

    /// Gets the cluster time from the response, if any.
    pub(crate) fn cluster_time(&self) -> Option<ClusterTime> {
        self.raw
            .get_document("$clusterTime")
            .ok()
            .and_then(|subdoc| bson::from_document(subdoc.clone()).ok())
    }

    /// Gets the operation time from the response, if any.
    pub(crate) fn operation_time(&self) -> Option<Timestamp> {
        self.raw.get_timestamp("operationTime").ok()
    }

    /// The address of the server that sent this response.
    pub fn source_address(&self) -> &ServerAddress {
        &self.source
    }
}
