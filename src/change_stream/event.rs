//! Change events and the types that identify where a stream resumes.

use serde::{Deserialize, Serialize};

use crate::{
    bson::{Bson, Document, Timestamp},
    Namespace,
};

/// The `_id` of a change event, or a post-batch token reported by the server.
///
/// Pass one back as `resume_after` or `start_after` in
/// [`ChangeStreamOptions`](crate::change_stream::options::ChangeStreamOptions) to pick up a
/// stream where an earlier one stopped. Its contents are opaque.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ResumeToken(pub(crate) Bson);

impl ResumeToken {
    pub(crate) fn from_document(document: Document) -> Self {
        ResumeToken(Bson::Document(document))
    }

    pub(crate) fn from_event(event: &Document) -> Option<Self> {
        event.get("_id").cloned().map(ResumeToken)
    }
}

/// One change reported by a [`ChangeStream`](crate::change_stream::ChangeStream). `T` is the type
/// `full_document` is decoded into.
#[allow(missing_docs)]
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ChangeStreamEvent<T> {
    #[serde(rename = "_id")]
    pub id: ResumeToken,

    pub operation_type: OperationType,

    /// Where the change happened. Missing for events that are not tied to a namespace.
    pub ns: Option<ChangeStreamEventSource>,

    /// The `_id` of the affected document, plus the shard key on sharded collections.
    pub document_key: Option<Document>,

    /// Set for `update` events only.
    pub update_description: Option<UpdateDescription>,

    /// The document after the change. Update events only carry it when the stream was opened
    /// with a [`FullDocumentType`](crate::change_stream::options::FullDocumentType).
    #[serde(default = "Option::default")]
    pub full_document: Option<T>,

    pub cluster_time: Option<Timestamp>,
}

/// The fields an update set or removed.
#[allow(missing_docs)]
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct UpdateDescription {
    pub updated_fields: Document,
    pub removed_fields: Vec<String>,
}

#[allow(missing_docs)]
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum OperationType {
    Insert,
    Update,
    Replace,
    Delete,
    Drop,
    Rename,
    DropDatabase,

    /// The stream can no longer continue, e.g. because the watched collection was dropped.
    Invalidate,
}

/// The `ns` field of an event: a full namespace, or just a database name.
#[allow(missing_docs)]
#[derive(Deserialize, Debug)]
#[serde(untagged)]
#[non_exhaustive]
pub enum ChangeStreamEventSource {
    Namespace(Namespace),
    Database(String),
}
