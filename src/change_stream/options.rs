//! Options for [`ChangeStream`](crate::change_stream::ChangeStream)s.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;

use crate::{bson::Timestamp, change_stream::event::ResumeToken};

/// Options for opening a [`ChangeStream`](crate::change_stream::ChangeStream).
///
/// Everything except `max_await_time` and `batch_size` is sent as the body of the
/// `$changeStream` stage; those two configure the cursor instead.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, Serialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ChangeStreamOptions {
    /// Whether update events carry the current version of the changed document.
    pub full_document: Option<FullDocumentType>,

    /// Resume after the event this token belongs to. Mutually exclusive with `start_after`.
    pub resume_after: Option<ResumeToken>,

    /// Only report changes at or after this cluster time.
    pub start_at_operation_time: Option<Timestamp>,

    /// Like `resume_after`, but also accepted when the token is an invalidate event, so a
    /// dropped or renamed collection can keep being watched.
    pub start_after: Option<ResumeToken>,

    /// Sent as `maxTimeMS` on each `getMore`.
    #[serde(skip_serializing)]
    pub max_await_time: Option<Duration>,

    /// Batch size for the initial `aggregate` and every `getMore`.
    #[serde(skip_serializing)]
    pub batch_size: Option<u32>,
}

/// Values for [`ChangeStreamOptions::full_document`].
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum FullDocumentType {
    /// Look up the current document for every update event.
    UpdateLookup,

    /// Include the post-image when the collection records one.
    WhenAvailable,

    /// Include the post-image, failing the stream if it is missing.
    Required,
}
