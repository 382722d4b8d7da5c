//! Operations: typed descriptions of the commands the client sends and how to read their replies.

mod aggregate;
mod get_more;
mod kill_cursors;
mod list_databases;
mod run_command;
mod transaction;

use std::{collections::VecDeque, fmt::Debug};

use serde::{Deserialize, Serialize};

use crate::{
    bson::{Document, Timestamp},
    cmap::{Command, RawCommandResponse, StreamDescription},
    error::{Error, Result},
    selection_criteria::SelectionCriteria,
    Namespace,
};

pub(crate) use self::{
    aggregate::{Aggregate, AggregateTarget},
    get_more::{GetMore, GetMoreResult},
    kill_cursors::KillCursors,
    list_databases::ListDatabases,
    run_command::RunCommand,
    transaction::{AbortTransaction, CommitTransaction},
};

/// A server-side operation that can be run through [`Client::execute_operation`].
///
/// An operation is built into a [`Command`] once a connection has been chosen, and then
/// interprets the server's reply. Replies with `ok: 0` are turned into errors before
/// `handle_response` is called.
///
/// [`Client::execute_operation`]: crate::Client::execute_operation
pub trait Operation: Send + 'static {
    /// The output type of this operation.
    type O: Send + 'static;

    /// The name of the server side command associated with this operation.
    const NAME: &'static str;

    /// Returns the command that should be sent to the server as part of this operation.
    fn build(&mut self, description: &StreamDescription) -> Result<Command>;

    /// Interprets the server response to the command.
    fn handle_response(
        &self,
        response: RawCommandResponse,
        description: &StreamDescription,
    ) -> Result<Self::O>;

    /// Interpret an error encountered while sending the built command to the server, potentially
    /// recovering.
    fn handle_error(&self, error: Error) -> Result<Self::O> {
        Err(error)
    }

    /// Criteria to use for selecting the server that this operation will be executed on.
    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        None
    }

    /// Whether the command may carry a session id.
    fn supports_sessions(&self) -> bool {
        true
    }

    /// Whether `afterClusterTime` may be attached to this operation's read concern in a causally
    /// consistent session.
    fn supports_read_concern(&self) -> bool {
        false
    }
}

/// Appends a serializable options struct to the command body.
pub(crate) fn append_options<T: Serialize + Debug>(
    doc: &mut Document,
    options: Option<&T>,
) -> Result<()> {
    if let Some(options) = options {
        let options_doc = bson::to_document(options)?;
        doc.extend(options_doc);
    }
    Ok(())
}

/// The `cursor` subdocument of a reply to a cursor-opening command or a `getMore`.
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CursorInfo {
    pub(crate) id: i64,

    #[serde(deserialize_with = "Namespace::deserialize_ns")]
    pub(crate) ns: Namespace,

    #[serde(alias = "nextBatch", default)]
    pub(crate) first_batch: VecDeque<Document>,

    pub(crate) post_batch_resume_token: Option<Document>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CursorBody {
    pub(crate) cursor: CursorInfo,

    #[serde(rename = "operationTime")]
    pub(crate) operation_time: Option<Timestamp>,
}

#[derive(Deserialize, Debug)]
pub(crate) struct EmptyBody {}
