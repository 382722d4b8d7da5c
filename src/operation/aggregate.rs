use std::collections::VecDeque;

use crate::{
    bson::{doc, Bson, Document, Timestamp},
    cmap::{Command, RawCommandResponse, StreamDescription},
    error::{Error, Result},
    options::{ReadConcern, SelectionCriteria, ServerAddress},
    Namespace,
};

use super::{CursorBody, Operation};

/// Runs an aggregation that opens a server-side cursor.
#[derive(Debug)]
pub(crate) struct Aggregate {
    target: AggregateTarget,
    pipeline: Vec<Document>,
    batch_size: Option<u32>,
    read_concern: Option<ReadConcern>,
    selection_criteria: Option<SelectionCriteria>,
}

/// What an aggregation runs against.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum AggregateTarget {
    Database(String),
    Collection(Namespace),
}

impl AggregateTarget {
    fn to_bson(&self) -> Bson {
        match self {
            AggregateTarget::Database(_) => Bson::Int32(1),
            AggregateTarget::Collection(ref ns) => Bson::String(ns.coll.to_string()),
        }
    }

    fn db_name(&self) -> &str {
        match self {
            AggregateTarget::Database(ref s) => s.as_str(),
            AggregateTarget::Collection(ref ns) => ns.db.as_str(),
        }
    }
}

/// The first batch of a cursor and where to send `getMore`s for the rest.
#[derive(Debug, Clone)]
pub(crate) struct CursorSpecification {
    pub(crate) id: i64,
    pub(crate) ns: Namespace,
    pub(crate) address: ServerAddress,
    pub(crate) initial_buffer: VecDeque<Document>,
    pub(crate) post_batch_resume_token: Option<Document>,
    pub(crate) operation_time: Option<Timestamp>,
}

impl Aggregate {
    pub(crate) fn new(
        target: AggregateTarget,
        pipeline: impl IntoIterator<Item = Document>,
        batch_size: Option<u32>,
        read_concern: Option<ReadConcern>,
        selection_criteria: Option<SelectionCriteria>,
    ) -> Self {
        Self {
            target,
            pipeline: pipeline.into_iter().collect(),
            batch_size,
            read_concern,
            selection_criteria,
        }
    }
}

impl Operation for Aggregate {
    type O = CursorSpecification;

    const NAME: &'static str = "aggregate";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut cursor = Document::new();
        if let Some(batch_size) = self.batch_size {
            let batch_size = i32::try_from(batch_size).map_err(|_| {
                Error::invalid_argument("The batch size must fit into a signed 32-bit integer")
            })?;
            cursor.insert("batchSize", batch_size);
        }

        let mut body = doc! {
            Self::NAME: self.target.to_bson(),
            "pipeline": self.pipeline.iter().cloned().map(Bson::Document).collect::<Vec<_>>(),
            "cursor": cursor,
        };
        if let Some(read_concern) = self.read_concern.as_ref().filter(|rc| !rc.is_server_default())
        {
            body.insert("readConcern", read_concern.to_command_document(None));
        }

        Ok(Command::new(Self::NAME, self.target.db_name(), body))
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        description: &StreamDescription,
    ) -> Result<Self::O> {
        let body: CursorBody = response.body()?;
        Ok(CursorSpecification {
            id: body.cursor.id,
            ns: body.cursor.ns,
            address: description.server_address.clone(),
            initial_buffer: body.cursor.first_batch,
            post_batch_resume_token: body.cursor.post_batch_resume_token,
            operation_time: body.operation_time,
        })
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.selection_criteria.as_ref()
    }

    fn supports_read_concern(&self) -> bool {
        true
    }
}
