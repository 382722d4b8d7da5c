use std::{collections::VecDeque, time::Duration};

use crate::{
    bson::{doc, Document},
    cmap::{Command, RawCommandResponse, StreamDescription},
    error::{Error, Result},
    operation::{CursorBody, Operation},
    options::{SelectionCriteria, ServerAddress},
    Namespace,
};

/// Fetches the next batch of a cursor from the server that opened it.
#[derive(Debug)]
pub(crate) struct GetMore {
    ns: Namespace,
    cursor_id: i64,
    selection_criteria: SelectionCriteria,
    batch_size: Option<u32>,
    max_time: Option<Duration>,
}

#[derive(Debug, Clone)]
pub(crate) struct GetMoreResult {
    pub(crate) batch: VecDeque<Document>,
    pub(crate) id: i64,
    pub(crate) post_batch_resume_token: Option<Document>,
}

impl GetMoreResult {
    pub(crate) fn exhausted(&self) -> bool {
        self.id == 0
    }
}

impl GetMore {
    pub(crate) fn new(
        ns: Namespace,
        cursor_id: i64,
        address: ServerAddress,
        batch_size: Option<u32>,
        max_time: Option<Duration>,
    ) -> Self {
        Self {
            ns,
            cursor_id,
            selection_criteria: SelectionCriteria::from_address(address),
            batch_size,
            max_time,
        }
    }
}

impl Operation for GetMore {
    type O = GetMoreResult;

    const NAME: &'static str = "getMore";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = doc! {
            Self::NAME: self.cursor_id,
            "collection": self.ns.coll.clone(),
        };

        if let Some(batch_size) = self.batch_size {
            if batch_size > i32::MAX as u32 {
                return Err(Error::invalid_argument(
                    "The batch size must fit into a signed 32-bit integer",
                ));
            } else if batch_size != 0 {
                body.insert("batchSize", batch_size as i32);
            }
        }

        if let Some(ref max_time) = self.max_time {
            body.insert(
                "maxTimeMS",
                i32::try_from(max_time.as_millis()).unwrap_or(i32::MAX),
            );
        }

        Ok(Command::new(Self::NAME, self.ns.db.clone(), body))
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        let body: CursorBody = response.body()?;
        Ok(GetMoreResult {
            batch: body.cursor.first_batch,
            id: body.cursor.id,
            post_batch_resume_token: body.cursor.post_batch_resume_token,
        })
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        Some(&self.selection_criteria)
    }
}
