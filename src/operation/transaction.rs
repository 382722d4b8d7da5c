use crate::{
    bson::{doc, Document},
    cmap::{Command, RawCommandResponse, StreamDescription},
    error::Result,
    operation::{EmptyBody, Operation},
    options::WriteConcern,
};

/// Commits the transaction of the session it runs with.
#[derive(Debug)]
pub(crate) struct CommitTransaction {
    write_concern: Option<WriteConcern>,
}

impl CommitTransaction {
    pub(crate) fn new(write_concern: Option<WriteConcern>) -> Self {
        Self { write_concern }
    }
}

/// Aborts the transaction of the session it runs with.
#[derive(Debug)]
pub(crate) struct AbortTransaction {
    write_concern: Option<WriteConcern>,
}

impl AbortTransaction {
    pub(crate) fn new(write_concern: Option<WriteConcern>) -> Self {
        Self { write_concern }
    }
}

/// Both commands are `{ <name>: 1 }` against `admin`, with the write concern attached unless it is
/// the server default. Replies carry nothing beyond `ok`.
macro_rules! end_transaction {
    ($op:ty, $name:literal) => {
        impl Operation for $op {
            type O = ();

            const NAME: &'static str = $name;

            fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
                let body = end_transaction_body(Self::NAME, self.write_concern.as_ref())?;
                Ok(Command::new(Self::NAME, "admin", body))
            }

            fn handle_response(
                &self,
                response: RawCommandResponse,
                _description: &StreamDescription,
            ) -> Result<Self::O> {
                response.body::<EmptyBody>().map(|_| ())
            }
        }
    };
}

end_transaction!(CommitTransaction, "commitTransaction");
end_transaction!(AbortTransaction, "abortTransaction");

fn end_transaction_body(name: &str, write_concern: Option<&WriteConcern>) -> Result<Document> {
    let mut body = doc! { name: 1 };
    match write_concern {
        Some(wc) if !wc.is_server_default() => {
            body.insert("writeConcern", crate::bson::to_bson(wc)?);
        }
        _ => {}
    }
    Ok(body)
}
