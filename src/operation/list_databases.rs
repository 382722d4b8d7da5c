use serde::Deserialize;

use crate::{
    bson::{doc, Document},
    cmap::{Command, RawCommandResponse, StreamDescription},
    error::Result,
    operation::Operation,
    options::ListDatabasesOptions,
    results::{DatabaseSpecification, ListDatabasesResult},
    selection_criteria::{ReadPreference, SelectionCriteria},
};

#[derive(Debug)]
pub(crate) struct ListDatabases {
    filter: Option<Document>,
    name_only: bool,
    options: Option<ListDatabasesOptions>,
    selection_criteria: SelectionCriteria,
}

impl ListDatabases {
    pub(crate) fn new(
        filter: Option<Document>,
        name_only: bool,
        options: Option<ListDatabasesOptions>,
    ) -> Self {
        ListDatabases {
            filter,
            name_only,
            options,
            selection_criteria: SelectionCriteria::ReadPreference(ReadPreference::Primary),
        }
    }
}

impl Operation for ListDatabases {
    type O = ListDatabasesResult;

    const NAME: &'static str = "listDatabases";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = doc! { Self::NAME: 1, "nameOnly": self.name_only };
        if let Some(filter) = &self.filter {
            body.insert("filter", filter.clone());
        }
        let authorized = self.options.as_ref().and_then(|o| o.authorized_databases);
        if let Some(authorized) = authorized {
            body.insert("authorizedDatabases", authorized);
        }
        Ok(Command::new(Self::NAME, "admin", body))
    }

    fn handle_response(
        &self,
        raw_response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        if !self.name_only {
            let reply: Reply<DatabaseSpecification> = raw_response.body()?;
            return Ok(ListDatabasesResult::Specs(reply.databases));
        }
        let reply: Reply<NameOnly> = raw_response.body()?;
        let names = reply.databases.into_iter().map(|db| db.name).collect();
        Ok(ListDatabasesResult::Names(names))
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        Some(&self.selection_criteria)
    }
}

#[derive(Debug, Deserialize)]
struct Reply<T> {
    databases: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct NameOnly {
    name: String,
}
