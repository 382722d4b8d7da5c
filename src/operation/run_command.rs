use crate::{
    bson::Document,
    cmap::{Command, RawCommandResponse, StreamDescription},
    error::{Error, Result},
    selection_criteria::SelectionCriteria,
};

use super::Operation;

/// Commands that must not be sent with a session id.
const SESSIONLESS_COMMANDS: &[&str] = &["hello", "ismaster", "killcursors"];

/// Runs an arbitrary command document against a database.
#[derive(Debug, Clone)]
pub(crate) struct RunCommand {
    db: String,
    command: Document,
    selection_criteria: Option<SelectionCriteria>,
}

impl RunCommand {
    pub(crate) fn new(
        db: String,
        command: Document,
        selection_criteria: Option<SelectionCriteria>,
    ) -> Self {
        Self {
            db,
            command,
            selection_criteria,
        }
    }

    fn command_name(&self) -> Option<&str> {
        self.command.keys().next().map(String::as_str)
    }
}

impl Operation for RunCommand {
    type O = Document;

    // Placeholder; the real name is the first key of the command document.
    const NAME: &'static str = "$runCommand";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        match self.command_name() {
            Some(name) => Ok(Command::new(name, self.db.clone(), self.command.clone())),
            None => Err(Error::invalid_argument("run_command requires a non-empty document")),
        }
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        Ok(response.into_document())
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.selection_criteria.as_ref()
    }

    fn supports_sessions(&self) -> bool {
        match self.command_name() {
            Some(name) => !SESSIONLESS_COMMANDS.contains(&name.to_lowercase().as_str()),
            None => false,
        }
    }
}
