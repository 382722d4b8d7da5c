//! Targets and field formatting for the `tracing` events this crate emits.

use bson::Bson;

use crate::{error::Error, options::ServerAddress, selection_criteria::SelectionCriteria};

pub(crate) const COMMAND_TRACING_EVENT_TARGET: &str = "mongodb_core::command";
pub(crate) const CONNECTION_TRACING_EVENT_TARGET: &str = "mongodb_core::connection";
pub(crate) const SERVER_SELECTION_TRACING_EVENT_TARGET: &str = "mongodb_core::server_selection";
pub(crate) const TOPOLOGY_TRACING_EVENT_TARGET: &str = "mongodb_core::topology";

/// Documents longer than this are truncated in command events.
pub(crate) const DEFAULT_MAX_DOCUMENT_LENGTH_BYTES: usize = 1000;

pub(crate) trait TracingRepresentation {
    type Representation;

    fn tracing_representation(&self) -> Self::Representation;
}

impl TracingRepresentation for bson::Document {
    type Representation = String;

    fn tracing_representation(&self) -> String {
        let mut ext_json = Bson::Document(self.clone())
            .into_relaxed_extjson()
            .to_string();
        truncate_on_char_boundary(&mut ext_json, DEFAULT_MAX_DOCUMENT_LENGTH_BYTES);
        ext_json
    }
}

impl TracingRepresentation for Error {
    type Representation = String;

    fn tracing_representation(&self) -> String {
        self.to_string()
    }
}

impl TracingRepresentation for SelectionCriteria {
    type Representation = String;

    fn tracing_representation(&self) -> String {
        self.to_string()
    }
}

impl TracingRepresentation for ServerAddress {
    type Representation = String;

    fn tracing_representation(&self) -> String {
        self.to_string()
    }
}

/// Truncates `s` to at most `new_length` bytes, backing off to the nearest char boundary and
/// appending "..." when anything was cut.
pub(crate) fn truncate_on_char_boundary(s: &mut String, new_length: usize) {
    if s.len() <= new_length {
        return;
    }
    let mut index = new_length;
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    s.truncate(index);
    s.push_str("...");
}
