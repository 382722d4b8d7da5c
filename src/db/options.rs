use typed_builder::TypedBuilder;

use crate::{
    concern::{ReadConcern, WriteConcern},
    options::{DataCodingStrategy, DateCodingStrategy, UuidCodingStrategy},
    selection_criteria::ReadPreference,
};

/// Per-database overrides passed to
/// [`Client::database_with_options`](crate::Client::database_with_options). Anything left unset
/// falls back to the client's value.
#[allow(missing_docs)]
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct DatabaseOptions {
    pub read_concern: Option<ReadConcern>,
    pub write_concern: Option<WriteConcern>,
    pub read_preference: Option<ReadPreference>,

    // Coding strategies are recorded and handed to callers; the crate itself never re-encodes
    // documents with them.
    pub data_coding_strategy: Option<DataCodingStrategy>,
    pub date_coding_strategy: Option<DateCodingStrategy>,
    pub uuid_coding_strategy: Option<UuidCodingStrategy>,
}
