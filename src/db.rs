pub mod options;

use std::{fmt, str::FromStr, sync::Arc};

use serde::{de::Error as _, Deserialize, Deserializer, Serialize};

use crate::{
    bson::Document,
    change_stream::{event::ChangeStreamEvent, options::ChangeStreamOptions, ChangeStream},
    concern::{ReadConcern, WriteConcern},
    error::{Error, Result},
    operation::{AggregateTarget, RunCommand},
    options::{
        DataCodingStrategy,
        DatabaseOptions,
        DateCodingStrategy,
        ReadPreference,
        UuidCodingStrategy,
    },
    selection_criteria::SelectionCriteria,
    Client,
    ClientSession,
};

/// `Database` is the client-side abstraction of a MongoDB database. It can be used to run
/// commands against the database or to watch it for changes. A `Database` can only be obtained
/// through a `Client` by calling either `Client::database` or `Client::database_with_options`.
///
/// `Database` uses [`std::sync::Arc`](https://doc.rust-lang.org/std/sync/struct.Arc.html) internally,
/// so it can safely be shared across threads and tasks.
#[derive(Clone, Debug)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

#[derive(Debug)]
struct DatabaseInner {
    client: Client,
    name: String,
    selection_criteria: Option<SelectionCriteria>,
    read_concern: Option<ReadConcern>,
    write_concern: Option<WriteConcern>,
    data_coding_strategy: Option<DataCodingStrategy>,
    date_coding_strategy: Option<DateCodingStrategy>,
    uuid_coding_strategy: Option<UuidCodingStrategy>,
}

impl Database {
    pub(crate) fn new(client: Client, name: &str, options: Option<DatabaseOptions>) -> Self {
        let options = options.unwrap_or_default();
        let selection_criteria = options
            .read_preference
            .map(SelectionCriteria::ReadPreference)
            .or_else(|| client.selection_criteria().cloned());

        let read_concern = options
            .read_concern
            .or_else(|| client.read_concern().cloned());

        let write_concern = options
            .write_concern
            .or_else(|| client.write_concern().cloned());

        let client_options = client.options();
        let data_coding_strategy = options
            .data_coding_strategy
            .or(client_options.data_coding_strategy);
        let date_coding_strategy = options
            .date_coding_strategy
            .or(client_options.date_coding_strategy);
        let uuid_coding_strategy = options
            .uuid_coding_strategy
            .or(client_options.uuid_coding_strategy);

        Self {
            inner: Arc::new(DatabaseInner {
                name: name.to_string(),
                client,
                selection_criteria,
                read_concern,
                write_concern,
                data_coding_strategy,
                date_coding_strategy,
                uuid_coding_strategy,
            }),
        }
    }

    /// Get the `Client` that this database descended from.
    pub fn client(&self) -> &Client {
        &self.inner.client
    }

    /// Gets the name of the `Database`.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Gets the read preference of the `Database`.
    pub fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.inner.selection_criteria.as_ref()
    }

    /// Gets the read concern of the `Database`.
    pub fn read_concern(&self) -> Option<&ReadConcern> {
        self.inner.read_concern.as_ref()
    }

    /// Gets the write concern of the `Database`.
    pub fn write_concern(&self) -> Option<&WriteConcern> {
        self.inner.write_concern.as_ref()
    }

    /// Gets the strategy used to encode and decode `Data` values.
    pub fn data_coding_strategy(&self) -> Option<DataCodingStrategy> {
        self.inner.data_coding_strategy
    }

    /// Gets the strategy used to encode and decode `Date` values.
    pub fn date_coding_strategy(&self) -> Option<DateCodingStrategy> {
        self.inner.date_coding_strategy
    }

    /// Gets the strategy used to encode and decode `UUID` values.
    pub fn uuid_coding_strategy(&self) -> Option<UuidCodingStrategy> {
        self.inner.uuid_coding_strategy
    }

    /// Runs a database-level command and returns the server's reply.
    ///
    /// Commands always run against the primary, regardless of the database's read preference.
    /// The reply is returned as-is; a reply with `ok: 0` is returned as an
    /// [`ErrorKind::Command`](crate::error::ErrorKind::Command) error.
    pub async fn run_command(
        &self,
        command: Document,
        session: Option<&ClientSession>,
    ) -> Result<Document> {
        let op = RunCommand::new(
            self.name().to_string(),
            command,
            Some(SelectionCriteria::ReadPreference(ReadPreference::Primary)),
        );
        self.client().execute_operation(op, None, session).await
    }

    /// Starts a new [`ChangeStream`] that receives events for all changes in this database.
    ///
    /// Change streams require a replica set or sharded cluster.
    pub async fn watch(
        &self,
        pipeline: impl IntoIterator<Item = Document>,
        options: impl Into<Option<ChangeStreamOptions>>,
        session: Option<&ClientSession>,
    ) -> Result<ChangeStream<ChangeStreamEvent<Document>>> {
        ChangeStream::open(
            self.client().clone(),
            AggregateTarget::Database(self.name().to_string()),
            false,
            pipeline.into_iter().collect(),
            options.into(),
            self.read_concern().cloned(),
            self.selection_criteria().cloned(),
            session,
        )
        .await
    }
}

/// A struct modeling the canonical name for a collection in MongoDB.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Namespace {
    /// The name of the database associated with this namespace.
    pub db: String,

    /// The name of the collection this namespace corresponds to.
    pub coll: String,
}

impl Namespace {
    /// Construct a `Namespace` with the given database and collection.
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }

    /// Reads a namespace in its dotted string form, as servers report it in cursor replies.
    pub(crate) fn deserialize_ns<'de, D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse()
            .map_err(|_| D::Error::custom(format!("invalid namespace: {s:?}")))
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}.{}", self.db, self.coll)
    }
}

impl FromStr for Namespace {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self::new(db, coll)),
            _ => Err(Error::invalid_argument(format!(
                "missing one or more fields in namespace {s:?}"
            ))),
        }
    }
}
