use std::{fmt, sync::Arc};

use bson::{doc, Document};
use derive_where::derive_where;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{
    error::{Error, Result},
    options::ServerAddress,
    sdam::ServerDescription,
};

/// Decides which servers an operation may be routed to.
#[derive(Clone, derive_more::Display)]
#[derive_where(Debug)]
#[non_exhaustive]
pub enum SelectionCriteria {
    /// Filter by server type, following the read preference's rules.
    #[display("ReadPreference {_0}")]
    ReadPreference(ReadPreference),

    /// Accept exactly the servers for which the closure returns `true`. Two predicates never
    /// compare equal.
    #[display("Custom predicate")]
    Predicate(#[derive_where(skip)] Predicate),
}

impl PartialEq for SelectionCriteria {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::ReadPreference(r1), Self::ReadPreference(r2)) => r1 == r2,
            _ => false,
        }
    }
}

impl From<ReadPreference> for SelectionCriteria {
    fn from(read_pref: ReadPreference) -> Self {
        Self::ReadPreference(read_pref)
    }
}

impl SelectionCriteria {
    pub(crate) fn as_read_pref(&self) -> Option<&ReadPreference> {
        match self {
            Self::ReadPreference(ref read_pref) => Some(read_pref),
            Self::Predicate(..) => None,
        }
    }

    /// Criteria matching only the server at `address`.
    pub(crate) fn from_address(address: ServerAddress) -> Self {
        SelectionCriteria::Predicate(Arc::new(move |server| server.address() == &address))
    }
}

pub type Predicate = Arc<dyn Send + Sync + Fn(&ServerDescription) -> bool>;

/// Which replica set members a read may go to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReadPreference {
    /// The primary only.
    #[default]
    Primary,

    /// Secondaries only.
    Secondary,

    /// The primary, or a secondary while there is no primary.
    PrimaryPreferred,

    /// A secondary, or the primary while there are no secondaries.
    SecondaryPreferred,

    /// Any data-bearing member inside the latency window.
    Nearest,
}

impl ReadPreference {
    pub(crate) fn mode(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
            Self::PrimaryPreferred => "primaryPreferred",
            Self::SecondaryPreferred => "secondaryPreferred",
            Self::Nearest => "nearest",
        }
    }

    pub(crate) fn from_mode(mode: &str) -> Result<Self> {
        match mode.to_ascii_lowercase().as_str() {
            "primary" => Ok(Self::Primary),
            "secondary" => Ok(Self::Secondary),
            "primarypreferred" => Ok(Self::PrimaryPreferred),
            "secondarypreferred" => Ok(Self::SecondaryPreferred),
            "nearest" => Ok(Self::Nearest),
            _ => Err(Error::invalid_argument(format!(
                "unknown read preference mode {mode:?}"
            ))),
        }
    }

    /// The `$readPreference` document sent to a mongos.
    pub(crate) fn to_document(self) -> Document {
        doc! { "mode": self.mode() }
    }
}

impl fmt::Display for ReadPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ Mode: {} }}", self.mode())
    }
}

impl Serialize for ReadPreference {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_document().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ReadPreference {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Mode {
            mode: String,
        }
        let Mode { mode } = Mode::deserialize(deserializer)?;
        Self::from_mode(&mode).map_err(serde::de::Error::custom)
    }
}
