use std::cmp::Ordering;

use derive_where::derive_where;
use serde::{Deserialize, Serialize};

use bson::{Document, Timestamp};

/// The `$clusterTime` gossiped between the driver and the deployment.
///
/// Two cluster times are equal when their timestamps are; the signature is carried along
/// untouched and never compared.
#[derive(Debug, Deserialize, Clone, Serialize)]
#[derive_where(PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTime {
    pub(crate) cluster_time: Timestamp,

    #[derive_where(skip)]
    pub(crate) signature: Document,
}

impl ClusterTime {
    /// The cluster time itself, without its signature.
    pub fn timestamp(&self) -> Timestamp {
        self.cluster_time
    }

    fn sort_key(&self) -> (u32, u32) {
        (self.cluster_time.time, self.cluster_time.increment)
    }
}

impl Ord for ClusterTime {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for ClusterTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
