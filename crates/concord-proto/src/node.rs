/// Node identity and membership records.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::constants::REGION_SEPARATOR;

/// Milliseconds since the Unix epoch, the unit of every record timestamp.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// How a remote node sits relative to the local one in the region tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Relationship {
    /// Same region.
    Peer,
    /// The remote region contains ours.
    Parent,
    /// Our region contains the remote one.
    Child,
    /// Unrelated regions.
    Indirect,
}

impl Relationship {
    /// Compute the relationship of `remote` as seen from `local`.
    ///
    /// Regions are slash-separated paths. A node without a region is
    /// treated as living at the root, so it is the parent of every
    /// regioned node and a peer of every other unregioned node.
    pub fn between(local: Option<&str>, remote: Option<&str>) -> Self {
        match (local, remote) {
            (None, None) => Relationship::Peer,
            (Some(_), None) => Relationship::Parent,
            (None, Some(_)) => Relationship::Child,
            (Some(l), Some(r)) if l == r => Relationship::Peer,
            (Some(l), Some(r)) if is_ancestor(r, l) => Relationship::Parent,
            (Some(l), Some(r)) if is_ancestor(l, r) => Relationship::Child,
            _ => Relationship::Indirect,
        }
    }
}

impl fmt::Display for Relationship {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Relationship::Peer => "peer",
            Relationship::Parent => "parent",
            Relationship::Child => "child",
            Relationship::Indirect => "indirect",
        };
        f.write_str(s)
    }
}

fn is_ancestor(ancestor: &str, region: &str) -> bool {
    region.len() > ancestor.len()
        && region.starts_with(ancestor)
        && region[ancestor.len()..].starts_with(REGION_SEPARATOR)
}

/// Membership record for one cluster node, as stored in the node
/// repository and refreshed by its owner on every heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Unique node name. Sorts totally and breaks lock ties.
    pub node_name: String,
    /// Host name reachable from inside the node's region.
    pub host_name: String,
    /// Host name reachable from other regions.
    pub public_host_name: String,
    /// Slash-separated region path, if any.
    pub region: Option<String>,
    /// Peer session port.
    pub port: u16,
    /// Last heartbeat (ms since the Unix epoch).
    pub last_updated: u64,
    /// Set when the node shut down cleanly.
    pub shutdown: bool,
}

impl NodeRecord {
    pub fn new(node_name: impl Into<String>, host_name: impl Into<String>, port: u16) -> Self {
        let host_name = host_name.into();
        Self {
            node_name: node_name.into(),
            public_host_name: host_name.clone(),
            host_name,
            region: None,
            port,
            last_updated: now_millis(),
            shutdown: false,
        }
    }

    /// The host name to use when connecting from a node in `local_region`.
    pub fn peer_host_name(&self, local_region: Option<&str>) -> &str {
        if self.region.as_deref() == local_region {
            &self.host_name
        } else {
            &self.public_host_name
        }
    }

    /// Relationship of this record's node as seen from `local_region`.
    pub fn relationship_to(&self, local_region: Option<&str>) -> Relationship {
        Relationship::between(local_region, self.region.as_deref())
    }

    /// Whether the record has gone without a heartbeat for longer than
    /// `window_ms` as of `now`.
    pub fn is_stale(&self, now: u64, window_ms: u64) -> bool {
        now.saturating_sub(self.last_updated) > window_ms
    }
}

impl fmt::Display for NodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.node_name, self.host_name, self.port)
    }
}
