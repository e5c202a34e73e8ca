//! Consistent hashing of mapping ids onto minister nodes.
//!
//! Every node builds the ring from the same sorted minister list, so every
//! node agrees on the master of a mapping without talking to anyone.

use concord_proto::constants::MASTER_RING_VNODES;
use concord_proto::hash::{hash_next, hash_str};
use std::collections::{BTreeMap, BTreeSet};

/// Snapshot of the mastership ring.
#[derive(Debug, Clone, Default)]
pub struct MasterRing {
    /// Virtual nodes keyed by ring position.
    vnodes: BTreeMap<u64, String>,
    nodes: BTreeSet<String>,
}

impl MasterRing {
    /// Build a ring over `nodes` with the default vnode count.
    pub fn new<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_vnodes(nodes, MASTER_RING_VNODES)
    }

    pub fn with_vnodes<I, S>(nodes: I, nr_vnodes: u16) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let nodes: BTreeSet<String> = nodes.into_iter().map(Into::into).collect();
        let mut vnodes = BTreeMap::new();
        for node in &nodes {
            let mut hash = hash_str(node);
            for _ in 0..nr_vnodes {
                vnodes.entry(hash).or_insert_with(|| node.clone());
                hash = hash_next(hash);
            }
        }
        Self { vnodes, nodes }
    }

    /// The node responsible for `key`, if the ring has any nodes.
    pub fn master_for(&self, key: &str) -> Option<&str> {
        let hash = hash_str(key);
        self.vnodes
            .range(hash..)
            .chain(self.vnodes.iter())
            .map(|(_, node)| node.as_str())
            .next()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(String::as_str)
    }
}
