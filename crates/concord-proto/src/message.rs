//! Messages exchanged over a peer session.
//!
//! A session is opened by the subscribing node. Everything the subscriber
//! sends is a [`PeerRequest`]; everything the publishing node sends back is
//! a [`PeerMessage`]. Each message travels as one frame.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::creds::PeerCreds;
use crate::error::{ConcordError, ConcordResult};
use crate::lock::Lock;

/// An attribute change on a node's shared record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeEvent {
    /// The publishing node is trying to acquire the lock.
    AcquiringLock(Lock),
    /// The publishing node is trying to release the lock.
    ReleasingLock(Lock),
    /// The publishing node now holds the lock.
    LockAdded(Lock),
    /// The publishing node kept a lock it had started to release.
    LockUpdated(Lock),
    /// The publishing node no longer holds the lock.
    LockRemoved(Lock),
    /// Opaque cache payload: mapping syncs and stale-cache notices.
    CacheData { cache: String, data: Vec<u8> },
}

/// State of a node's shared record at the moment a session subscribes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub node_name: String,
    /// Start time of the publishing node (ms since the Unix epoch).
    pub boot_stamp: u64,
    /// Locks held by the publishing node.
    pub locks: BTreeSet<Lock>,
    /// Sequence number of the last event published before the snapshot.
    pub seq: u64,
}

/// Calls against a mapping, addressed by its cluster-wide index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MappingCall {
    Get {
        map_idx: u16,
        key: Vec<u8>,
    },
    Put {
        map_idx: u16,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Remove {
        map_idx: u16,
        key: Vec<u8>,
    },
    /// Bulk upsert. A `None` value deletes its key.
    Sync {
        map_idx: u16,
        keys: Vec<Vec<u8>>,
        values: Vec<Option<Vec<u8>>>,
    },
    /// Run a named action against the whole mapping.
    With {
        map_idx: u16,
        action: String,
        args: Vec<u8>,
    },
    /// Run a named action against one value.
    WithValue {
        map_idx: u16,
        key: Vec<u8>,
        action: String,
        args: Vec<u8>,
    },
    /// Entries passed on by a former master. The receiver takes them
    /// whatever its own view of the ministry, keeping any key it already has.
    Handoff {
        map_idx: u16,
        keys: Vec<Vec<u8>>,
        values: Vec<Vec<u8>>,
    },
}

impl MappingCall {
    pub fn map_idx(&self) -> u16 {
        match self {
            MappingCall::Get { map_idx, .. }
            | MappingCall::Put { map_idx, .. }
            | MappingCall::Remove { map_idx, .. }
            | MappingCall::Sync { map_idx, .. }
            | MappingCall::With { map_idx, .. }
            | MappingCall::WithValue { map_idx, .. }
            | MappingCall::Handoff { map_idx, .. } => *map_idx,
        }
    }
}

/// Subscriber to publisher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRequest {
    /// First message of every session.
    Subscribe { creds: PeerCreds, proto_ver: u16 },
    /// Agree that the publisher may proceed with acquiring or releasing.
    RatifyLock { lock: Lock, acquire: bool },
    /// A proxied mapping call; answered with [`PeerMessage::MappingResult`].
    Mapping { request_id: u64, call: MappingCall },
    /// Run a named node action; answered with [`PeerMessage::ActionResult`].
    NodeAction {
        request_id: u64,
        action: String,
        args: Vec<u8>,
    },
    /// Clean end of the session.
    Logoff,
}

/// Publisher to subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMessage {
    Snapshot(NodeSnapshot),
    Event { seq: u64, event: NodeEvent },
    /// `code` is 0 on success, otherwise a [`ConcordError`] code.
    MappingResult {
        request_id: u64,
        code: u32,
        value: Option<Vec<u8>>,
    },
    /// `code` is 0 on success, otherwise a [`ConcordError`] code.
    ActionResult {
        request_id: u64,
        code: u32,
        value: Option<Vec<u8>>,
    },
    /// The subscription was rejected.
    Refused { code: u32 },
}

impl PeerMessage {
    pub fn mapping_result(request_id: u64, result: ConcordResult<Option<Vec<u8>>>) -> Self {
        match result {
            Ok(value) => PeerMessage::MappingResult {
                request_id,
                code: 0,
                value,
            },
            Err(e) => PeerMessage::MappingResult {
                request_id,
                code: e.to_code(),
                value: None,
            },
        }
    }

    pub fn action_result(request_id: u64, result: ConcordResult<Vec<u8>>) -> Self {
        match result {
            Ok(value) => PeerMessage::ActionResult {
                request_id,
                code: 0,
                value: Some(value),
            },
            Err(e) => PeerMessage::ActionResult {
                request_id,
                code: e.to_code(),
                value: None,
            },
        }
    }
}

/// Turn a wire result back into a `ConcordResult`.
pub fn decode_result(code: u32, value: Option<Vec<u8>>) -> ConcordResult<Option<Vec<u8>>> {
    match ConcordError::from_code(code) {
        None => Ok(value),
        Some(e) => Err(e),
    }
}
