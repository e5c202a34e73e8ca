//! Node actions: named logic one node asks another to run.
//!
//! Actions are registered before the node starts. A call to a peer travels
//! over our link to it and is answered on the same link. Calls still
//! waiting when the link drops fail with `PeerUnavailable`.

use std::collections::BTreeMap;

use concord_proto::error::{ConcordError, ConcordResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::mapping::isolate;

/// Logic run against encoded arguments, giving an encoded result.
pub type NodeAction = Box<dyn Fn(&[u8]) -> ConcordResult<Vec<u8>> + Send>;

pub type ActionReply = oneshot::Sender<ConcordResult<Vec<u8>>>;

/// Wrap typed logic taking and returning bincode values.
pub fn node_action<A, R, F>(f: F) -> NodeAction
where
    A: DeserializeOwned,
    R: Serialize,
    F: Fn(A) -> ConcordResult<R> + Send + 'static,
{
    Box::new(move |args| {
        let args = bincode::deserialize(args).map_err(|_| ConcordError::CodecError)?;
        let result = f(args)?;
        bincode::serialize(&result).map_err(|_| ConcordError::CodecError)
    })
}

struct PendingAction {
    peer: String,
    reply: ActionReply,
}

/// Registered actions plus our calls in flight to peers.
#[derive(Default)]
pub struct NodeActions {
    actions: BTreeMap<String, NodeAction>,
    pending: BTreeMap<u64, PendingAction>,
    next_request: u64,
}

impl NodeActions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, action: NodeAction) -> ConcordResult<()> {
        if self.actions.contains_key(name) {
            warn!("node action {} registered twice", name);
            return Err(ConcordError::DuplicateAction);
        }
        self.actions.insert(name.to_string(), action);
        Ok(())
    }

    /// Run `name` here. A panicking action fails with `ActionFailed`; any
    /// error the action returns is passed on as is.
    pub fn run(&self, name: &str, args: &[u8]) -> ConcordResult<Vec<u8>> {
        let Some(action) = self.actions.get(name) else {
            debug!("no node action named {}", name);
            return Err(ConcordError::UnknownAction);
        };
        isolate(|| action(args)).map_err(|e| {
            warn!("node action {} failed: {}", name, e);
            e
        })
    }

    /// Track a call about to be sent to `peer`; returns its request id.
    pub fn begin(&mut self, peer: &str, reply: ActionReply) -> u64 {
        self.next_request += 1;
        self.pending.insert(
            self.next_request,
            PendingAction {
                peer: peer.to_string(),
                reply,
            },
        );
        self.next_request
    }

    pub fn complete(&mut self, request_id: u64, result: ConcordResult<Vec<u8>>) {
        match self.pending.remove(&request_id) {
            Some(pending) => {
                let _ = pending.reply.send(result);
            }
            None => debug!("result for unknown node action call {}", request_id),
        }
    }

    /// Fail every call waiting on `peer`.
    pub fn peer_disconnected(&mut self, peer: &str) {
        let lost: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.peer == peer)
            .map(|(id, _)| *id)
            .collect();
        for request_id in lost {
            self.complete(request_id, Err(ConcordError::PeerUnavailable));
        }
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}
