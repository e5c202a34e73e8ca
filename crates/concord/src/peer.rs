//! Outbound links to remote nodes.
//!
//! A [`PeerConnection`] is the node runtime's bookkeeping for one remote
//! node: which host to dial, whether a link is up, and what the remote's
//! shared record looked like at the last event. The socket itself is
//! driven by a link task spawned with [`spawn_link`], which reports back
//! through the node's command queue. Each connection attempt gets a new
//! generation number so events from an abandoned link can be recognised
//! and dropped.
//!
//! States: `Disconnected -> Connecting -> Connected -> Subscribed`, and
//! back to `Disconnected` on failure, logoff or a host name change.

use std::collections::BTreeSet;
use std::fmt;

use concord_core::net;
use concord_core::{MessageReader, MessageWriter};
use concord_proto::constants::CONCORD_PROTO_VER;
use concord_proto::creds::PeerCreds;
use concord_proto::defaults::DEFAULT_PEER_WRITE_CHANNEL_SIZE;
use concord_proto::error::{ConcordError, ConcordResult};
use concord_proto::lock::Lock;
use concord_proto::message::{NodeSnapshot, PeerMessage, PeerRequest};
use concord_proto::node::{NodeRecord, Relationship};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Connecting,
    Connected,
    Subscribed,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerState::Disconnected => "disconnected",
            PeerState::Connecting => "connecting",
            PeerState::Connected => "connected",
            PeerState::Subscribed => "subscribed",
        };
        f.write_str(s)
    }
}

/// What the node should do after a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshAction {
    /// Link is up or an attempt is in flight.
    None,
    /// Not updated since the last attempt; the peer is presumed down.
    Suppressed,
    /// Start a connection attempt.
    Connect,
    /// The host changed under a live link: tear it down, then connect.
    Reconnect,
}

/// The remote node's shared record as last seen over the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteNode {
    pub node_name: String,
    pub boot_stamp: u64,
    pub locks: BTreeSet<Lock>,
}

/// Point-in-time view of a peer for observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub node_name: String,
    pub state: PeerState,
    pub relationship: Relationship,
    pub host_name: String,
    pub port: u16,
}

pub struct PeerConnection {
    record: NodeRecord,
    /// Host chosen for the current region, cached to detect changes.
    host_name: String,
    relationship: Relationship,
    state: PeerState,
    /// When the last attempt started (ms since the Unix epoch).
    last_connect: Option<u64>,
    generation: u64,
    outbound: Option<mpsc::Sender<PeerRequest>>,
    remote: Option<RemoteNode>,
    /// Highest event sequence applied on the current link.
    last_seq: u64,
    task: Option<JoinHandle<()>>,
}

impl PeerConnection {
    pub fn new(record: NodeRecord, local_region: Option<&str>) -> Self {
        Self {
            host_name: record.peer_host_name(local_region).to_string(),
            relationship: record.relationship_to(local_region),
            record,
            state: PeerState::Disconnected,
            last_connect: None,
            generation: 0,
            outbound: None,
            remote: None,
            last_seq: 0,
            task: None,
        }
    }

    pub fn node_name(&self) -> &str {
        &self.record.node_name
    }

    pub fn record(&self) -> &NodeRecord {
        &self.record
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn port(&self) -> u16 {
        self.record.port
    }

    pub fn remote(&self) -> Option<&RemoteNode> {
        self.remote.as_ref()
    }

    pub fn remote_mut(&mut self) -> Option<&mut RemoteNode> {
        self.remote.as_mut()
    }

    pub fn is_subscribed(&self) -> bool {
        self.state == PeerState::Subscribed
    }

    /// Whether an event tagged `generation` belongs to the current link.
    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.generation && self.state != PeerState::Disconnected
    }

    pub fn status(&self) -> PeerStatus {
        PeerStatus {
            node_name: self.record.node_name.clone(),
            state: self.state,
            relationship: self.relationship,
            host_name: self.host_name.clone(),
            port: self.record.port,
        }
    }

    /// Take a freshly loaded record and decide whether to (re)connect.
    pub fn refresh(
        &mut self,
        record: NodeRecord,
        local_region: Option<&str>,
        stale_ms: u64,
    ) -> RefreshAction {
        let host_name = record.peer_host_name(local_region).to_string();
        let moved = host_name != self.host_name || record.port != self.record.port;
        self.relationship = record.relationship_to(local_region);
        self.record = record;
        self.host_name = host_name;

        if self.state != PeerState::Disconnected {
            if moved {
                info!(
                    "peer {} moved to {}:{}, reconnecting",
                    self.record.node_name, self.host_name, self.record.port
                );
                return RefreshAction::Reconnect;
            }
            return RefreshAction::None;
        }

        if let Some(last) = self.last_connect {
            if last.saturating_sub(self.record.last_updated) > stale_ms {
                debug!(
                    "not connecting to {}: record not updated since last attempt",
                    self.record.node_name
                );
                return RefreshAction::Suppressed;
            }
        }
        RefreshAction::Connect
    }

    /// Record the start of an attempt and return its generation.
    pub fn begin_connect(&mut self, now: u64) -> u64 {
        self.generation += 1;
        self.state = PeerState::Connecting;
        self.last_connect = Some(now);
        self.last_seq = 0;
        self.generation
    }

    pub fn attach_task(&mut self, task: JoinHandle<()>) {
        if let Some(old) = self.task.replace(task) {
            old.abort();
        }
    }

    pub fn on_connected(&mut self, outbound: mpsc::Sender<PeerRequest>) {
        self.state = PeerState::Connected;
        self.outbound = Some(outbound);
    }

    /// Apply the subscription snapshot. Fails if it names another node.
    pub fn on_snapshot(&mut self, snapshot: NodeSnapshot) -> ConcordResult<&RemoteNode> {
        if snapshot.node_name != self.record.node_name {
            warn!(
                "peer {} answered as {}, dropping link",
                self.record.node_name, snapshot.node_name
            );
            return Err(ConcordError::UnexpectedMessage);
        }
        self.state = PeerState::Subscribed;
        self.last_seq = snapshot.seq;
        Ok(self.remote.insert(RemoteNode {
            node_name: snapshot.node_name,
            boot_stamp: snapshot.boot_stamp,
            locks: snapshot.locks,
        }))
    }

    /// Check an event's sequence number. Returns false for events that are
    /// stale or duplicated and must be discarded.
    pub fn accept_event(&mut self, seq: u64) -> bool {
        if self.state != PeerState::Subscribed || seq <= self.last_seq {
            return false;
        }
        if seq != self.last_seq + 1 {
            warn!(
                "peer {}: events {}..{} missing",
                self.record.node_name,
                self.last_seq + 1,
                seq
            );
        }
        self.last_seq = seq;
        true
    }

    /// Queue a request on the link.
    pub fn send(&self, req: PeerRequest) -> ConcordResult<()> {
        let outbound = self.outbound.as_ref().ok_or(ConcordError::PeerUnavailable)?;
        outbound.try_send(req).map_err(|_| {
            warn!("peer {}: write queue unavailable", self.record.node_name);
            ConcordError::PeerUnavailable
        })
    }

    /// Drop the link. Returns the remote record if the link was subscribed.
    pub fn disconnect(&mut self) -> Option<RemoteNode> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.outbound = None;
        self.state = PeerState::Disconnected;
        self.remote.take()
    }

    /// Say goodbye and drop the link. Queued requests still go out.
    pub fn logoff(&mut self) -> Option<RemoteNode> {
        if let Some(outbound) = &self.outbound {
            let _ = outbound.try_send(PeerRequest::Logoff);
        }
        self.generation += 1;
        self.disconnect()
    }
}

// ---------------------------------------------------------------------------
// Link task
// ---------------------------------------------------------------------------

/// What a link task reports.
#[derive(Debug)]
pub enum LinkEvent {
    /// Subscribed request sent; requests may now be queued.
    Connected(mpsc::Sender<PeerRequest>),
    Message(PeerMessage),
    /// The attempt or the link failed.
    Failed(ConcordError),
    /// The remote closed the link.
    Closed,
}

/// Where and as whom a link task connects.
#[derive(Debug, Clone)]
pub struct LinkTarget {
    pub peer_name: String,
    pub host_name: String,
    pub port: u16,
    /// Who we subscribe as.
    pub creds: PeerCreds,
    pub max_frame: usize,
}

/// Connect to a peer, subscribe, and forward everything it sends.
///
/// `wrap` turns each [`LinkEvent`] into the caller's command type. The
/// reader runs in the returned task; the writer runs in its own task and
/// drains queued requests after the returned task is aborted.
pub fn spawn_link<T, F>(target: LinkTarget, events: mpsc::Sender<T>, wrap: F) -> JoinHandle<()>
where
    T: Send + 'static,
    F: Fn(LinkEvent) -> T + Send + 'static,
{
    tokio::spawn(async move {
        let stream = match net::connect_to(&target.host_name, target.port).await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = events.send(wrap(LinkEvent::Failed(e))).await;
                return;
            }
        };

        let (read_half, write_half) = stream.into_split();
        let mut reader = MessageReader::with_max_frame(read_half, target.max_frame);
        let mut writer = MessageWriter::with_max_frame(write_half, target.max_frame);

        let subscribe = PeerRequest::Subscribe {
            creds: target.creds.clone(),
            proto_ver: CONCORD_PROTO_VER,
        };
        if let Err(e) = writer.send(&subscribe).await {
            let _ = events.send(wrap(LinkEvent::Failed(e))).await;
            return;
        }

        let (tx, mut rx) = mpsc::channel::<PeerRequest>(DEFAULT_PEER_WRITE_CHANNEL_SIZE);
        if events.send(wrap(LinkEvent::Connected(tx))).await.is_err() {
            return;
        }

        let peer_name = target.peer_name.clone();
        tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                if let Err(e) = writer.send(&req).await {
                    debug!("link to {}: write failed: {}", peer_name, e);
                    break;
                }
            }
            writer.shutdown().await;
        });

        loop {
            match reader.recv::<PeerMessage>().await {
                Ok(msg) => {
                    if events.send(wrap(LinkEvent::Message(msg))).await.is_err() {
                        return;
                    }
                }
                Err(ConcordError::NetworkError) => {
                    debug!("link to {} closed", target.peer_name);
                    let _ = events.send(wrap(LinkEvent::Closed)).await;
                    return;
                }
                Err(e) => {
                    warn!("link to {} failed: {}", target.peer_name, e);
                    let _ = events.send(wrap(LinkEvent::Failed(e))).await;
                    return;
                }
            }
        }
    })
}
