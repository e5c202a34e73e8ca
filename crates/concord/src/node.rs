//! The node runtime.
//!
//! A [`Node`] is configured (mappings, named actions, lock priority) and
//! then started. Starting binds the session listener and spawns one event
//! task that owns every piece of mutable state: peer links, inbound
//! sessions, the lock arbitrator and the mapping service. Link tasks,
//! session tasks, timers and the [`NodeHandle`] all talk to it through a
//! single command queue, so nothing here is locked.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use concord_core::net;
use concord_proto::constants::MAPPING_CACHE_PREFIX;
use concord_proto::defaults::{DEFAULT_DROPPED_LOCK_CHANNEL_SIZE, DEFAULT_NODE_COMMAND_CHANNEL_SIZE};
use concord_proto::error::{ConcordError, ConcordResult};
use concord_proto::lock::Lock;
use concord_proto::message::{
    decode_result, MappingCall, NodeEvent, NodeSnapshot, PeerMessage, PeerRequest,
};
use concord_proto::node::{now_millis, NodeRecord};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::actions::{node_action, ActionReply, NodeActions};
use crate::config::NodeConfig;
use crate::handle::NodeHandle;
use crate::locks::{LockAction, LockArbitrator, LockState, LockStats, LockWaiter, PriorityRule};
use crate::mapping::{
    MappingEffect, MappingId, MappingReply, MappingService, RawListener, ReplicationPolicy,
    Update,
};
use crate::peer::{spawn_link, LinkEvent, LinkTarget, PeerConnection, PeerStatus, RefreshAction};
use crate::repository::NodeRepository;
use crate::scheduler::Scheduler;
use crate::session::{spawn_acceptor, SessionEvent, SessionPolicy};

/// Cache data published under an application cache name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleCache {
    pub from: String,
    pub cache: String,
    pub data: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

pub(crate) enum NodeCommand {
    Link {
        peer: String,
        generation: u64,
        event: LinkEvent,
    },
    Session {
        id: u64,
        event: SessionEvent,
    },
    RefreshPeers,
    NodesLoaded(ConcordResult<Vec<NodeRecord>>),
    FlushMappings,
    LockTimeout {
        lock: Lock,
        generation: u64,
    },
    Api(ApiRequest),
    Shutdown(oneshot::Sender<()>),
}

/// Requests from a [`NodeHandle`].
pub(crate) enum ApiRequest {
    AcquireLock(Lock, LockWaiter),
    ReleaseLock(Lock, LockWaiter),
    QueryLock(Lock, LockWaiter),
    ReacquireLock(Lock, oneshot::Sender<bool>),
    LockState(Lock, oneshot::Sender<LockState>),
    LockStats(oneshot::Sender<LockStats>),
    Mapping(MappingCall, MappingReply),
    Entries(u16, oneshot::Sender<ConcordResult<Vec<(Vec<u8>, Vec<u8>)>>>),
    AddListener(u16, Box<dyn RawListener>, oneshot::Sender<ConcordResult<()>>),
    MasterOf(u16, oneshot::Sender<Option<String>>),
    BroadcastStaleCache {
        cache: String,
        data: Vec<u8>,
        reply: oneshot::Sender<ConcordResult<()>>,
    },
    AddStaleCacheObserver(String, mpsc::Sender<StaleCache>),
    Peers(oneshot::Sender<Vec<PeerStatus>>),
    InvokeAction {
        node: String,
        action: String,
        args: Vec<u8>,
        reply: ActionReply,
    },
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// A node being configured. Mappings and their actions can only be set up
/// here, before [`Node::start`].
pub struct Node {
    config: NodeConfig,
    mappings: MappingService,
    actions: NodeActions,
    priority: Option<Box<dyn PriorityRule>>,
}

impl Node {
    pub fn new(config: NodeConfig) -> Self {
        let mappings = MappingService::new(config.node_name.clone(), config.minister_count);
        Self {
            config,
            mappings,
            actions: NodeActions::new(),
            priority: None,
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Configure a mapping with bincode keys and values.
    pub fn configure_mapping<K, V>(
        &mut self,
        name: &str,
        policy: ReplicationPolicy,
    ) -> ConcordResult<MappingId<K, V>>
    where
        K: Serialize + DeserializeOwned + 'static,
        V: Serialize + DeserializeOwned + 'static,
    {
        self.configure_mapping_with(MappingId::new(name), policy)
    }

    /// Configure a mapping whose id carries its own codecs.
    pub fn configure_mapping_with<K: 'static, V: 'static>(
        &mut self,
        id: MappingId<K, V>,
        policy: ReplicationPolicy,
    ) -> ConcordResult<MappingId<K, V>> {
        self.mappings.configure(id.name(), policy)?;
        Ok(id)
    }

    /// Register logic that `with_value` calls can run by name.
    pub fn register_value_action<K, V, A, R, F>(
        &mut self,
        id: &MappingId<K, V>,
        name: &str,
        f: F,
    ) -> ConcordResult<()>
    where
        K: 'static,
        V: 'static,
        A: DeserializeOwned,
        R: Serialize,
        F: Fn(&K, Option<V>, A) -> ConcordResult<(Update<V>, R)> + Send + 'static,
    {
        self.mappings
            .register_value_action(id.name(), name, id.value_action(f))
    }

    /// Register logic that `with` calls can run by name.
    pub fn register_map_action<K, V, A, R, F>(
        &mut self,
        id: &MappingId<K, V>,
        name: &str,
        f: F,
    ) -> ConcordResult<()>
    where
        K: Ord + 'static,
        V: 'static,
        A: DeserializeOwned,
        R: Serialize,
        F: Fn(&mut BTreeMap<K, V>, A) -> ConcordResult<R> + Send + 'static,
    {
        self.mappings
            .register_map_action(id.name(), name, id.map_action(f))
    }

    /// Register logic any node can run here by name.
    pub fn register_node_action<A, R, F>(&mut self, name: &str, f: F) -> ConcordResult<()>
    where
        A: DeserializeOwned,
        R: Serialize,
        F: Fn(A) -> ConcordResult<R> + Send + 'static,
    {
        self.actions.register(name, node_action(f))
    }

    pub fn set_lock_priority(&mut self, rule: Box<dyn PriorityRule>) {
        self.priority = Some(rule);
    }

    /// Bind the listener, spawn the event task and begin the first refresh.
    pub async fn start(mut self, repository: Arc<dyn NodeRepository>) -> ConcordResult<NodeHandle> {
        let listener = net::create_listen_socket(&self.config.bind_addr, self.config.port).await?;
        let port = net::listen_addr(&listener)?.port();
        let record = self.config.record(port);
        info!(
            "node {} starting on port {} (repository={})",
            record.node_name,
            port,
            repository.name()
        );

        self.mappings.seal();
        let indices = Arc::new(self.mappings.indices());

        let (tx, rx) = mpsc::channel(DEFAULT_NODE_COMMAND_CHANNEL_SIZE);
        let stop = Arc::new(Notify::new());
        let acceptor = spawn_acceptor(
            listener,
            Arc::clone(&stop),
            tx.clone(),
            |id, event| NodeCommand::Session { id, event },
            SessionPolicy {
                max_frame: self.config.max_frame_size,
                shared_secret: self.config.shared_secret.clone(),
            },
        );

        let mut scheduler = Scheduler::new(tx.clone());
        scheduler.schedule_repeating(self.config.refresh_interval, || NodeCommand::RefreshPeers);
        scheduler.schedule_repeating(self.config.flush_interval, || NodeCommand::FlushMappings);

        let mut locks = LockArbitrator::new(record.node_name.clone());
        if let Some(rule) = self.priority.take() {
            locks.set_priority(rule);
        }
        let (dropped, _) = broadcast::channel(DEFAULT_DROPPED_LOCK_CHANNEL_SIZE);

        let runtime = NodeRuntime {
            boot_stamp: now_millis(),
            record: record.clone(),
            config: self.config,
            repository,
            tx: tx.clone(),
            scheduler,
            stop,
            acceptor,
            peers: BTreeMap::new(),
            sessions: BTreeMap::new(),
            seq: 0,
            locks,
            mappings: self.mappings,
            actions: self.actions,
            dropped: dropped.clone(),
            cache_observers: BTreeMap::new(),
            refreshing: false,
            refresh_pending: false,
        };
        tokio::spawn(runtime.run(rx));

        Ok(NodeHandle::new(record.node_name, port, tx, indices, dropped))
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// An inbound session: a node subscribed to our record.
struct Session {
    node_name: String,
    tx: mpsc::Sender<PeerMessage>,
}

struct NodeRuntime {
    config: NodeConfig,
    record: NodeRecord,
    boot_stamp: u64,
    repository: Arc<dyn NodeRepository>,
    tx: mpsc::Sender<NodeCommand>,
    scheduler: Scheduler<NodeCommand>,
    /// Stops the acceptor and session readers.
    stop: Arc<Notify>,
    acceptor: JoinHandle<()>,
    peers: BTreeMap<String, PeerConnection>,
    sessions: BTreeMap<u64, Session>,
    /// Sequence number of the last event published.
    seq: u64,
    locks: LockArbitrator,
    mappings: MappingService,
    actions: NodeActions,
    dropped: broadcast::Sender<Lock>,
    cache_observers: BTreeMap<String, Vec<mpsc::Sender<StaleCache>>>,
    /// A repository round trip is in flight.
    refreshing: bool,
    /// Another refresh was asked for meanwhile.
    refresh_pending: bool,
}

impl NodeRuntime {
    async fn run(mut self, mut rx: mpsc::Receiver<NodeCommand>) {
        info!("node {} event loop started", self.record.node_name);
        self.refresh_peers();

        while let Some(cmd) = rx.recv().await {
            match cmd {
                NodeCommand::Shutdown(done) => {
                    self.shutdown().await;
                    let _ = done.send(());
                    break;
                }
                NodeCommand::Link {
                    peer,
                    generation,
                    event,
                } => self.link_event(&peer, generation, event),
                NodeCommand::Session { id, event } => self.session_event(id, event),
                NodeCommand::RefreshPeers => self.refresh_peers(),
                NodeCommand::NodesLoaded(result) => self.nodes_loaded(result),
                NodeCommand::FlushMappings => {
                    self.mappings.flush(Instant::now(), false);
                    self.mappings.resume_hand_offs();
                }
                NodeCommand::LockTimeout { lock, generation } => {
                    self.locks.timeout(&lock, generation)
                }
                NodeCommand::Api(req) => self.api_request(req),
            }
            self.drain_effects();
        }
        info!("node {} stopped", self.record.node_name);
    }

    // -----------------------------------------------------------------------
    // Peer management
    // -----------------------------------------------------------------------

    /// Heartbeat our record and reload everyone else's off the event task.
    fn refresh_peers(&mut self) {
        if self.refreshing {
            self.refresh_pending = true;
            return;
        }
        self.refreshing = true;
        let repository = Arc::clone(&self.repository);
        let record = self.record.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            if let Err(e) = repository.heartbeat(&record).await {
                warn!("heartbeat for {} failed: {}", record.node_name, e);
            }
            let result = repository.load_nodes().await;
            let _ = tx.send(NodeCommand::NodesLoaded(result)).await;
        });
    }

    fn nodes_loaded(&mut self, result: ConcordResult<Vec<NodeRecord>>) {
        self.refreshing = false;
        let records = match result {
            Ok(records) => records,
            Err(e) => {
                error!("failed to load node records: {}", e);
                return;
            }
        };

        let now = now_millis();
        let stale_ms = self.config.stale_interval_ms();
        let region = self.config.region.clone();
        let mut seen = BTreeSet::new();
        for record in records {
            if record.node_name == self.record.node_name {
                continue;
            }
            if record.shutdown || record.is_stale(now, stale_ms) {
                debug!("ignoring node {}: shut down or stale", record.node_name);
                continue;
            }
            let name = record.node_name.clone();
            seen.insert(name.clone());
            let peer = self
                .peers
                .entry(name.clone())
                .or_insert_with(|| PeerConnection::new(record.clone(), region.as_deref()));
            match peer.refresh(record, region.as_deref(), stale_ms) {
                RefreshAction::None | RefreshAction::Suppressed => {}
                RefreshAction::Connect => self.connect(&name),
                RefreshAction::Reconnect => {
                    self.link_down(&name);
                    self.connect(&name);
                }
            }
        }

        let gone: Vec<String> = self
            .peers
            .keys()
            .filter(|name| !seen.contains(*name))
            .cloned()
            .collect();
        for name in gone {
            info!("peer {} left the cluster", name);
            if let Some(mut peer) = self.peers.remove(&name) {
                peer.logoff();
            }
            self.peer_lost(&name);
        }

        if self.refresh_pending {
            self.refresh_pending = false;
            self.refresh_peers();
        }
    }

    fn connect(&mut self, name: &str) {
        let Some(peer) = self.peers.get_mut(name) else {
            return;
        };
        let generation = peer.begin_connect(now_millis());
        let target = LinkTarget {
            peer_name: name.to_string(),
            host_name: peer.host_name().to_string(),
            port: peer.port(),
            creds: self.config.creds(),
            max_frame: self.config.max_frame_size,
        };
        info!("connecting to {} at {}:{}", name, target.host_name, target.port);
        let peer_name = name.to_string();
        let task = spawn_link(target, self.tx.clone(), move |event| NodeCommand::Link {
            peer: peer_name.clone(),
            generation,
            event,
        });
        peer.attach_task(task);
    }

    fn link_event(&mut self, name: &str, generation: u64, event: LinkEvent) {
        let Some(peer) = self.peers.get_mut(name) else {
            return;
        };
        if !peer.is_current(generation) {
            debug!("discarding event from abandoned link to {}", name);
            return;
        }
        match event {
            LinkEvent::Connected(outbound) => {
                debug!("link to {} up", name);
                peer.on_connected(outbound);
            }
            LinkEvent::Message(msg) => self.peer_message(name, msg),
            LinkEvent::Failed(e) => {
                warn!("link to {} failed: {}", name, e);
                self.link_down(name);
            }
            LinkEvent::Closed => {
                info!("link to {} closed", name);
                self.link_down(name);
            }
        }
    }

    fn peer_message(&mut self, name: &str, msg: PeerMessage) {
        let Some(peer) = self.peers.get_mut(name) else {
            return;
        };
        match msg {
            PeerMessage::Snapshot(snapshot) => match peer.on_snapshot(snapshot) {
                Ok(remote) => {
                    let locks = remote.locks.clone();
                    info!("subscribed to {} ({} locks held)", name, locks.len());
                    self.locks.peer_subscribed(name, locks);
                    self.update_ministry();
                }
                Err(_) => self.link_down(name),
            },
            PeerMessage::Event { seq, event } => {
                if !peer.accept_event(seq) {
                    debug!("discarding event {} from {}", seq, name);
                    return;
                }
                if let Some(remote) = peer.remote_mut() {
                    match &event {
                        NodeEvent::LockAdded(lock) => {
                            remote.locks.insert(lock.clone());
                        }
                        NodeEvent::LockRemoved(lock) => {
                            remote.locks.remove(lock);
                        }
                        _ => {}
                    }
                }
                self.peer_event(name, event);
            }
            PeerMessage::MappingResult {
                request_id,
                code,
                value,
            } => self
                .mappings
                .call_completed(request_id, decode_result(code, value)),
            PeerMessage::ActionResult {
                request_id,
                code,
                value,
            } => {
                let result =
                    decode_result(code, value).and_then(|v| v.ok_or(ConcordError::CodecError));
                self.actions.complete(request_id, result);
            }
            PeerMessage::Refused { code } => {
                let reason = ConcordError::from_code(code).unwrap_or(ConcordError::Unknown);
                warn!("{} refused our subscription: {}", name, reason);
                self.link_down(name);
            }
        }
    }

    fn peer_event(&mut self, name: &str, event: NodeEvent) {
        match event {
            NodeEvent::AcquiringLock(lock) => self.locks.peer_acquiring(name, lock),
            NodeEvent::ReleasingLock(lock) => self.locks.peer_releasing(name, lock),
            NodeEvent::LockAdded(lock) => self.locks.peer_added_lock(name, lock),
            NodeEvent::LockUpdated(lock) => self.locks.peer_updated_lock(name, lock),
            NodeEvent::LockRemoved(lock) => self.locks.peer_removed_lock(name, lock),
            NodeEvent::CacheData { cache, data } => {
                if !self.mappings.cache_data(name, &cache, &data) {
                    self.notify_stale_cache(name, cache, data);
                }
            }
        }
    }

    /// Tear down the link to `name`; the next refresh may reconnect.
    fn link_down(&mut self, name: &str) {
        if let Some(peer) = self.peers.get_mut(name) {
            peer.disconnect();
        }
        self.peer_lost(name);
    }

    fn peer_lost(&mut self, name: &str) {
        self.locks.peer_disconnected(name);
        self.mappings.peer_disconnected(name);
        self.actions.peer_disconnected(name);
        self.update_ministry();
    }

    /// Ministers are drawn from ourselves plus every subscribed peer.
    fn update_ministry(&mut self) {
        let mut live: BTreeSet<String> = self
            .peers
            .values()
            .filter(|p| p.is_subscribed())
            .map(|p| p.node_name().to_string())
            .collect();
        live.insert(self.record.node_name.clone());
        self.mappings.update_ministry(&live);
    }

    // -----------------------------------------------------------------------
    // Sessions and the shared record
    // -----------------------------------------------------------------------

    fn session_event(&mut self, id: u64, event: SessionEvent) {
        match event {
            SessionEvent::Opened { node_name, tx } => {
                let snapshot = PeerMessage::Snapshot(NodeSnapshot {
                    node_name: self.record.node_name.clone(),
                    boot_stamp: self.boot_stamp,
                    locks: self.locks.held().clone(),
                    seq: self.seq,
                });
                if tx.try_send(snapshot).is_err() {
                    warn!("session {}: could not send snapshot to {}", id, node_name);
                    return;
                }
                if !self.has_session(&node_name) {
                    self.locks.subscriber_added(&node_name);
                }
                self.sessions.insert(id, Session { node_name, tx });
            }
            SessionEvent::Request(req) => self.session_request(id, req),
            SessionEvent::Closed => self.close_session(id),
        }
    }

    fn session_request(&mut self, id: u64, req: PeerRequest) {
        let Some(from) = self.sessions.get(&id).map(|s| s.node_name.clone()) else {
            return;
        };
        match req {
            PeerRequest::RatifyLock { lock, acquire } => self.locks.ratify(&from, &lock, acquire),
            PeerRequest::Mapping { request_id, call } => {
                let result = self.mappings.handle_call(&from, call);
                let reply = PeerMessage::mapping_result(request_id, result);
                if let Some(session) = self.sessions.get(&id) {
                    if session.tx.try_send(reply).is_err() {
                        warn!("session {}: dropping mapping result for {}", id, from);
                    }
                }
            }
            PeerRequest::NodeAction {
                request_id,
                action,
                args,
            } => {
                debug!("session {}: {} runs node action {}", id, from, action);
                let reply = PeerMessage::action_result(request_id, self.actions.run(&action, &args));
                if let Some(session) = self.sessions.get(&id) {
                    if session.tx.try_send(reply).is_err() {
                        warn!("session {}: dropping action result for {}", id, from);
                    }
                }
            }
            PeerRequest::Subscribe { .. } => warn!("session {}: {} subscribed twice", id, from),
            PeerRequest::Logoff => {}
        }
    }

    fn has_session(&self, node_name: &str) -> bool {
        self.sessions.values().any(|s| s.node_name == node_name)
    }

    fn close_session(&mut self, id: u64) {
        let Some(session) = self.sessions.remove(&id) else {
            return;
        };
        debug!("session {} with {} closed", id, session.node_name);
        if !self.has_session(&session.node_name) {
            self.locks.subscriber_removed(&session.node_name);
        }
    }

    /// Send an event to every subscriber. A subscriber too slow to keep up
    /// loses its session and resubscribes for a fresh snapshot.
    fn publish(&mut self, event: NodeEvent) {
        self.seq += 1;
        let msg = PeerMessage::Event {
            seq: self.seq,
            event,
        };
        let lagging: Vec<u64> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.tx.try_send(msg.clone()).is_err())
            .map(|(id, _)| *id)
            .collect();
        for id in lagging {
            warn!("session {}: write queue full, dropping subscriber", id);
            self.close_session(id);
        }
    }

    fn notify_stale_cache(&mut self, from: &str, cache: String, data: Vec<u8>) {
        let Some(observers) = self.cache_observers.get_mut(&cache) else {
            debug!("no observers for cache {} from {}", cache, from);
            return;
        };
        let notice = StaleCache {
            from: from.to_string(),
            cache: cache.clone(),
            data,
        };
        observers.retain(|tx| match tx.try_send(notice.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("stale-cache observer for {} is full", cache);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    // -----------------------------------------------------------------------
    // Effects
    // -----------------------------------------------------------------------

    /// Carry out everything the arbitrator and the mapping service asked for.
    fn drain_effects(&mut self) {
        loop {
            let actions = self.locks.take_actions();
            let effects = self.mappings.take_effects();
            if actions.is_empty() && effects.is_empty() {
                return;
            }
            for action in actions {
                self.lock_action(action);
            }
            for effect in effects {
                self.mapping_effect(effect);
            }
        }
    }

    fn lock_action(&mut self, action: LockAction) {
        match action {
            LockAction::Publish(event) => self.publish(event),
            LockAction::Ratify {
                peer,
                lock,
                acquire,
            } => {
                let sent = match self.peers.get(&peer) {
                    Some(conn) => conn.send(PeerRequest::RatifyLock {
                        lock: lock.clone(),
                        acquire,
                    }),
                    None => Err(ConcordError::PeerUnavailable),
                };
                if let Err(e) = sent {
                    warn!("cannot ratify {} for {}: {}", lock, peer, e);
                }
            }
            LockAction::ScheduleTimeout { lock, generation } => self
                .scheduler
                .schedule_once(self.config.lock_timeout, NodeCommand::LockTimeout { lock, generation }),
            LockAction::Dropped(lock) => {
                warn!("lost lock {}", lock);
                let _ = self.dropped.send(lock);
            }
        }
    }

    fn mapping_effect(&mut self, effect: MappingEffect) {
        match effect {
            MappingEffect::Broadcast(event) => self.publish(event),
            MappingEffect::Call {
                peer,
                request_id,
                call,
            } => {
                let sent = match self.peers.get(&peer) {
                    Some(conn) if conn.is_subscribed() => {
                        conn.send(PeerRequest::Mapping { request_id, call })
                    }
                    _ => Err(ConcordError::PeerUnavailable),
                };
                if let Err(e) = sent {
                    debug!("mapping call {} to {} not sent: {}", request_id, peer, e);
                    self.mappings.call_completed(request_id, Err(e));
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // API
    // -----------------------------------------------------------------------

    fn api_request(&mut self, req: ApiRequest) {
        match req {
            ApiRequest::AcquireLock(lock, reply) => self.locks.acquire(lock, reply),
            ApiRequest::ReleaseLock(lock, reply) => self.locks.release(lock, reply),
            ApiRequest::QueryLock(lock, reply) => self.locks.query(lock, reply),
            ApiRequest::ReacquireLock(lock, reply) => {
                let _ = reply.send(self.locks.reacquire(lock));
            }
            ApiRequest::LockState(lock, reply) => {
                let _ = reply.send(self.locks.state(&lock));
            }
            ApiRequest::LockStats(reply) => {
                let _ = reply.send(self.locks.stats());
            }
            ApiRequest::Mapping(call, reply) => self.mappings.submit(call, reply),
            ApiRequest::Entries(idx, reply) => {
                let _ = reply.send(self.mappings.entries(idx));
            }
            ApiRequest::AddListener(idx, listener, reply) => {
                let _ = reply.send(self.mappings.add_listener(idx, listener));
            }
            ApiRequest::MasterOf(idx, reply) => {
                let _ = reply.send(self.mappings.master_of(idx).map(str::to_string));
            }
            ApiRequest::BroadcastStaleCache { cache, data, reply } => {
                if cache.starts_with(MAPPING_CACHE_PREFIX) {
                    error!("cache name {} is reserved for mappings", cache);
                    let _ = reply.send(Err(ConcordError::InvalidParms));
                    return;
                }
                debug!("broadcasting stale cache {} ({} bytes)", cache, data.len());
                self.publish(NodeEvent::CacheData { cache, data });
                let _ = reply.send(Ok(()));
            }
            ApiRequest::AddStaleCacheObserver(cache, tx) => {
                self.cache_observers.entry(cache).or_default().push(tx);
            }
            ApiRequest::Peers(reply) => {
                let _ = reply.send(self.peers.values().map(PeerConnection::status).collect());
            }
            ApiRequest::InvokeAction {
                node,
                action,
                args,
                reply,
            } => self.invoke_action(node, action, args, reply),
        }
    }

    /// Run `action` here, or send it to `node` if that is a subscribed peer.
    fn invoke_action(&mut self, node: String, action: String, args: Vec<u8>, reply: ActionReply) {
        if node == self.record.node_name {
            let _ = reply.send(self.actions.run(&action, &args));
            return;
        }
        let Some(peer) = self.peers.get(&node).filter(|p| p.is_subscribed()) else {
            debug!("node action {} for {}: not subscribed", action, node);
            let _ = reply.send(Err(ConcordError::PeerUnavailable));
            return;
        };
        let request_id = self.actions.begin(&node, reply);
        let request = PeerRequest::NodeAction {
            request_id,
            action,
            args,
        };
        if let Err(e) = peer.send(request) {
            self.actions.complete(request_id, Err(e));
        }
    }

    async fn shutdown(&mut self) {
        info!("node {} shutting down", self.record.node_name);
        self.mappings.flush(Instant::now(), true);
        self.drain_effects();
        self.locks.shutdown();

        for peer in self.peers.values_mut() {
            peer.logoff();
        }
        // Dropping the senders lets session writers drain and close.
        self.sessions.clear();
        self.stop.notify_waiters();
        self.acceptor.abort();
        self.scheduler.shutdown();

        if let Err(e) = self.repository.shutdown_node(&self.record.node_name).await {
            warn!("failed to mark {} shut down: {}", self.record.node_name, e);
        }
    }
}
