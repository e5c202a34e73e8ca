//! Replicated key/value mappings.
//!
//! Mappings are configured at startup, in the same order on every node, and
//! get a cluster-wide index from that order. Each has a replication policy:
//!
//! - `ImmediateRebroadcast`: every node keeps a full copy. A mutation is
//!   applied locally, then broadcast as cache data on the node's shared
//!   record.
//! - `BatchedRebroadcast(interval)`: same, but changes are coalesced and
//!   broadcast at most once per interval.
//! - `NoRebroadcast`: one master node keeps the only copy; every other node
//!   proxies calls to it.
//!
//! [`MappingService`] works on raw bytes and does no I/O. Broadcasts and
//! proxied calls are returned as [`MappingEffect`]s for the node runtime to
//! carry out. [`MappingId`] adds typed keys and values on top through a
//! pluggable [`MappingCodec`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use concord_core::MasterRing;
use concord_proto::constants::MAPPING_CACHE_PREFIX;
use concord_proto::error::{ConcordError, ConcordResult};
use concord_proto::message::{MappingCall, NodeEvent};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

pub type MappingReply = oneshot::Sender<ConcordResult<Option<Vec<u8>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationPolicy {
    ImmediateRebroadcast,
    BatchedRebroadcast(Duration),
    NoRebroadcast,
}

impl ReplicationPolicy {
    pub fn is_replicated(self) -> bool {
        !matches!(self, ReplicationPolicy::NoRebroadcast)
    }
}

impl fmt::Display for ReplicationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicationPolicy::ImmediateRebroadcast => f.write_str("immediate"),
            ReplicationPolicy::BatchedRebroadcast(d) => write!(f, "batched({}ms)", d.as_millis()),
            ReplicationPolicy::NoRebroadcast => f.write_str("remote"),
        }
    }
}

// ---------------------------------------------------------------------------
// Codecs and typed ids
// ---------------------------------------------------------------------------

/// Converts mapping keys or values to and from bytes.
pub trait MappingCodec<T>: Send + Sync {
    fn encode(&self, value: &T) -> ConcordResult<Vec<u8>>;
    fn decode(&self, data: &[u8]) -> ConcordResult<T>;
}

pub struct BincodeCodec<T>(PhantomData<fn() -> T>);

impl<T> BincodeCodec<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for BincodeCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Serialize + DeserializeOwned> MappingCodec<T> for BincodeCodec<T> {
    fn encode(&self, value: &T) -> ConcordResult<Vec<u8>> {
        bincode::serialize(value).map_err(|_| ConcordError::CodecError)
    }

    fn decode(&self, data: &[u8]) -> ConcordResult<T> {
        bincode::deserialize(data).map_err(|_| ConcordError::CodecError)
    }
}

/// Typed handle on a mapping: its id plus the codecs for its keys and values.
pub struct MappingId<K, V> {
    name: String,
    keys: Arc<dyn MappingCodec<K>>,
    values: Arc<dyn MappingCodec<V>>,
}

impl<K, V> Clone for MappingId<K, V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            keys: Arc::clone(&self.keys),
            values: Arc::clone(&self.values),
        }
    }
}

impl<K, V> fmt::Debug for MappingId<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MappingId").field(&self.name).finish()
    }
}

impl<K, V> MappingId<K, V>
where
    K: Serialize + DeserializeOwned + 'static,
    V: Serialize + DeserializeOwned + 'static,
{
    /// An id using bincode for keys and values.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_codecs(
            name,
            Arc::new(BincodeCodec::<K>::new()),
            Arc::new(BincodeCodec::<V>::new()),
        )
    }
}

impl<K: 'static, V: 'static> MappingId<K, V> {
    pub fn with_codecs(
        name: impl Into<String>,
        keys: Arc<dyn MappingCodec<K>>,
        values: Arc<dyn MappingCodec<V>>,
    ) -> Self {
        Self {
            name: name.into(),
            keys,
            values,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn encode_key(&self, key: &K) -> ConcordResult<Vec<u8>> {
        self.keys.encode(key)
    }

    pub fn encode_value(&self, value: &V) -> ConcordResult<Vec<u8>> {
        self.values.encode(value)
    }

    pub fn decode_key(&self, data: &[u8]) -> ConcordResult<K> {
        self.keys.decode(data)
    }

    pub fn decode_value(&self, data: &[u8]) -> ConcordResult<V> {
        self.values.decode(data)
    }

    /// Wrap a typed listener for [`MappingService::add_listener`].
    pub fn listener<L>(&self, listener: L) -> Box<dyn RawListener>
    where
        L: MappingListener<K, V> + 'static,
    {
        Box::new(TypedListener {
            id: self.clone(),
            inner: listener,
        })
    }

    /// Wrap typed logic run against one value on the mapping's owner.
    pub fn value_action<A, R, F>(&self, f: F) -> ValueAction
    where
        A: DeserializeOwned,
        R: Serialize,
        F: Fn(&K, Option<V>, A) -> ConcordResult<(Update<V>, R)> + Send + 'static,
    {
        let id = self.clone();
        Box::new(move |key, current, args| {
            let typed_key = id.decode_key(key)?;
            let current = current.map(|v| id.decode_value(v)).transpose()?;
            let args = decode_args(args)?;
            let (update, result) = f(&typed_key, current, args)?;
            let change = match update {
                Update::Keep => None,
                Update::Set(v) => Some((key.to_vec(), Some(id.encode_value(&v)?))),
                Update::Remove => Some((key.to_vec(), None)),
            };
            Ok(ActionOutcome {
                changes: change.into_iter().collect(),
                result: encode_result(&result)?,
            })
        })
    }

    /// Wrap typed logic run against the whole mapping on its owner. The
    /// logic may change the map; the differences are applied afterwards.
    pub fn map_action<A, R, F>(&self, f: F) -> MapAction
    where
        K: Ord,
        A: DeserializeOwned,
        R: Serialize,
        F: Fn(&mut BTreeMap<K, V>, A) -> ConcordResult<R> + Send + 'static,
    {
        let id = self.clone();
        Box::new(move |entries, args| {
            let mut typed = BTreeMap::new();
            for (k, v) in entries {
                typed.insert(id.decode_key(k)?, id.decode_value(v)?);
            }
            let result = f(&mut typed, decode_args(args)?)?;

            let mut after = BTreeMap::new();
            for (k, v) in &typed {
                after.insert(id.encode_key(k)?, id.encode_value(v)?);
            }
            let mut changes: Vec<(Vec<u8>, Option<Vec<u8>>)> = entries
                .keys()
                .filter(|k| !after.contains_key(*k))
                .map(|k| (k.clone(), None))
                .collect();
            for (k, v) in after {
                if entries.get(&k) != Some(&v) {
                    changes.push((k, Some(v)));
                }
            }
            Ok(ActionOutcome {
                changes,
                result: encode_result(&result)?,
            })
        })
    }
}

fn decode_args<A: DeserializeOwned>(args: &[u8]) -> ConcordResult<A> {
    bincode::deserialize(args).map_err(|_| ConcordError::CodecError)
}

fn encode_result<R: Serialize>(result: &R) -> ConcordResult<Vec<u8>> {
    bincode::serialize(result).map_err(|_| ConcordError::CodecError)
}

// ---------------------------------------------------------------------------
// Actions and listeners
// ---------------------------------------------------------------------------

/// What a value action does to the value it ran against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update<V> {
    Keep,
    Set(V),
    Remove,
}

/// Result of a named action: entry changes (`None` removes) and the encoded
/// answer for the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionOutcome {
    pub changes: Vec<(Vec<u8>, Option<Vec<u8>>)>,
    pub result: Vec<u8>,
}

/// `(key, current value, args)`.
pub type ValueAction =
    Box<dyn Fn(&[u8], Option<&[u8]>, &[u8]) -> ConcordResult<ActionOutcome> + Send>;
/// `(entries, args)`.
pub type MapAction =
    Box<dyn Fn(&BTreeMap<Vec<u8>, Vec<u8>>, &[u8]) -> ConcordResult<ActionOutcome> + Send>;

/// Observes changes to a mapping on this node.
pub trait MappingListener<K, V>: Send {
    fn entry_put(&mut self, _key: &K, _value: &V, _old: Option<&V>) -> ConcordResult<()> {
        Ok(())
    }

    fn entry_removed(&mut self, _key: &K, _old: &V) -> ConcordResult<()> {
        Ok(())
    }
}

/// Byte-level listener as stored by the service.
pub trait RawListener: Send {
    fn entry_put(&mut self, key: &[u8], value: &[u8], old: Option<&[u8]>) -> ConcordResult<()>;
    fn entry_removed(&mut self, key: &[u8], old: &[u8]) -> ConcordResult<()>;
}

struct TypedListener<K, V, L> {
    id: MappingId<K, V>,
    inner: L,
}

impl<K, V, L> RawListener for TypedListener<K, V, L>
where
    K: 'static,
    V: 'static,
    L: MappingListener<K, V>,
{
    fn entry_put(&mut self, key: &[u8], value: &[u8], old: Option<&[u8]>) -> ConcordResult<()> {
        let key = self.id.decode_key(key)?;
        let value = self.id.decode_value(value)?;
        let old = old.map(|o| self.id.decode_value(o)).transpose()?;
        self.inner.entry_put(&key, &value, old.as_ref())
    }

    fn entry_removed(&mut self, key: &[u8], old: &[u8]) -> ConcordResult<()> {
        let key = self.id.decode_key(key)?;
        let old = self.id.decode_value(old)?;
        self.inner.entry_removed(&key, &old)
    }
}

/// Run `f`, turning a panic into an error.
pub(crate) fn isolate<T>(f: impl FnOnce() -> ConcordResult<T>) -> ConcordResult<T> {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or(Err(ConcordError::ActionFailed))
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Side effects requested by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingEffect {
    /// Publish on our shared record.
    Broadcast(NodeEvent),
    /// Send a call to the master; answer with [`MappingService::call_completed`].
    Call {
        peer: String,
        request_id: u64,
        call: MappingCall,
    },
}

struct Mapping {
    id: String,
    idx: u16,
    policy: ReplicationPolicy,
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
    /// Changes not yet broadcast (batched policy).
    dirty: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    last_flush: Option<Instant>,
    listeners: Vec<Box<dyn RawListener>>,
    value_actions: BTreeMap<String, ValueAction>,
    map_actions: BTreeMap<String, MapAction>,
}

impl Mapping {
    fn cache_name(&self) -> String {
        format!("{}{}", MAPPING_CACHE_PREFIX, self.id)
    }

    /// Store or delete one entry and tell the listeners.
    fn apply_change(&mut self, key: Vec<u8>, value: Option<Vec<u8>>) -> Option<Vec<u8>> {
        let old = match &value {
            Some(v) => self.entries.insert(key.clone(), v.clone()),
            None => self.entries.remove(&key),
        };
        for (i, listener) in self.listeners.iter_mut().enumerate() {
            let outcome = match (&value, &old) {
                (Some(v), old) => isolate(|| listener.entry_put(&key, v, old.as_deref())),
                (None, Some(old)) => isolate(|| listener.entry_removed(&key, old)),
                (None, None) => Ok(()),
            };
            if let Err(e) = outcome {
                warn!("mapping {}: listener {} failed: {}", self.id, i, e);
            }
        }
        old
    }

    fn sync_call(&self, changes: BTreeMap<Vec<u8>, Option<Vec<u8>>>) -> MappingCall {
        let (keys, values) = changes.into_iter().unzip();
        MappingCall::Sync {
            map_idx: self.idx,
            keys,
            values,
        }
    }
}

struct PendingCall {
    peer: String,
    waiter: Waiter,
}

enum Waiter {
    Reply(MappingReply),
    /// Entries handed to a new master, kept until it acknowledges them.
    Handoff(u16, BTreeMap<Vec<u8>, Vec<u8>>),
}

pub struct MappingService {
    node_name: String,
    sealed: bool,
    mappings: BTreeMap<u16, Mapping>,
    by_id: BTreeMap<String, u16>,
    minister_count: usize,
    ring: MasterRing,
    next_request: u64,
    pending: BTreeMap<u64, PendingCall>,
    effects: Vec<MappingEffect>,
}

impl MappingService {
    pub fn new(node_name: impl Into<String>, minister_count: usize) -> Self {
        let node_name = node_name.into();
        Self {
            ring: MasterRing::new([node_name.as_str()]),
            node_name,
            sealed: false,
            mappings: BTreeMap::new(),
            by_id: BTreeMap::new(),
            minister_count: minister_count.max(1),
            next_request: 0,
            pending: BTreeMap::new(),
            effects: Vec::new(),
        }
    }

    /// Register a mapping and return its index. Indices start at 1 and
    /// follow configuration order.
    pub fn configure(&mut self, id: &str, policy: ReplicationPolicy) -> ConcordResult<u16> {
        if self.sealed {
            error!("mapping {} configured after start", id);
            return Err(ConcordError::ConfigurationClosed);
        }
        if self.by_id.contains_key(id) {
            error!("mapping {} configured twice", id);
            return Err(ConcordError::DuplicateMapping);
        }
        let Some(idx) = u16::try_from(self.mappings.len() + 1).ok() else {
            error!("no mapping index left for {}", id);
            return Err(ConcordError::InvalidParms);
        };
        self.mappings.insert(
            idx,
            Mapping {
                id: id.to_string(),
                idx,
                policy,
                entries: BTreeMap::new(),
                dirty: BTreeMap::new(),
                last_flush: None,
                listeners: Vec::new(),
                value_actions: BTreeMap::new(),
                map_actions: BTreeMap::new(),
            },
        );
        self.by_id.insert(id.to_string(), idx);
        info!("mapping {} configured as #{} ({})", id, idx, policy);
        Ok(idx)
    }

    pub fn register_value_action(
        &mut self,
        id: &str,
        name: &str,
        action: ValueAction,
    ) -> ConcordResult<()> {
        self.check_open(id)?;
        let mapping = self.mapping_by_id(id)?;
        mapping.value_actions.insert(name.to_string(), action);
        Ok(())
    }

    pub fn register_map_action(
        &mut self,
        id: &str,
        name: &str,
        action: MapAction,
    ) -> ConcordResult<()> {
        self.check_open(id)?;
        let mapping = self.mapping_by_id(id)?;
        mapping.map_actions.insert(name.to_string(), action);
        Ok(())
    }

    /// No more configuration once traffic is served.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    /// Every configured id and its index.
    pub fn indices(&self) -> BTreeMap<String, u16> {
        self.by_id.clone()
    }

    pub fn index_of(&self, id: &str) -> ConcordResult<u16> {
        self.by_id.get(id).copied().ok_or_else(|| {
            error!("unknown mapping {}", id);
            ConcordError::UnknownMapping
        })
    }

    pub fn policy(&self, idx: u16) -> ConcordResult<ReplicationPolicy> {
        Ok(self.mapping(idx)?.policy)
    }

    /// Current master of a mapping's copy; `None` for replicated mappings.
    pub fn master_of(&self, idx: u16) -> Option<&str> {
        let mapping = self.mappings.get(&idx)?;
        if mapping.policy.is_replicated() {
            return None;
        }
        self.ring.master_for(&mapping.id)
    }

    pub fn add_listener(&mut self, idx: u16, listener: Box<dyn RawListener>) -> ConcordResult<()> {
        self.mapping_mut(idx)?.listeners.push(listener);
        Ok(())
    }

    pub fn take_effects(&mut self) -> Vec<MappingEffect> {
        mem::take(&mut self.effects)
    }

    /// Snapshot of a replicated mapping.
    pub fn entries(&self, idx: u16) -> ConcordResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mapping = self.mapping(idx)?;
        if !mapping.policy.is_replicated() {
            return Err(ConcordError::WrongMappingKind);
        }
        Ok(mapping
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    /// Run a call from local code: on the local copy, or on the master.
    pub fn submit(&mut self, call: MappingCall, reply: MappingReply) {
        let idx = call.map_idx();
        let policy = match self.policy(idx) {
            Ok(policy) => policy,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        if policy.is_replicated() {
            let _ = reply.send(self.apply(call));
            return;
        }
        match self.master_of(idx).map(str::to_string) {
            None => {
                let _ = reply.send(Err(ConcordError::NoMaster));
            }
            Some(master) if master == self.node_name => {
                let _ = reply.send(self.apply(call));
            }
            Some(master) => self.send_call(master, call, Waiter::Reply(reply)),
        }
    }

    /// Run a call proxied to us by `from`.
    pub fn handle_call(&mut self, from: &str, call: MappingCall) -> ConcordResult<Option<Vec<u8>>> {
        let idx = call.map_idx();
        if self.policy(idx)?.is_replicated() {
            warn!("{} proxied a call to replicated mapping #{}", from, idx);
            return Err(ConcordError::WrongMappingKind);
        }
        if matches!(call, MappingCall::Handoff { .. }) {
            info!("{} handed mapping #{} to us", from, idx);
            return self.apply(call);
        }
        if self.master_of(idx) != Some(self.node_name.as_str()) {
            debug!("{} called mapping #{}, but we are not its master", from, idx);
            return Err(ConcordError::NotMaster);
        }
        self.apply(call)
    }

    /// Answer for a call sent with [`MappingEffect::Call`].
    pub fn call_completed(&mut self, request_id: u64, result: ConcordResult<Option<Vec<u8>>>) {
        let Some(pending) = self.pending.remove(&request_id) else {
            debug!("result for unknown mapping request {}", request_id);
            return;
        };
        match pending.waiter {
            Waiter::Reply(reply) => {
                let _ = reply.send(result);
            }
            Waiter::Handoff(idx, entries) => match result {
                Ok(_) => debug!("{} took mapping #{}", pending.peer, idx),
                Err(e) => {
                    warn!(
                        "mapping #{} hand-off to {} failed: {}; keeping {} entries",
                        idx,
                        pending.peer,
                        e,
                        entries.len()
                    );
                    if let Some(mapping) = self.mappings.get_mut(&idx) {
                        for (key, value) in entries {
                            mapping.entries.entry(key).or_insert(value);
                        }
                    }
                }
            },
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
            self.call_completed(request_id, Err(ConcordError::PeerUnavailable));
        }
    }

    /// Apply cache data published by another node. Returns false if `cache`
    /// is not a mapping cache.
    pub fn cache_data(&mut self, from: &str, cache: &str, data: &[u8]) -> bool {
        let Some(id) = cache.strip_prefix(MAPPING_CACHE_PREFIX) else {
            return false;
        };
        let Some(idx) = self.by_id.get(id).copied() else {
            warn!("{} sent data for unknown mapping {}", from, id);
            return true;
        };
        let (keys, values) = match bincode::deserialize::<MappingCall>(data) {
            Ok(MappingCall::Sync { keys, values, .. }) if keys.len() == values.len() => {
                (keys, values)
            }
            _ => {
                warn!("{} sent malformed data for mapping {}", from, id);
                return true;
            }
        };
        if let Some(mapping) = self.mappings.get_mut(&idx) {
            debug!("mapping {}: {} changes from {}", id, keys.len(), from);
            for (key, value) in keys.into_iter().zip(values) {
                mapping.apply_change(key, value);
            }
        }
        true
    }

    /// Broadcast batched changes whose interval has passed, or all of them
    /// when `force` is set.
    pub fn flush(&mut self, now: Instant, force: bool) {
        for mapping in self.mappings.values_mut() {
            let ReplicationPolicy::BatchedRebroadcast(interval) = mapping.policy else {
                continue;
            };
            if mapping.dirty.is_empty() {
                continue;
            }
            let due = match mapping.last_flush {
                Some(last) => now.saturating_duration_since(last) >= interval,
                None => true,
            };
            if !due && !force {
                continue;
            }
            let changes = mem::take(&mut mapping.dirty);
            mapping.last_flush = Some(now);
            if let Some(event) = Self::sync_event(mapping, changes) {
                self.effects.push(MappingEffect::Broadcast(event));
            }
        }
    }

    /// The set of live nodes changed. Recompute the ministry and hand off
    /// any mastered copy we no longer own.
    pub fn update_ministry(&mut self, live: &BTreeSet<String>) {
        let ministers: Vec<&str> = live
            .iter()
            .map(String::as_str)
            .take(self.minister_count)
            .collect();
        let ring = MasterRing::new(ministers.iter().copied());
        if !ring.nodes().eq(self.ring.nodes()) {
            info!("ministers now {:?}", ministers);
            self.ring = ring;
        }
        self.resume_hand_offs();
    }

    /// Send every remote copy held here but mastered elsewhere to its
    /// master. Entries stay parked with the call until it is answered and
    /// come back if it fails, so a later call retries them.
    pub fn resume_hand_offs(&mut self) {
        let mut handoffs = Vec::new();
        for mapping in self.mappings.values_mut() {
            if mapping.policy.is_replicated() || mapping.entries.is_empty() {
                continue;
            }
            let Some(master) = self.ring.master_for(&mapping.id) else {
                continue;
            };
            if master == self.node_name {
                continue;
            }
            info!(
                "handing mapping {} ({} entries) to {}",
                mapping.id,
                mapping.entries.len(),
                master
            );
            let entries = mem::take(&mut mapping.entries);
            let call = MappingCall::Handoff {
                map_idx: mapping.idx,
                keys: entries.keys().cloned().collect(),
                values: entries.values().cloned().collect(),
            };
            handoffs.push((master.to_string(), call, Waiter::Handoff(mapping.idx, entries)));
        }
        for (master, call, waiter) in handoffs {
            self.send_call(master, call, waiter);
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn check_open(&self, id: &str) -> ConcordResult<()> {
        if self.sealed {
            error!("action for mapping {} registered after start", id);
            return Err(ConcordError::ConfigurationClosed);
        }
        Ok(())
    }

    fn mapping(&self, idx: u16) -> ConcordResult<&Mapping> {
        self.mappings.get(&idx).ok_or(ConcordError::UnknownMapping)
    }

    fn mapping_mut(&mut self, idx: u16) -> ConcordResult<&mut Mapping> {
        self.mappings.get_mut(&idx).ok_or(ConcordError::UnknownMapping)
    }

    fn mapping_by_id(&mut self, id: &str) -> ConcordResult<&mut Mapping> {
        let idx = self.index_of(id)?;
        self.mapping_mut(idx)
    }

    fn send_call(&mut self, peer: String, call: MappingCall, waiter: Waiter) {
        self.next_request += 1;
        let request_id = self.next_request;
        self.pending.insert(
            request_id,
            PendingCall {
                peer: peer.clone(),
                waiter,
            },
        );
        self.effects.push(MappingEffect::Call {
            peer,
            request_id,
            call,
        });
    }

    fn sync_event(
        mapping: &Mapping,
        changes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    ) -> Option<NodeEvent> {
        let call = mapping.sync_call(changes);
        match bincode::serialize(&call) {
            Ok(data) => Some(NodeEvent::CacheData {
                cache: mapping.cache_name(),
                data,
            }),
            Err(e) => {
                error!("mapping {}: failed to encode changes: {}", mapping.id, e);
                None
            }
        }
    }

    /// Run `call` against the copy held here and propagate the changes.
    fn apply(&mut self, call: MappingCall) -> ConcordResult<Option<Vec<u8>>> {
        let mapping = self.mapping_mut(call.map_idx())?;
        let (changes, answer) = match call {
            MappingCall::Get { key, .. } => return Ok(mapping.entries.get(&key).cloned()),
            MappingCall::Put { key, value, .. } => {
                let old = mapping.entries.get(&key).cloned();
                (vec![(key, Some(value))], old)
            }
            MappingCall::Remove { key, .. } => {
                let old = mapping.entries.get(&key).cloned();
                (vec![(key, None)], old)
            }
            MappingCall::Sync { keys, values, .. } => {
                if keys.len() != values.len() {
                    return Err(ConcordError::InvalidParms);
                }
                (keys.into_iter().zip(values).collect(), None)
            }
            MappingCall::WithValue {
                key, action, args, ..
            } => {
                let f = mapping
                    .value_actions
                    .get(&action)
                    .ok_or(ConcordError::UnknownAction)?;
                let current = mapping.entries.get(&key).map(Vec::as_slice);
                let outcome = isolate(|| f(&key, current, &args)).map_err(|e| {
                    warn!("mapping {}: action {} failed: {}", mapping.id, action, e);
                    ConcordError::ActionFailed
                })?;
                (outcome.changes, Some(outcome.result))
            }
            MappingCall::Handoff { keys, values, .. } => {
                if keys.len() != values.len() {
                    return Err(ConcordError::InvalidParms);
                }
                let fresh = keys
                    .into_iter()
                    .zip(values)
                    .filter(|(key, _)| !mapping.entries.contains_key(key))
                    .map(|(key, value)| (key, Some(value)))
                    .collect();
                (fresh, None)
            }
            MappingCall::With { action, args, .. } => {
                let f = mapping
                    .map_actions
                    .get(&action)
                    .ok_or(ConcordError::UnknownAction)?;
                let outcome = isolate(|| f(&mapping.entries, &args)).map_err(|e| {
                    warn!("mapping {}: action {} failed: {}", mapping.id, action, e);
                    ConcordError::ActionFailed
                })?;
                (outcome.changes, Some(outcome.result))
            }
        };

        let mut applied = BTreeMap::new();
        for (key, value) in changes {
            mapping.apply_change(key.clone(), value.clone());
            applied.insert(key, value);
        }
        if applied.is_empty() {
            return Ok(answer);
        }
        match mapping.policy {
            ReplicationPolicy::ImmediateRebroadcast => {
                if let Some(event) = Self::sync_event(mapping, applied) {
                    self.effects.push(MappingEffect::Broadcast(event));
                }
            }
            ReplicationPolicy::BatchedRebroadcast(_) => mapping.dirty.extend(applied),
            ReplicationPolicy::NoRebroadcast => {}
        }
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::oneshot::error::TryRecvError;

    fn scores() -> MappingId<String, u32> {
        MappingId::new("scores")
    }

    fn call(
        service: &mut MappingService,
        call: MappingCall,
    ) -> oneshot::Receiver<ConcordResult<Option<Vec<u8>>>> {
        let (tx, rx) = oneshot::channel();
        service.submit(call, tx);
        rx
    }

    fn put(
        service: &mut MappingService,
        idx: u16,
        key: &str,
        value: u32,
    ) -> ConcordResult<Option<Vec<u8>>> {
        let id = scores();
        let mut rx = call(
            service,
            MappingCall::Put {
                map_idx: idx,
                key: id.encode_key(&key.to_string()).unwrap(),
                value: id.encode_value(&value).unwrap(),
            },
        );
        rx.try_recv().unwrap()
    }

    fn get(service: &mut MappingService, idx: u16, key: &str) -> Option<u32> {
        let id = scores();
        let mut rx = call(
            service,
            MappingCall::Get {
                map_idx: idx,
                key: id.encode_key(&key.to_string()).unwrap(),
            },
        );
        rx.try_recv()
            .unwrap()
            .unwrap()
            .map(|v| id.decode_value(&v).unwrap())
    }

    /// Deliver every broadcast from `from` to `to`.
    fn relay(from: &mut MappingService, to: &mut MappingService) {
        for effect in from.take_effects() {
            if let MappingEffect::Broadcast(NodeEvent::CacheData { cache, data }) = effect {
                assert!(to.cache_data(&from.node_name, &cache, &data));
            }
        }
    }

    #[test]
    fn test_configuration_is_deterministic() {
        let ids = ["scores", "rooms", "bans"];
        let mut a = MappingService::new("alpha", 1);
        let mut b = MappingService::new("bravo", 1);
        for id in ids {
            let ia = a.configure(id, ReplicationPolicy::ImmediateRebroadcast).unwrap();
            let ib = b.configure(id, ReplicationPolicy::ImmediateRebroadcast).unwrap();
            assert_eq!(ia, ib);
        }
        assert_eq!(a.index_of("scores"), Ok(1));
        assert_eq!(a.index_of("bans"), Ok(3));
    }

    #[test]
    fn test_configuration_errors() {
        let mut service = MappingService::new("alpha", 1);
        service.configure("scores", ReplicationPolicy::NoRebroadcast).unwrap();
        assert_eq!(
            service.configure("scores", ReplicationPolicy::NoRebroadcast),
            Err(ConcordError::DuplicateMapping)
        );
        assert_eq!(service.index_of("rooms"), Err(ConcordError::UnknownMapping));

        service.seal();
        assert_eq!(
            service.configure("rooms", ReplicationPolicy::NoRebroadcast),
            Err(ConcordError::ConfigurationClosed)
        );
        let action = scores().value_action(|_k, v, ()| Ok((Update::Keep, v)));
        assert_eq!(
            service.register_value_action("scores", "peek", action),
            Err(ConcordError::ConfigurationClosed)
        );

        let mut rx = call(
            &mut service,
            MappingCall::Get {
                map_idx: 9,
                key: vec![],
            },
        );
        assert_eq!(rx.try_recv().unwrap(), Err(ConcordError::UnknownMapping));
    }

    #[test]
    fn test_immediate_rebroadcast_converges() {
        let mut a = MappingService::new("alpha", 1);
        let mut b = MappingService::new("bravo", 1);
        let idx = a.configure("scores", ReplicationPolicy::ImmediateRebroadcast).unwrap();
        b.configure("scores", ReplicationPolicy::ImmediateRebroadcast).unwrap();

        assert_eq!(put(&mut a, idx, "ann", 10), Ok(None));
        put(&mut b, idx, "bob", 20).unwrap();
        relay(&mut a, &mut b);
        relay(&mut b, &mut a);

        assert_eq!(get(&mut a, idx, "bob"), Some(20));
        assert_eq!(get(&mut b, idx, "ann"), Some(10));
        assert_eq!(a.entries(idx).unwrap(), b.entries(idx).unwrap());
        // Applying a remote sync does not echo it back.
        assert!(a.take_effects().is_empty());
        assert!(b.take_effects().is_empty());
    }

    #[test]
    fn test_batched_rebroadcast_coalesces() {
        let interval = Duration::from_millis(100);
        let mut a = MappingService::new("alpha", 1);
        let mut b = MappingService::new("bravo", 1);
        let idx = a.configure("scores", ReplicationPolicy::BatchedRebroadcast(interval)).unwrap();
        b.configure("scores", ReplicationPolicy::BatchedRebroadcast(interval)).unwrap();

        let start = Instant::now();
        put(&mut a, idx, "ann", 1).unwrap();
        a.flush(start, false);
        assert_eq!(a.take_effects().len(), 1);

        put(&mut a, idx, "ann", 2).unwrap();
        put(&mut a, idx, "ann", 3).unwrap();
        put(&mut a, idx, "bob", 4).unwrap();
        a.flush(start + Duration::from_millis(50), false);
        assert!(a.take_effects().is_empty());

        a.flush(start + interval, false);
        let effects = a.take_effects();
        assert_eq!(effects.len(), 1);
        match &effects[0] {
            MappingEffect::Broadcast(NodeEvent::CacheData { cache, data }) => {
                assert_eq!(cache, "mapping/scores");
                match bincode::deserialize::<MappingCall>(data).unwrap() {
                    MappingCall::Sync { keys, .. } => assert_eq!(keys.len(), 2),
                    other => panic!("unexpected payload {:?}", other),
                }
                assert!(b.cache_data("alpha", cache, data));
            }
            other => panic!("unexpected effect {:?}", other),
        }
        assert_eq!(get(&mut b, idx, "ann"), Some(3));
        assert_eq!(get(&mut b, idx, "bob"), Some(4));
    }

    #[test]
    fn test_forced_flush_ignores_interval() {
        let mut a = MappingService::new("alpha", 1);
        let idx = a
            .configure("scores", ReplicationPolicy::BatchedRebroadcast(Duration::from_secs(60)))
            .unwrap();
        let now = Instant::now();
        put(&mut a, idx, "ann", 1).unwrap();
        a.flush(now, false);
        a.take_effects();
        put(&mut a, idx, "ann", 2).unwrap();
        a.flush(now, true);
        assert_eq!(a.take_effects().len(), 1);
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl MappingListener<String, u32> for Recorder {
        fn entry_put(&mut self, key: &String, value: &u32, old: Option<&u32>) -> ConcordResult<()> {
            self.0.lock().unwrap().push(format!("put {} {} {:?}", key, value, old));
            Ok(())
        }

        fn entry_removed(&mut self, key: &String, old: &u32) -> ConcordResult<()> {
            self.0.lock().unwrap().push(format!("removed {} {}", key, old));
            Ok(())
        }
    }

    struct Failing;

    impl MappingListener<String, u32> for Failing {
        fn entry_put(&mut self, _: &String, _: &u32, _: Option<&u32>) -> ConcordResult<()> {
            Err(ConcordError::Unknown)
        }

        fn entry_removed(&mut self, _: &String, _: &u32) -> ConcordResult<()> {
            panic!("listener bug");
        }
    }

    #[test]
    fn test_listeners_are_isolated() {
        let mut service = MappingService::new("alpha", 1);
        let idx = service.configure("scores", ReplicationPolicy::ImmediateRebroadcast).unwrap();
        let recorder = Recorder::default();
        service.add_listener(idx, scores().listener(Failing)).unwrap();
        service.add_listener(idx, scores().listener(recorder.clone())).unwrap();

        put(&mut service, idx, "ann", 1).unwrap();
        put(&mut service, idx, "ann", 2).unwrap();
        let id = scores();
        let mut rx = call(
            &mut service,
            MappingCall::Remove {
                map_idx: idx,
                key: id.encode_key(&"ann".to_string()).unwrap(),
            },
        );
        assert_eq!(rx.try_recv().unwrap().unwrap(), Some(id.encode_value(&2).unwrap()));

        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec!["put ann 1 None", "put ann 2 Some(1)", "removed ann 2"]
        );
    }

    #[test]
    fn test_remote_mapping_always_proxies() {
        let mut a = MappingService::new("alpha", 2);
        let mut b = MappingService::new("bravo", 2);
        let idx = a.configure("scores", ReplicationPolicy::NoRebroadcast).unwrap();
        b.configure("scores", ReplicationPolicy::NoRebroadcast).unwrap();
        let live: BTreeSet<String> = ["alpha", "bravo"].iter().map(|s| s.to_string()).collect();
        a.update_ministry(&live);
        b.update_ministry(&live);
        assert_eq!(a.master_of(idx), b.master_of(idx));

        let (mut master, mut other) = if a.master_of(idx) == Some("alpha") {
            (a, b)
        } else {
            (b, a)
        };
        assert_eq!(other.entries(idx), Err(ConcordError::WrongMappingKind));

        let mut rx = call(
            &mut other,
            MappingCall::Put {
                map_idx: idx,
                key: vec![1],
                value: vec![2],
            },
        );
        let effects = other.take_effects();
        let (request_id, proxied) = match effects.as_slice() {
            [MappingEffect::Call {
                peer,
                request_id,
                call,
            }] => {
                assert_eq!(peer, &master.node_name);
                (*request_id, call.clone())
            }
            other => panic!("unexpected effects {:?}", other),
        };
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

        // The non-master refuses direct calls.
        assert_eq!(
            other.handle_call(&master.node_name, proxied.clone()),
            Err(ConcordError::NotMaster)
        );
        let result = master.handle_call(&other.node_name, proxied);
        assert_eq!(result, Ok(None));
        other.call_completed(request_id, result);
        assert_eq!(rx.try_recv().unwrap(), Ok(None));

        // Another read also goes over the wire.
        let mut rx = call(
            &mut other,
            MappingCall::Get {
                map_idx: idx,
                key: vec![1],
            },
        );
        assert_eq!(other.take_effects().len(), 1);
        let master_name = master.node_name.clone();
        other.peer_disconnected(&master_name);
        assert_eq!(rx.try_recv().unwrap(), Err(ConcordError::PeerUnavailable));
        assert!(master.take_effects().is_empty());
    }

    #[test]
    fn test_ministry_hand_off() {
        let mut alpha = MappingService::new("alpha", 1);
        let idx = alpha.configure("scores", ReplicationPolicy::NoRebroadcast).unwrap();
        put(&mut alpha, idx, "ann", 5).unwrap();

        // A lower-named node joins and becomes the only minister.
        let live: BTreeSet<String> = ["aardvark", "alpha"].iter().map(|s| s.to_string()).collect();
        alpha.update_ministry(&live);
        assert_eq!(alpha.master_of(idx), Some("aardvark"));
        let request_id = match alpha.take_effects().as_slice() {
            [MappingEffect::Call {
                peer,
                request_id,
                call,
            }] => {
                assert_eq!(peer, "aardvark");
                match call {
                    MappingCall::Handoff { keys, values, .. } => {
                        assert_eq!(keys.len(), 1);
                        assert_eq!(values.len(), 1);
                    }
                    other => panic!("unexpected call {:?}", other),
                }
                *request_id
            }
            other => panic!("unexpected effects {:?}", other),
        };
        alpha.call_completed(request_id, Ok(None));
        assert!(alpha.mappings[&idx].entries.is_empty());
        let get = MappingCall::Get {
            map_idx: idx,
            key: vec![],
        };
        assert_eq!(alpha.handle_call("aardvark", get), Err(ConcordError::NotMaster));

        // Unchanged ministry: nothing to do.
        alpha.update_ministry(&live);
        assert!(alpha.take_effects().is_empty());
    }

    /// A hand-off `Call` effect: (target, request id, call).
    fn hand_off(service: &mut MappingService) -> (String, u64, MappingCall) {
        match service.take_effects().as_slice() {
            [MappingEffect::Call {
                peer,
                request_id,
                call,
            }] => (peer.clone(), *request_id, call.clone()),
            other => panic!("expected one hand-off, got {:?}", other),
        }
    }

    fn live(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_hand_off_reaches_lagging_receiver() {
        let mut bravo = MappingService::new("bravo", 1);
        let mut alpha = MappingService::new("alpha", 1);
        let idx = bravo.configure("scores", ReplicationPolicy::NoRebroadcast).unwrap();
        alpha.configure("scores", ReplicationPolicy::NoRebroadcast).unwrap();
        bravo.update_ministry(&live(&["bravo"]));
        put(&mut bravo, idx, "ann", 5).unwrap();

        // alpha still believes "aa" is the only minister.
        alpha.update_ministry(&live(&["aa", "alpha"]));
        assert_eq!(alpha.master_of(idx), Some("aa"));

        bravo.update_ministry(&live(&["alpha", "bravo"]));
        let (peer, request_id, handoff) = hand_off(&mut bravo);
        assert_eq!(peer, "alpha");

        let result = alpha.handle_call("bravo", handoff);
        assert_eq!(result, Ok(None));
        bravo.call_completed(request_id, result);
        assert!(bravo.mappings[&idx].entries.is_empty());

        alpha.update_ministry(&live(&["alpha", "bravo"]));
        assert!(alpha.take_effects().is_empty());
        assert_eq!(get(&mut alpha, idx, "ann"), Some(5));
    }

    #[test]
    fn test_failed_hand_off_keeps_entries() {
        let mut bravo = MappingService::new("bravo", 1);
        let idx = bravo.configure("scores", ReplicationPolicy::NoRebroadcast).unwrap();
        bravo.update_ministry(&live(&["bravo"]));
        put(&mut bravo, idx, "ann", 5).unwrap();
        put(&mut bravo, idx, "bob", 6).unwrap();

        bravo.update_ministry(&live(&["alpha", "bravo"]));
        let (_, request_id, _) = hand_off(&mut bravo);
        assert!(bravo.mappings[&idx].entries.is_empty());
        bravo.call_completed(request_id, Err(ConcordError::NotMaster));
        assert_eq!(bravo.mappings[&idx].entries.len(), 2);

        // Retried on the next pass, and restored again if the peer goes away.
        bravo.resume_hand_offs();
        let (peer, _, call) = hand_off(&mut bravo);
        assert_eq!(peer, "alpha");
        assert!(matches!(call, MappingCall::Handoff { ref keys, .. } if keys.len() == 2));
        bravo.peer_disconnected("alpha");
        assert_eq!(bravo.mappings[&idx].entries.len(), 2);

        bravo.update_ministry(&live(&["bravo"]));
        assert!(bravo.take_effects().is_empty());
        assert_eq!(get(&mut bravo, idx, "bob"), Some(6));
    }

    #[test]
    fn test_hand_off_keeps_newer_entries() {
        let mut alpha = MappingService::new("alpha", 1);
        let idx = alpha.configure("scores", ReplicationPolicy::NoRebroadcast).unwrap();
        alpha.update_ministry(&live(&["alpha"]));
        put(&mut alpha, idx, "ann", 9).unwrap();

        let id = scores();
        let handoff = MappingCall::Handoff {
            map_idx: idx,
            keys: vec![
                id.encode_key(&"ann".to_string()).unwrap(),
                id.encode_key(&"bob".to_string()).unwrap(),
            ],
            values: vec![id.encode_value(&1).unwrap(), id.encode_value(&2).unwrap()],
        };
        assert_eq!(alpha.handle_call("bravo", handoff), Ok(None));
        assert_eq!(get(&mut alpha, idx, "ann"), Some(9));
        assert_eq!(get(&mut alpha, idx, "bob"), Some(2));
    }

    #[test]
    fn test_index_space_exhausted() {
        let mut service = MappingService::new("alpha", 1);
        for i in 0..u16::MAX {
            service
                .configure(&format!("m{}", i), ReplicationPolicy::ImmediateRebroadcast)
                .unwrap();
        }
        assert_eq!(service.index_of("m65534"), Ok(u16::MAX));
        assert_eq!(
            service.configure("one-more", ReplicationPolicy::ImmediateRebroadcast),
            Err(ConcordError::InvalidParms)
        );
    }

    #[test]
    fn test_named_actions() {
        let mut service = MappingService::new("alpha", 1);
        let idx = service.configure("scores", ReplicationPolicy::ImmediateRebroadcast).unwrap();
        let id = scores();
        service
            .register_value_action(
                "scores",
                "add",
                id.value_action(|_key, current: Option<u32>, delta: u32| {
                    let total = current.unwrap_or(0) + delta;
                    Ok((Update::Set(total), total))
                }),
            )
            .unwrap();
        service
            .register_map_action(
                "scores",
                "reset_below",
                id.map_action(|entries: &mut BTreeMap<String, u32>, floor: u32| {
                    let before = entries.len();
                    entries.retain(|_, v| *v >= floor);
                    Ok((before - entries.len()) as u32)
                }),
            )
            .unwrap();
        service.seal();

        let key = id.encode_key(&"ann".to_string()).unwrap();
        for expected in [3u32, 6] {
            let mut rx = call(
                &mut service,
                MappingCall::WithValue {
                    map_idx: idx,
                    key: key.clone(),
                    action: "add".into(),
                    args: bincode::serialize(&3u32).unwrap(),
                },
            );
            let out = rx.try_recv().unwrap().unwrap().unwrap();
            assert_eq!(bincode::deserialize::<u32>(&out).unwrap(), expected);
        }
        put(&mut service, idx, "bob", 1).unwrap();
        service.take_effects();

        let mut rx = call(
            &mut service,
            MappingCall::With {
                map_idx: idx,
                action: "reset_below".into(),
                args: bincode::serialize(&5u32).unwrap(),
            },
        );
        let out = rx.try_recv().unwrap().unwrap().unwrap();
        assert_eq!(bincode::deserialize::<u32>(&out).unwrap(), 1);
        assert_eq!(get(&mut service, idx, "bob"), None);
        assert_eq!(get(&mut service, idx, "ann"), Some(6));
        assert_eq!(service.take_effects().len(), 1);

        let mut rx = call(
            &mut service,
            MappingCall::With {
                map_idx: idx,
                action: "missing".into(),
                args: vec![],
            },
        );
        assert_eq!(rx.try_recv().unwrap(), Err(ConcordError::UnknownAction));
    }

    #[test]
    fn test_panicking_action_fails_call() {
        let mut service = MappingService::new("alpha", 1);
        let idx = service.configure("scores", ReplicationPolicy::ImmediateRebroadcast).unwrap();
        let action = scores().value_action(|_k, _v, ()| -> ConcordResult<(Update<u32>, ())> {
            panic!("action bug")
        });
        service.register_value_action("scores", "boom", action).unwrap();

        let mut rx = call(
            &mut service,
            MappingCall::WithValue {
                map_idx: idx,
                key: scores().encode_key(&"ann".to_string()).unwrap(),
                action: "boom".into(),
                args: bincode::serialize(&()).unwrap(),
            },
        );
        assert_eq!(rx.try_recv().unwrap(), Err(ConcordError::ActionFailed));
        assert!(service.entries(idx).unwrap().is_empty());
    }

    #[test]
    fn test_foreign_cache_is_ignored() {
        let mut service = MappingService::new("alpha", 1);
        assert!(!service.cache_data("bravo", "leaderboard", &[1, 2, 3]));
        assert!(service.cache_data("bravo", "mapping/unknown", &[1]));
    }
}
