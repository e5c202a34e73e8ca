//! Cloneable handle on a running node.
//!
//! Every call is a request on the node's command queue answered through a
//! oneshot channel. Once the node has stopped, calls fail with
//! `ConcordError::Shutdown`.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use concord_proto::defaults::DEFAULT_STALE_CACHE_CHANNEL_SIZE;
use concord_proto::error::{ConcordError, ConcordResult};
use concord_proto::lock::Lock;
use concord_proto::message::MappingCall;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use crate::locks::{LockState, LockStats};
use crate::mapping::{MappingId, MappingListener};
use crate::node::{ApiRequest, NodeCommand, StaleCache};
use crate::peer::{PeerState, PeerStatus};

#[derive(Clone)]
pub struct NodeHandle {
    node_name: String,
    port: u16,
    tx: mpsc::Sender<NodeCommand>,
    /// Mapping indices, fixed once the node started.
    indices: Arc<BTreeMap<String, u16>>,
    dropped: broadcast::Sender<Lock>,
}

impl NodeHandle {
    pub(crate) fn new(
        node_name: String,
        port: u16,
        tx: mpsc::Sender<NodeCommand>,
        indices: Arc<BTreeMap<String, u16>>,
        dropped: broadcast::Sender<Lock>,
    ) -> Self {
        Self {
            node_name,
            port,
            tx,
            indices,
            dropped,
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Port the session listener is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    async fn request<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> ApiRequest) -> ConcordResult<R> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(NodeCommand::Api(make(tx)))
            .await
            .map_err(|_| ConcordError::Shutdown)?;
        rx.await.map_err(|_| ConcordError::Shutdown)
    }

    // ─── Locks ──────────────────────────────────────────────────────────────

    /// Try to take `lock` and return its owner once settled: this node on
    /// success, another node if it won.
    pub async fn acquire_lock(&self, lock: Lock) -> ConcordResult<Option<String>> {
        self.request(|reply| ApiRequest::AcquireLock(lock, reply)).await?
    }

    /// Give up `lock`; returns the owner afterwards, `None` on success.
    pub async fn release_lock(&self, lock: Lock) -> ConcordResult<Option<String>> {
        self.request(|reply| ApiRequest::ReleaseLock(lock, reply)).await?
    }

    /// Cancel a release in progress. False if there was none.
    pub async fn reacquire_lock(&self, lock: Lock) -> ConcordResult<bool> {
        self.request(|reply| ApiRequest::ReacquireLock(lock, reply)).await
    }

    /// Owner of `lock` once any resolution in flight settles.
    pub async fn query_lock(&self, lock: Lock) -> ConcordResult<Option<String>> {
        self.request(|reply| ApiRequest::QueryLock(lock, reply)).await?
    }

    pub async fn lock_state(&self, lock: Lock) -> ConcordResult<LockState> {
        self.request(|reply| ApiRequest::LockState(lock, reply)).await
    }

    pub async fn lock_stats(&self) -> ConcordResult<LockStats> {
        self.request(ApiRequest::LockStats).await
    }

    /// Acquire `lock`, run `op`, then release. Fails with `LockContended`
    /// if another node holds the lock.
    pub async fn perform_with_lock<F, Fut, T>(&self, lock: Lock, op: F) -> ConcordResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        match self.acquire_lock(lock.clone()).await? {
            Some(owner) if owner == self.node_name => {}
            owner => {
                debug!("lock {} unavailable: held by {:?}", lock, owner);
                return Err(ConcordError::LockContended);
            }
        }
        let result = op().await;
        if let Err(e) = self.release_lock(lock.clone()).await {
            warn!("failed to release lock {}: {}", lock, e);
        }
        Ok(result)
    }

    /// Locks this node lost to another node without releasing them.
    pub fn dropped_locks(&self) -> broadcast::Receiver<Lock> {
        self.dropped.subscribe()
    }

    // ─── Mappings ───────────────────────────────────────────────────────────

    fn index<K, V>(&self, id: &MappingId<K, V>) -> ConcordResult<u16>
    where
        K: 'static,
        V: 'static,
    {
        self.indices
            .get(id.name())
            .copied()
            .ok_or(ConcordError::UnknownMapping)
    }

    async fn call(&self, call: MappingCall) -> ConcordResult<Option<Vec<u8>>> {
        self.request(|reply| ApiRequest::Mapping(call, reply)).await?
    }

    pub async fn get<K: 'static, V: 'static>(
        &self,
        id: &MappingId<K, V>,
        key: &K,
    ) -> ConcordResult<Option<V>> {
        let call = MappingCall::Get {
            map_idx: self.index(id)?,
            key: id.encode_key(key)?,
        };
        self.call(call)
            .await?
            .map(|v| id.decode_value(&v))
            .transpose()
    }

    /// Store `value`; returns the previous value.
    pub async fn put<K: 'static, V: 'static>(
        &self,
        id: &MappingId<K, V>,
        key: &K,
        value: &V,
    ) -> ConcordResult<Option<V>> {
        let call = MappingCall::Put {
            map_idx: self.index(id)?,
            key: id.encode_key(key)?,
            value: id.encode_value(value)?,
        };
        self.call(call)
            .await?
            .map(|v| id.decode_value(&v))
            .transpose()
    }

    /// Delete `key`; returns the removed value.
    pub async fn remove<K: 'static, V: 'static>(
        &self,
        id: &MappingId<K, V>,
        key: &K,
    ) -> ConcordResult<Option<V>> {
        let call = MappingCall::Remove {
            map_idx: self.index(id)?,
            key: id.encode_key(key)?,
        };
        self.call(call)
            .await?
            .map(|v| id.decode_value(&v))
            .transpose()
    }

    /// Apply several changes at once; a `None` value deletes its key.
    pub async fn sync<K: 'static, V: 'static>(
        &self,
        id: &MappingId<K, V>,
        changes: &[(K, Option<V>)],
    ) -> ConcordResult<()> {
        let mut keys = Vec::with_capacity(changes.len());
        let mut values = Vec::with_capacity(changes.len());
        for (key, value) in changes {
            keys.push(id.encode_key(key)?);
            values.push(value.as_ref().map(|v| id.encode_value(v)).transpose()?);
        }
        let call = MappingCall::Sync {
            map_idx: self.index(id)?,
            keys,
            values,
        };
        self.call(call).await.map(|_| ())
    }

    /// Run the named value action against `key` where the mapping lives.
    pub async fn with_value<K, V, A, R>(
        &self,
        id: &MappingId<K, V>,
        key: &K,
        action: &str,
        args: &A,
    ) -> ConcordResult<R>
    where
        K: 'static,
        V: 'static,
        A: Serialize,
        R: DeserializeOwned,
    {
        let call = MappingCall::WithValue {
            map_idx: self.index(id)?,
            key: id.encode_key(key)?,
            action: action.to_string(),
            args: bincode::serialize(args).map_err(|_| ConcordError::CodecError)?,
        };
        decode_answer(self.call(call).await?)
    }

    /// Run the named map action where the mapping lives.
    pub async fn with<K, V, A, R>(&self, id: &MappingId<K, V>, action: &str, args: &A) -> ConcordResult<R>
    where
        K: 'static,
        V: 'static,
        A: Serialize,
        R: DeserializeOwned,
    {
        let call = MappingCall::With {
            map_idx: self.index(id)?,
            action: action.to_string(),
            args: bincode::serialize(args).map_err(|_| ConcordError::CodecError)?,
        };
        decode_answer(self.call(call).await?)
    }

    /// Snapshot of a replicated mapping.
    pub async fn entries<K: 'static, V: 'static>(
        &self,
        id: &MappingId<K, V>,
    ) -> ConcordResult<Vec<(K, V)>> {
        let idx = self.index(id)?;
        let raw = self.request(|reply| ApiRequest::Entries(idx, reply)).await??;
        raw.iter()
            .map(|(k, v)| Ok((id.decode_key(k)?, id.decode_value(v)?)))
            .collect()
    }

    pub async fn add_listener<K, V, L>(&self, id: &MappingId<K, V>, listener: L) -> ConcordResult<()>
    where
        K: 'static,
        V: 'static,
        L: MappingListener<K, V> + 'static,
    {
        let idx = self.index(id)?;
        let raw = id.listener(listener);
        self.request(|reply| ApiRequest::AddListener(idx, raw, reply))
            .await?
    }

    /// Node currently mastering a remote mapping.
    pub async fn master_of<K: 'static, V: 'static>(
        &self,
        id: &MappingId<K, V>,
    ) -> ConcordResult<Option<String>> {
        let idx = self.index(id)?;
        self.request(|reply| ApiRequest::MasterOf(idx, reply)).await
    }

    // ─── Stale caches ───────────────────────────────────────────────────────

    /// Tell every other node that its copy of `cache` is out of date.
    pub async fn broadcast_stale_cache(&self, cache: &str, data: Vec<u8>) -> ConcordResult<()> {
        let cache = cache.to_string();
        self.request(|reply| ApiRequest::BroadcastStaleCache { cache, data, reply })
            .await?
    }

    /// Receive the stale-cache notices other nodes broadcast for `cache`.
    pub async fn add_stale_cache_observer(&self, cache: &str) -> ConcordResult<mpsc::Receiver<StaleCache>> {
        let (tx, rx) = mpsc::channel(DEFAULT_STALE_CACHE_CHANNEL_SIZE);
        self.tx
            .send(NodeCommand::Api(ApiRequest::AddStaleCacheObserver(
                cache.to_string(),
                tx,
            )))
            .await
            .map_err(|_| ConcordError::Shutdown)?;
        Ok(rx)
    }

    // ─── Node actions ───────────────────────────────────────────────────────

    /// Run a registered node action on `node`, which may be this node.
    pub async fn invoke_node_action<A, R>(&self, node: &str, action: &str, args: &A) -> ConcordResult<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let args = bincode::serialize(args).map_err(|_| ConcordError::CodecError)?;
        let node = node.to_string();
        let action = action.to_string();
        let answer = self
            .request(|reply| ApiRequest::InvokeAction {
                node,
                action,
                args,
                reply,
            })
            .await??;
        decode_answer(Some(answer))
    }

    /// Run a node action on this node and every subscribed peer accepted by
    /// `filter`, all at once. Each node's result is reported separately.
    pub async fn invoke_node_request<A, R, F>(
        &self,
        action: &str,
        args: &A,
        filter: F,
    ) -> ConcordResult<Vec<(String, ConcordResult<R>)>>
    where
        A: Serialize,
        R: DeserializeOwned,
        F: Fn(&str) -> bool,
    {
        let args = bincode::serialize(args).map_err(|_| ConcordError::CodecError)?;
        let mut targets = vec![self.node_name.clone()];
        targets.extend(
            self.peers()
                .await?
                .into_iter()
                .filter(|p| p.state == PeerState::Subscribed)
                .map(|p| p.node_name),
        );
        targets.retain(|name| filter(name.as_str()));
        debug!("node action {} goes to {} nodes", action, targets.len());

        let mut waiting = Vec::with_capacity(targets.len());
        for node in targets {
            let (tx, rx) = oneshot::channel();
            let req = ApiRequest::InvokeAction {
                node: node.clone(),
                action: action.to_string(),
                args: args.clone(),
                reply: tx,
            };
            self.tx
                .send(NodeCommand::Api(req))
                .await
                .map_err(|_| ConcordError::Shutdown)?;
            waiting.push((node, rx));
        }

        let mut results = Vec::with_capacity(waiting.len());
        for (node, rx) in waiting {
            let result = match rx.await {
                Ok(answer) => answer.and_then(|data| decode_answer(Some(data))),
                Err(_) => Err(ConcordError::Shutdown),
            };
            results.push((node, result));
        }
        Ok(results)
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────────

    pub async fn peers(&self) -> ConcordResult<Vec<PeerStatus>> {
        self.request(ApiRequest::Peers).await
    }

    /// Run a peer refresh now instead of waiting for the next interval.
    pub async fn refresh_now(&self) -> ConcordResult<()> {
        self.tx
            .send(NodeCommand::RefreshPeers)
            .await
            .map_err(|_| ConcordError::Shutdown)
    }

    /// Flush batched mappings, log off every peer, mark our record shut
    /// down and stop the node. Returns once the node has stopped.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(NodeCommand::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

fn decode_answer<R: DeserializeOwned>(answer: Option<Vec<u8>>) -> ConcordResult<R> {
    let data = answer.ok_or(ConcordError::CodecError)?;
    bincode::deserialize(&data).map_err(|_| ConcordError::CodecError)
}
