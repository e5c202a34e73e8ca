//! Cluster-wide lock arbitration.
//!
//! There is no lock server. A node that wants a lock publishes
//! `AcquiringLock` on its shared record and waits until every node
//! subscribed to that record has ratified the attempt; then it publishes
//! `LockAdded`. A node that sees an attempt ratifies it unless the lock is
//! already owned, or it is already tracking a contender with priority.
//! Releases work the same way with `ReleasingLock` / `LockRemoved`.
//!
//! While a lock is being resolved, a [`LockHandler`] keeps every caller
//! that is waiting on it. When a contender with priority shows up the
//! handler is cancelled and its waiters move to the handler tracking the
//! new contender, so each waiter is answered exactly once, with the
//! eventual winner.
//!
//! The arbitrator does no I/O. Every operation appends [`LockAction`]s
//! that the node runtime drains with [`LockArbitrator::take_actions`] and
//! carries out.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::mem;
use std::time::{Duration, Instant};

use concord_proto::error::{ConcordError, ConcordResult};
use concord_proto::lock::Lock;
use concord_proto::message::NodeEvent;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Owner of a lock once it settles; `None` if it ended up free.
pub type LockReply = ConcordResult<Option<String>>;
pub type LockWaiter = oneshot::Sender<LockReply>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Free,
    Acquiring(String),
    Held(String),
    Releasing(String),
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockState::Free => f.write_str("free"),
            LockState::Acquiring(n) => write!(f, "acquiring by {}", n),
            LockState::Held(n) => write!(f, "held by {}", n),
            LockState::Releasing(n) => write!(f, "releasing by {}", n),
        }
    }
}

/// Side effects requested by the arbitrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAction {
    /// Publish an event on our shared record.
    Publish(NodeEvent),
    /// Tell `peer` it may proceed.
    Ratify { peer: String, lock: Lock, acquire: bool },
    /// Call [`LockArbitrator::timeout`] after the lock timeout.
    ScheduleTimeout { lock: Lock, generation: u64 },
    /// We lost a lock we held without releasing it.
    Dropped(Lock),
}

/// Decides between two contenders for the same lock.
pub trait PriorityRule: Send {
    /// Whether `a` takes precedence over `b`.
    fn has_priority(&self, a: &str, b: &str) -> bool;
}

/// The lexicographically lower node name wins.
#[derive(Debug, Default, Clone, Copy)]
pub struct NameOrder;

impl PriorityRule for NameOrder {
    fn has_priority(&self, a: &str, b: &str) -> bool {
        a < b
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LockStats {
    pub acquired: u64,
    /// Total time spent waiting for ratifications (ms).
    pub acquire_wait_ms: u64,
    pub released: u64,
    pub hijacked: u64,
    pub timeouts: u64,
}

/// A caller waiting on a lock that is being resolved.
#[derive(Debug)]
enum Pending {
    /// Wants to know the outcome.
    Outcome(LockWaiter),
    /// Wants to acquire once the lock settles.
    Acquire(LockWaiter),
    /// Wants to release once the lock settles.
    Release(LockWaiter),
}

/// In-flight resolution of one lock.
#[derive(Debug)]
struct LockHandler {
    /// Node whose acquire or release is being resolved.
    node: String,
    acquire: bool,
    /// Subscribers that still have to ratify. Only our own attempts have
    /// ratifiers.
    ratifiers: Option<BTreeSet<String>>,
    pending: Vec<Pending>,
    generation: u64,
    started: Instant,
}

impl LockHandler {
    fn is_local(&self) -> bool {
        self.ratifiers.is_some()
    }

    /// Stop resolving and hand back the waiters. Calling it again yields
    /// nothing.
    fn cancel(&mut self) -> Vec<Pending> {
        mem::take(&mut self.pending)
    }
}

pub struct LockArbitrator {
    node_name: String,
    held: BTreeSet<Lock>,
    peer_locks: BTreeMap<String, BTreeSet<Lock>>,
    handlers: BTreeMap<Lock, LockHandler>,
    /// Nodes subscribed to our shared record; each must ratify our attempts.
    subscribers: BTreeSet<String>,
    priority: Box<dyn PriorityRule>,
    next_generation: u64,
    stats: LockStats,
    actions: Vec<LockAction>,
}

impl LockArbitrator {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            held: BTreeSet::new(),
            peer_locks: BTreeMap::new(),
            handlers: BTreeMap::new(),
            subscribers: BTreeSet::new(),
            priority: Box::new(NameOrder),
            next_generation: 0,
            stats: LockStats::default(),
            actions: Vec::new(),
        }
    }

    pub fn set_priority(&mut self, rule: Box<dyn PriorityRule>) {
        self.priority = rule;
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Locks this node holds.
    pub fn held(&self) -> &BTreeSet<Lock> {
        &self.held
    }

    pub fn stats(&self) -> LockStats {
        self.stats
    }

    pub fn take_actions(&mut self) -> Vec<LockAction> {
        mem::take(&mut self.actions)
    }

    /// Current owner as far as this node knows, ignoring resolutions in flight.
    pub fn owner(&self, lock: &Lock) -> Option<&str> {
        if self.held.contains(lock) {
            return Some(&self.node_name);
        }
        self.peer_locks
            .iter()
            .find(|(_, locks)| locks.contains(lock))
            .map(|(node, _)| node.as_str())
    }

    pub fn state(&self, lock: &Lock) -> LockState {
        match self.handlers.get(lock) {
            Some(h) if h.acquire => LockState::Acquiring(h.node.clone()),
            Some(h) => LockState::Releasing(h.node.clone()),
            None => match self.owner(lock) {
                Some(owner) => LockState::Held(owner.to_string()),
                None => LockState::Free,
            },
        }
    }

    // -----------------------------------------------------------------------
    // Local requests
    // -----------------------------------------------------------------------

    /// Answer with the owner once any resolution in flight settles.
    pub fn query(&mut self, lock: Lock, waiter: LockWaiter) {
        if let Some(handler) = self.handlers.get_mut(&lock) {
            handler.pending.push(Pending::Outcome(waiter));
            return;
        }
        let _ = waiter.send(Ok(self.owner(&lock).map(str::to_string)));
    }

    /// Try to take `lock`. The waiter learns the resulting owner, which is
    /// this node on success.
    pub fn acquire(&mut self, lock: Lock, waiter: LockWaiter) {
        if let Some(handler) = self.handlers.get_mut(&lock) {
            handler.pending.push(Pending::Acquire(waiter));
            return;
        }
        if let Some(owner) = self.owner(&lock) {
            debug!("lock {} already held by {}", lock, owner);
            let _ = waiter.send(Ok(Some(owner.to_string())));
            return;
        }
        if self.subscribers.is_empty() {
            self.lock_acquired(lock, Duration::ZERO);
            let _ = waiter.send(Ok(Some(self.node_name.clone())));
            return;
        }
        debug!("acquiring lock {}", lock);
        self.actions
            .push(LockAction::Publish(NodeEvent::AcquiringLock(lock.clone())));
        self.start_local(lock, true, waiter);
    }

    /// Give up `lock`. The waiter learns the resulting owner, `None` on
    /// success.
    pub fn release(&mut self, lock: Lock, waiter: LockWaiter) {
        if let Some(handler) = self.handlers.get_mut(&lock) {
            handler.pending.push(Pending::Release(waiter));
            return;
        }
        if !self.held.contains(&lock) {
            let owner = self.owner(&lock).map(str::to_string);
            warn!("cannot release lock {}: held by {:?}", lock, owner);
            let _ = waiter.send(Ok(owner));
            return;
        }
        if self.subscribers.is_empty() {
            self.lock_released(lock);
            let _ = waiter.send(Ok(None));
            return;
        }
        debug!("releasing lock {}", lock);
        self.actions
            .push(LockAction::Publish(NodeEvent::ReleasingLock(lock.clone())));
        self.start_local(lock, false, waiter);
    }

    /// Abandon a release in progress and keep the lock.
    pub fn reacquire(&mut self, lock: Lock) -> bool {
        let releasing = matches!(
            self.handlers.get(&lock),
            Some(h) if h.is_local() && !h.acquire
        );
        if !releasing {
            warn!("no release of lock {} in progress to cancel", lock);
            return false;
        }
        let pending = self.take_handler(&lock);
        self.actions
            .push(LockAction::Publish(NodeEvent::LockUpdated(lock.clone())));
        let owner = Some(self.node_name.clone());
        self.resolve(&lock, owner, pending);
        true
    }

    /// A subscriber agreed to our acquire or release.
    pub fn ratify(&mut self, from: &str, lock: &Lock, acquire: bool) {
        let Some(handler) = self.handlers.get_mut(lock) else {
            debug!("ignoring ratification of {} from {}: nothing pending", lock, from);
            return;
        };
        if handler.acquire != acquire {
            debug!("ignoring stale ratification of {} from {}", lock, from);
            return;
        }
        match handler.ratifiers.as_mut() {
            Some(ratifiers) => {
                if !ratifiers.remove(from) {
                    debug!("unexpected ratification of {} from {}", lock, from);
                }
            }
            // Resolving for a peer; our own attempt was preempted.
            None => return,
        }
        self.maybe_activate(lock);
    }

    /// The lock timer for `generation` fired.
    pub fn timeout(&mut self, lock: &Lock, generation: u64) {
        let ratifiers = match self.handlers.get(lock) {
            Some(h) if h.generation == generation && h.is_local() => h.ratifiers.clone(),
            _ => return,
        };
        warn!(
            "lock {}: no ratification from {:?}, acting anyway",
            lock,
            ratifiers.unwrap_or_default()
        );
        self.stats.timeouts += 1;
        self.activate(lock);
    }

    // -----------------------------------------------------------------------
    // Subscribers
    // -----------------------------------------------------------------------

    pub fn subscriber_added(&mut self, node: &str) {
        self.subscribers.insert(node.to_string());
    }

    /// A subscriber that goes away can no longer object, which counts as
    /// ratification.
    pub fn subscriber_removed(&mut self, node: &str) {
        self.subscribers.remove(node);
        let waiting: Vec<Lock> = self
            .handlers
            .iter_mut()
            .filter_map(|(lock, h)| match h.ratifiers.as_mut() {
                Some(r) => r.remove(node).then(|| lock.clone()),
                None => None,
            })
            .collect();
        for lock in waiting {
            self.maybe_activate(&lock);
        }
    }

    // -----------------------------------------------------------------------
    // Peer events
    // -----------------------------------------------------------------------

    /// `peer` announced an attempt to acquire `lock`.
    pub fn peer_acquiring(&mut self, peer: &str, lock: Lock) {
        if let Some(owner) = self.owner(&lock) {
            warn!(
                "refusing to ratify {} acquiring {}: held by {}",
                peer, lock, owner
            );
            return;
        }

        let incumbent = self.handlers.get(&lock).map(|h| h.node.clone());
        let pending = match incumbent {
            None => Vec::new(),
            Some(node) if node == peer => {
                debug!("duplicate acquire of {} by {}", lock, peer);
                return;
            }
            Some(node) if self.priority.has_priority(&node, peer) => {
                debug!("deferring {} on {}: {} has priority", peer, lock, node);
                return;
            }
            Some(node) => {
                info!("{} preempts {} on lock {}", peer, node, lock);
                self.take_handler(&lock)
            }
        };
        self.track_peer(peer, lock, true, pending);
    }

    /// `peer` announced an attempt to release `lock`.
    pub fn peer_releasing(&mut self, peer: &str, lock: Lock) {
        if self.owner(&lock) != Some(peer) {
            warn!("{} releasing lock {} it does not hold", peer, lock);
            return;
        }
        if let Some(h) = self.handlers.get(&lock) {
            warn!(
                "{} releasing lock {} while resolving for {}",
                peer, lock, h.node
            );
            return;
        }
        self.track_peer(peer, lock, false, Vec::new());
    }

    /// `peer` now holds `lock`.
    pub fn peer_added_lock(&mut self, peer: &str, lock: Lock) {
        self.peer_locks
            .entry(peer.to_string())
            .or_default()
            .insert(lock.clone());

        if self.held.remove(&lock) {
            warn!("lock {} hijacked by {}", lock, peer);
            self.stats.hijacked += 1;
            self.actions
                .push(LockAction::Publish(NodeEvent::LockRemoved(lock.clone())));
            self.actions.push(LockAction::Dropped(lock.clone()));
        }

        if let Some(h) = self.handlers.get(&lock) {
            if !(h.acquire && h.node == peer) {
                warn!(
                    "lock {} taken by {} while resolving for {}",
                    lock, peer, h.node
                );
            }
            let pending = self.take_handler(&lock);
            self.resolve(&lock, Some(peer.to_string()), pending);
        }
    }

    /// `peer` kept `lock` after starting to release it.
    pub fn peer_updated_lock(&mut self, peer: &str, lock: Lock) {
        match self.handlers.get(&lock) {
            Some(h) if h.node == peer && !h.acquire => {
                let pending = self.take_handler(&lock);
                self.resolve(&lock, Some(peer.to_string()), pending);
            }
            Some(h) => warn!(
                "{} updated lock {} while resolving for {}",
                peer, lock, h.node
            ),
            None => {}
        }
    }

    /// `peer` no longer holds `lock`.
    pub fn peer_removed_lock(&mut self, peer: &str, lock: Lock) {
        if let Some(locks) = self.peer_locks.get_mut(peer) {
            locks.remove(&lock);
        }
        match self.handlers.get(&lock) {
            Some(h) if h.node == peer => {
                let pending = self.take_handler(&lock);
                self.resolve(&lock, None, pending);
            }
            Some(h) => debug!(
                "{} dropped lock {} while resolving for {}",
                peer, lock, h.node
            ),
            None => {}
        }
    }

    /// Subscription to `peer` established; `locks` is what it holds.
    pub fn peer_subscribed(&mut self, peer: &str, locks: BTreeSet<Lock>) {
        self.peer_locks.insert(peer.to_string(), BTreeSet::new());
        for lock in locks {
            self.peer_added_lock(peer, lock);
        }
    }

    /// Link to `peer` lost. Its locks are forgotten, and resolutions that
    /// were waiting on it fail.
    pub fn peer_disconnected(&mut self, peer: &str) {
        for lock in self.peer_locks.remove(peer).unwrap_or_default() {
            let releasing = matches!(self.handlers.get(&lock), Some(h) if h.node == peer);
            if releasing {
                let pending = self.take_handler(&lock);
                self.resolve(&lock, None, pending);
            }
        }

        let orphaned: Vec<Lock> = self
            .handlers
            .iter()
            .filter(|(_, h)| h.node == peer)
            .map(|(lock, _)| lock.clone())
            .collect();
        for lock in orphaned {
            info!("lock {}: contender {} went away", lock, peer);
            let pending = self.take_handler(&lock);
            Self::fail(pending, ConcordError::PeerUnavailable);
        }
    }

    /// Fail every waiter; the node is going away.
    pub fn shutdown(&mut self) {
        let locks: Vec<Lock> = self.handlers.keys().cloned().collect();
        for lock in locks {
            let pending = self.take_handler(&lock);
            Self::fail(pending, ConcordError::Shutdown);
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn start_local(&mut self, lock: Lock, acquire: bool, waiter: LockWaiter) {
        let generation = self.generation();
        let handler = LockHandler {
            node: self.node_name.clone(),
            acquire,
            ratifiers: Some(self.subscribers.clone()),
            pending: vec![Pending::Outcome(waiter)],
            generation,
            started: Instant::now(),
        };
        self.handlers.insert(lock.clone(), handler);
        self.actions
            .push(LockAction::ScheduleTimeout { lock, generation });
    }

    fn track_peer(&mut self, peer: &str, lock: Lock, acquire: bool, pending: Vec<Pending>) {
        let generation = self.generation();
        let handler = LockHandler {
            node: peer.to_string(),
            acquire,
            ratifiers: None,
            pending,
            generation,
            started: Instant::now(),
        };
        self.handlers.insert(lock.clone(), handler);
        self.actions.push(LockAction::Ratify {
            peer: peer.to_string(),
            lock,
            acquire,
        });
    }

    fn take_handler(&mut self, lock: &Lock) -> Vec<Pending> {
        match self.handlers.remove(lock) {
            Some(mut handler) => handler.cancel(),
            None => Vec::new(),
        }
    }

    fn maybe_activate(&mut self, lock: &Lock) {
        let ready = self
            .handlers
            .get(lock)
            .and_then(|h| h.ratifiers.as_ref())
            .map_or(false, BTreeSet::is_empty);
        if ready {
            self.activate(lock);
        }
    }

    /// Complete our own attempt on `lock`.
    fn activate(&mut self, lock: &Lock) {
        let Some(mut handler) = self.handlers.remove(lock) else {
            return;
        };
        let pending = handler.cancel();
        if handler.acquire {
            self.lock_acquired(lock.clone(), handler.started.elapsed());
            let owner = Some(self.node_name.clone());
            self.resolve(lock, owner, pending);
        } else {
            self.lock_released(lock.clone());
            self.resolve(lock, None, pending);
        }
    }

    fn lock_acquired(&mut self, lock: Lock, waited: Duration) {
        info!("acquired lock {}", lock);
        self.stats.acquired += 1;
        self.stats.acquire_wait_ms += waited.as_millis() as u64;
        self.held.insert(lock.clone());
        self.actions
            .push(LockAction::Publish(NodeEvent::LockAdded(lock)));
    }

    fn lock_released(&mut self, lock: Lock) {
        info!("released lock {}", lock);
        self.stats.released += 1;
        self.held.remove(&lock);
        self.actions
            .push(LockAction::Publish(NodeEvent::LockRemoved(lock)));
    }

    /// Answer everyone queued on a settled lock.
    fn resolve(&mut self, lock: &Lock, owner: Option<String>, pending: Vec<Pending>) {
        for p in pending {
            match p {
                Pending::Outcome(w) => {
                    let _ = w.send(Ok(owner.clone()));
                }
                Pending::Acquire(w) if owner.is_none() => self.acquire(lock.clone(), w),
                Pending::Release(w) if owner.as_deref() == Some(self.node_name.as_str()) => {
                    self.release(lock.clone(), w)
                }
                Pending::Acquire(w) | Pending::Release(w) => {
                    let _ = w.send(Ok(owner.clone()));
                }
            }
        }
    }

    fn fail(pending: Vec<Pending>, err: ConcordError) {
        for p in pending {
            let (Pending::Outcome(w) | Pending::Acquire(w) | Pending::Release(w)) = p;
            let _ = w.send(Err(err));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use std::collections::VecDeque;
    use tokio::sync::oneshot::error::TryRecvError;

    fn lobby() -> Lock {
        Lock::new("ChatChannel", "lobby-3")
    }

    fn waiter() -> (LockWaiter, oneshot::Receiver<LockReply>) {
        oneshot::channel()
    }

    enum Wire {
        Event(NodeEvent),
        Ratify { lock: Lock, acquire: bool },
    }

    /// Arbitrators joined by per-direction FIFO links, delivered in a
    /// seeded random interleaving.
    struct Bus {
        nodes: BTreeMap<String, LockArbitrator>,
        links: BTreeMap<(String, String), VecDeque<Wire>>,
        dropped: Vec<(String, Lock)>,
        rng: StdRng,
    }

    impl Bus {
        fn new(names: &[&str], seed: u64) -> Self {
            let mut nodes = BTreeMap::new();
            for name in names {
                let mut arb = LockArbitrator::new(*name);
                for other in names.iter().filter(|o| *o != name) {
                    arb.subscriber_added(other);
                    arb.peer_subscribed(other, BTreeSet::new());
                }
                nodes.insert(name.to_string(), arb);
            }
            Self {
                nodes,
                links: BTreeMap::new(),
                dropped: Vec::new(),
                rng: StdRng::seed_from_u64(seed),
            }
        }

        fn node(&mut self, name: &str) -> &mut LockArbitrator {
            self.nodes.get_mut(name).unwrap()
        }

        fn flush(&mut self, from: &str) {
            let actions = self.node(from).take_actions();
            let others: Vec<String> = self.nodes.keys().filter(|n| *n != from).cloned().collect();
            for action in actions {
                match action {
                    LockAction::Publish(event) => {
                        for to in &others {
                            self.links
                                .entry((from.to_string(), to.clone()))
                                .or_default()
                                .push_back(Wire::Event(event.clone()));
                        }
                    }
                    LockAction::Ratify { peer, lock, acquire } => {
                        self.links
                            .entry((from.to_string(), peer))
                            .or_default()
                            .push_back(Wire::Ratify { lock, acquire });
                    }
                    LockAction::ScheduleTimeout { .. } => {}
                    LockAction::Dropped(lock) => self.dropped.push((from.to_string(), lock)),
                }
            }
        }

        fn run(&mut self) {
            loop {
                let busy: Vec<(String, String)> = self
                    .links
                    .iter()
                    .filter(|(_, q)| !q.is_empty())
                    .map(|(k, _)| k.clone())
                    .collect();
                let Some((from, to)) = busy.choose(&mut self.rng).cloned() else {
                    return;
                };
                let wire = self.links.get_mut(&(from.clone(), to.clone())).unwrap().pop_front().unwrap();
                let node = self.node(&to);
                match wire {
                    Wire::Ratify { lock, acquire } => node.ratify(&from, &lock, acquire),
                    Wire::Event(NodeEvent::AcquiringLock(l)) => node.peer_acquiring(&from, l),
                    Wire::Event(NodeEvent::ReleasingLock(l)) => node.peer_releasing(&from, l),
                    Wire::Event(NodeEvent::LockAdded(l)) => node.peer_added_lock(&from, l),
                    Wire::Event(NodeEvent::LockUpdated(l)) => node.peer_updated_lock(&from, l),
                    Wire::Event(NodeEvent::LockRemoved(l)) => node.peer_removed_lock(&from, l),
                    Wire::Event(NodeEvent::CacheData { .. }) => {}
                }
                self.flush(&to);
            }
        }
    }

    #[test]
    fn test_mutual_exclusion_lowest_name_wins() {
        let names = ["delta", "alpha", "echo", "charlie", "bravo"];
        for n in 2..=names.len() {
            for seed in 0..40u64 {
                let mut contenders: Vec<&str> = names[..n].to_vec();
                let mut bus = Bus::new(&contenders, seed);
                contenders.shuffle(&mut bus.rng);
                let winner = *contenders.iter().min().unwrap();

                let mut receivers = Vec::new();
                for name in &contenders {
                    let (tx, rx) = waiter();
                    bus.node(name).acquire(lobby(), tx);
                    receivers.push(rx);
                    bus.flush(name);
                }
                bus.run();

                let holders: Vec<&String> = bus
                    .nodes
                    .iter()
                    .filter(|(_, a)| a.held().contains(&lobby()))
                    .map(|(n, _)| n)
                    .collect();
                assert_eq!(holders, vec![winner], "n={} seed={}", n, seed);
                for (name, arb) in &bus.nodes {
                    assert_eq!(
                        arb.state(&lobby()),
                        LockState::Held(winner.to_string()),
                        "{} n={} seed={}",
                        name,
                        n,
                        seed
                    );
                }
                for mut rx in receivers {
                    assert_eq!(rx.try_recv().unwrap(), Ok(Some(winner.to_string())));
                }
                assert!(bus.dropped.is_empty());
            }
        }
    }

    #[test]
    fn test_staggered_acquire_goes_to_first_settled() {
        let mut bus = Bus::new(&["alpha", "bravo"], 1);
        let (tx, mut rx) = waiter();
        bus.node("bravo").acquire(lobby(), tx);
        bus.flush("bravo");
        bus.run();
        assert_eq!(rx.try_recv().unwrap(), Ok(Some("bravo".to_string())));

        // A later attempt by a higher-priority node finds the lock owned.
        let (tx, mut rx) = waiter();
        bus.node("alpha").acquire(lobby(), tx);
        assert_eq!(rx.try_recv().unwrap(), Ok(Some("bravo".to_string())));
        assert!(bus.node("alpha").take_actions().is_empty());
    }

    #[test]
    fn test_release_then_reacquire_elsewhere() {
        let mut bus = Bus::new(&["alpha", "bravo", "charlie"], 7);
        let (tx, mut rx) = waiter();
        bus.node("charlie").acquire(lobby(), tx);
        bus.flush("charlie");
        bus.run();
        assert_eq!(rx.try_recv().unwrap(), Ok(Some("charlie".to_string())));

        let (tx, mut rx) = waiter();
        bus.node("charlie").release(lobby(), tx);
        assert_eq!(bus.node("alpha").state(&lobby()), LockState::Held("charlie".into()));
        bus.flush("charlie");
        bus.run();
        assert_eq!(rx.try_recv().unwrap(), Ok(None));
        for arb in bus.nodes.values() {
            assert_eq!(arb.state(&lobby()), LockState::Free);
        }

        let (tx, mut rx) = waiter();
        bus.node("bravo").acquire(lobby(), tx);
        bus.flush("bravo");
        bus.run();
        assert_eq!(rx.try_recv().unwrap(), Ok(Some("bravo".to_string())));
        assert_eq!(bus.node("charlie").stats().released, 1);
    }

    #[test]
    fn test_preempted_callbacks_run_exactly_once() {
        let mut bravo = LockArbitrator::new("bravo");
        bravo.subscriber_added("alpha");
        bravo.peer_subscribed("alpha", BTreeSet::new());

        let (own_tx, mut own_rx) = waiter();
        let (again_tx, mut again_rx) = waiter();
        let (query_tx, mut query_rx) = waiter();
        bravo.acquire(lobby(), own_tx);
        bravo.acquire(lobby(), again_tx);
        bravo.query(lobby(), query_tx);
        assert_eq!(bravo.state(&lobby()), LockState::Acquiring("bravo".into()));
        bravo.take_actions();

        bravo.peer_acquiring("alpha", lobby());
        assert_eq!(bravo.state(&lobby()), LockState::Acquiring("alpha".into()));
        assert_eq!(
            bravo.take_actions(),
            vec![LockAction::Ratify {
                peer: "alpha".into(),
                lock: lobby(),
                acquire: true
            }]
        );
        assert_eq!(own_rx.try_recv(), Err(TryRecvError::Empty));

        // A late ratification for the cancelled attempt changes nothing.
        bravo.ratify("alpha", &lobby(), true);
        assert!(bravo.held().is_empty());

        bravo.peer_added_lock("alpha", lobby());
        for rx in [&mut own_rx, &mut again_rx, &mut query_rx] {
            assert_eq!(rx.try_recv().unwrap(), Ok(Some("alpha".to_string())));
            assert_eq!(rx.try_recv(), Err(TryRecvError::Closed));
        }
        assert!(bravo.take_actions().is_empty());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let (tx, _rx) = waiter();
        let mut handler = LockHandler {
            node: "alpha".into(),
            acquire: true,
            ratifiers: None,
            pending: vec![Pending::Outcome(tx)],
            generation: 1,
            started: Instant::now(),
        };
        assert_eq!(handler.cancel().len(), 1);
        assert!(handler.cancel().is_empty());
        assert!(handler.pending.is_empty());
    }

    #[test]
    fn test_acquire_without_subscribers_is_immediate() {
        let mut arb = LockArbitrator::new("alpha");
        let (tx, mut rx) = waiter();
        arb.acquire(lobby(), tx);
        assert_eq!(rx.try_recv().unwrap(), Ok(Some("alpha".to_string())));
        assert_eq!(
            arb.take_actions(),
            vec![LockAction::Publish(NodeEvent::LockAdded(lobby()))]
        );
        assert_eq!(arb.stats().acquired, 1);
    }

    #[test]
    fn test_acquiring_held_lock_is_refused() {
        let mut arb = LockArbitrator::new("bravo");
        let (tx, _rx) = waiter();
        arb.acquire(lobby(), tx);
        arb.subscriber_added("alpha");
        arb.take_actions();

        arb.peer_acquiring("alpha", lobby());
        assert!(arb.take_actions().is_empty());
        assert_eq!(arb.state(&lobby()), LockState::Held("bravo".into()));
    }

    #[test]
    fn test_timeout_acts_anyway() {
        let mut arb = LockArbitrator::new("alpha");
        arb.subscriber_added("bravo");
        let (tx, mut rx) = waiter();
        arb.acquire(lobby(), tx);
        let generation = match arb.take_actions().as_slice() {
            [LockAction::Publish(NodeEvent::AcquiringLock(_)), LockAction::ScheduleTimeout { generation, .. }] => *generation,
            other => panic!("unexpected actions {:?}", other),
        };

        arb.timeout(&lobby(), generation + 1);
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

        arb.timeout(&lobby(), generation);
        assert_eq!(rx.try_recv().unwrap(), Ok(Some("alpha".to_string())));
        assert_eq!(arb.stats().timeouts, 1);
        assert!(arb.held().contains(&lobby()));
    }

    #[test]
    fn test_departed_subscriber_counts_as_ratified() {
        let mut arb = LockArbitrator::new("alpha");
        arb.subscriber_added("bravo");
        arb.subscriber_added("charlie");
        let (tx, mut rx) = waiter();
        arb.acquire(lobby(), tx);

        arb.ratify("bravo", &lobby(), true);
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
        arb.subscriber_removed("charlie");
        assert_eq!(rx.try_recv().unwrap(), Ok(Some("alpha".to_string())));
    }

    #[test]
    fn test_disconnect_fails_out_waiters() {
        let mut arb = LockArbitrator::new("bravo");
        arb.subscriber_added("alpha");
        let (tx, mut rx) = waiter();
        arb.acquire(lobby(), tx);
        arb.peer_acquiring("alpha", lobby());

        arb.peer_disconnected("alpha");
        assert_eq!(rx.try_recv().unwrap(), Err(ConcordError::PeerUnavailable));
        assert_eq!(arb.state(&lobby()), LockState::Free);
    }

    #[test]
    fn test_disconnect_frees_peer_locks() {
        let mut arb = LockArbitrator::new("bravo");
        let mut held = BTreeSet::new();
        held.insert(lobby());
        arb.peer_subscribed("alpha", held);
        assert_eq!(arb.state(&lobby()), LockState::Held("alpha".into()));

        arb.peer_releasing("alpha", lobby());
        let (tx, mut rx) = waiter();
        arb.query(lobby(), tx);
        arb.peer_disconnected("alpha");
        assert_eq!(rx.try_recv().unwrap(), Ok(None));
        assert_eq!(arb.state(&lobby()), LockState::Free);
    }

    #[test]
    fn test_hijacked_lock_is_dropped() {
        let mut arb = LockArbitrator::new("bravo");
        let (tx, _rx) = waiter();
        arb.acquire(lobby(), tx);
        arb.take_actions();

        arb.peer_added_lock("alpha", lobby());
        assert_eq!(
            arb.take_actions(),
            vec![
                LockAction::Publish(NodeEvent::LockRemoved(lobby())),
                LockAction::Dropped(lobby())
            ]
        );
        assert_eq!(arb.stats().hijacked, 1);
        assert_eq!(arb.owner(&lobby()), Some("alpha"));
    }

    #[test]
    fn test_reacquire_cancels_release() {
        let mut arb = LockArbitrator::new("alpha");
        let (tx, _rx) = waiter();
        arb.acquire(lobby(), tx);
        arb.subscriber_added("bravo");

        let (tx, mut rx) = waiter();
        arb.release(lobby(), tx);
        assert_eq!(arb.state(&lobby()), LockState::Releasing("alpha".into()));
        arb.take_actions();

        assert!(arb.reacquire(lobby()));
        assert_eq!(rx.try_recv().unwrap(), Ok(Some("alpha".to_string())));
        assert_eq!(
            arb.take_actions(),
            vec![LockAction::Publish(NodeEvent::LockUpdated(lobby()))]
        );
        assert_eq!(arb.state(&lobby()), LockState::Held("alpha".into()));
        assert!(!arb.reacquire(lobby()));
    }

    #[test]
    fn test_queued_acquire_retries_after_release() {
        let mut arb = LockArbitrator::new("bravo");
        arb.subscriber_added("alpha");
        let mut held = BTreeSet::new();
        held.insert(lobby());
        arb.peer_subscribed("alpha", held);

        arb.peer_releasing("alpha", lobby());
        let (tx, mut rx) = waiter();
        arb.acquire(lobby(), tx);
        arb.take_actions();

        arb.peer_removed_lock("alpha", lobby());
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(
            arb.take_actions()[0],
            LockAction::Publish(NodeEvent::AcquiringLock(lobby()))
        );
        arb.ratify("alpha", &lobby(), true);
        assert_eq!(rx.try_recv().unwrap(), Ok(Some("bravo".to_string())));
    }

    #[test]
    fn test_custom_priority_rule() {
        struct Reverse;
        impl PriorityRule for Reverse {
            fn has_priority(&self, a: &str, b: &str) -> bool {
                a > b
            }
        }

        let mut arb = LockArbitrator::new("charlie");
        arb.set_priority(Box::new(Reverse));
        arb.peer_acquiring("alpha", lobby());
        arb.peer_acquiring("bravo", lobby());
        assert_eq!(arb.state(&lobby()), LockState::Acquiring("bravo".into()));
    }

    #[test]
    fn test_shutdown_fails_waiters() {
        let mut arb = LockArbitrator::new("alpha");
        arb.subscriber_added("bravo");
        let (tx, mut rx) = waiter();
        arb.acquire(lobby(), tx);
        arb.shutdown();
        assert_eq!(rx.try_recv().unwrap(), Err(ConcordError::Shutdown));
    }

    #[test]
    fn test_random_contention_never_double_grants() {
        let names = ["alpha", "bravo", "charlie", "delta"];
        let mut rng = StdRng::seed_from_u64(99);
        for round in 0..30u64 {
            let mut bus = Bus::new(&names, round);
            let mut contenders: Vec<&str> =
                names.iter().copied().filter(|_| rng.gen_bool(0.6)).collect();
            if contenders.is_empty() {
                contenders.push("delta");
            }
            for name in &contenders {
                let (tx, _rx) = waiter();
                bus.node(name).acquire(lobby(), tx);
                bus.flush(name);
            }
            bus.run();
            let holders = bus
                .nodes
                .values()
                .filter(|a| a.held().contains(&lobby()))
                .count();
            assert_eq!(holders, 1, "round {}", round);
        }
    }
}
