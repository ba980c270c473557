//! Object Replication
//!
//! Turns a key-addressed delegate object into a cluster-wide replica:
//! operations applied locally are broadcast to the membership as of
//! the call, and peer-originated operations are applied to the local
//! replica in per-sender receipt order. No global order across
//! senders is guaranteed; convergence relies on operations being
//! commutative at entry granularity plus last-writer-wins stamping.
//!
//! Latecomers start empty and converge lazily through subsequent
//! operations; there is no state-snapshot transfer on join (a node can
//! broadcast one explicitly via [`ReplicatedHandle::broadcast_snapshot`]).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::channel::{ChannelError, NodeId};
use crate::cluster::{ClusterView, Coordinator, CoordinatorListener};

mod protocol;

pub use protocol::{OpStamp, Operation, ReplicaMessage};

/// Error type for replication operations
#[derive(Debug)]
pub enum ReplicationError {
    /// A locally-owned replica is already registered under this key
    DuplicateKey(String),
    /// The handle was stopped; no further operations are accepted
    HandleStopped(String),
    /// The group channel refused the broadcast
    Channel(ChannelError),
}

impl fmt::Display for ReplicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicationError::DuplicateKey(key) => write!(f, "Duplicate replica key '{}'", key),
            ReplicationError::HandleStopped(key) => write!(f, "Replica handle '{}' stopped", key),
            ReplicationError::Channel(e) => write!(f, "Channel error: {}", e),
        }
    }
}

impl std::error::Error for ReplicationError {}

impl From<ChannelError> for ReplicationError {
    fn from(e: ChannelError) -> Self {
        ReplicationError::Channel(e)
    }
}

/// The local object kept in sync by a replica.
///
/// Implementations must tolerate redundant applies: operations are
/// delivered best-effort and filtered by stamp, not acknowledged.
pub trait ReplicaDelegate: Send + Sync {
    fn apply_put(&self, entry_key: &str, value: Bytes);
    fn apply_remove(&self, entry_key: &str);
    fn apply_clear(&self);
    fn apply_snapshot(&self, entries: Vec<(String, Bytes)>);
    fn snapshot(&self) -> Vec<(String, Bytes)>;
}

/// Stock in-memory delegate: an ordered map of entry key to bytes.
/// Also serves as the placeholder replica for keys first seen from a
/// peer announce.
#[derive(Default)]
pub struct MapReplica {
    entries: RwLock<BTreeMap<String, Bytes>>,
}

impl MapReplica {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, entry_key: &str) -> Option<Bytes> {
        self.entries.read().get(entry_key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl ReplicaDelegate for MapReplica {
    fn apply_put(&self, entry_key: &str, value: Bytes) {
        self.entries.write().insert(entry_key.to_string(), value);
    }

    fn apply_remove(&self, entry_key: &str) {
        self.entries.write().remove(entry_key);
    }

    fn apply_clear(&self) {
        self.entries.write().clear();
    }

    fn apply_snapshot(&self, entries: Vec<(String, Bytes)>) {
        let mut map = self.entries.write();
        map.clear();
        map.extend(entries);
    }

    fn snapshot(&self) -> Vec<(String, Bytes)> {
        self.entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

struct ReplicaState {
    key: String,
    delegate: RwLock<Arc<dyn ReplicaDelegate>>,
    locally_owned: AtomicBool,
    stopped: AtomicBool,
    expected_replicas: AtomicU32,
    /// Peers currently contributing a replica under this key
    contributors: Mutex<HashSet<String>>,
    /// Per-entry LWW stamps; the mutex also serializes delegate applies
    applied: Mutex<HashMap<String, OpStamp>>,
}

impl ReplicaState {
    fn new(key: &str, delegate: Arc<dyn ReplicaDelegate>, locally_owned: bool) -> Arc<Self> {
        Arc::new(Self {
            key: key.to_string(),
            delegate: RwLock::new(delegate),
            locally_owned: AtomicBool::new(locally_owned),
            stopped: AtomicBool::new(false),
            expected_replicas: AtomicU32::new(0),
            contributors: Mutex::new(HashSet::new()),
            applied: Mutex::new(HashMap::new()),
        })
    }

    fn delegate(&self) -> Arc<dyn ReplicaDelegate> {
        self.delegate.read().clone()
    }
}

/// A locally-owned replica registered under a cluster-unique key.
#[derive(Clone)]
pub struct ReplicatedHandle {
    state: Arc<ReplicaState>,
    replicator: Arc<Replicator>,
}

impl ReplicatedHandle {
    pub fn key(&self) -> &str {
        &self.state.key
    }

    pub fn is_stopped(&self) -> bool {
        self.state.stopped.load(Ordering::Acquire)
    }

    fn ensure_live(&self) -> Result<(), ReplicationError> {
        if self.is_stopped() {
            return Err(ReplicationError::HandleStopped(self.state.key.clone()));
        }
        Ok(())
    }

    /// Set an entry locally and broadcast the operation.
    pub async fn put(&self, entry_key: &str, value: Bytes) -> Result<(), ReplicationError> {
        self.ensure_live()?;
        let stamp = self.replicator.next_stamp();
        {
            let mut applied = self.state.applied.lock();
            self.state.delegate().apply_put(entry_key, value.clone());
            applied.insert(entry_key.to_string(), stamp.clone());
        }

        self.replicator
            .broadcast(ReplicaMessage::Apply {
                key: self.state.key.clone(),
                op: Operation::Put {
                    entry_key: entry_key.to_string(),
                    value: value.to_vec(),
                    stamp,
                },
                origin: self.replicator.local_node().as_str().to_string(),
            })
            .await
    }

    /// Delete an entry locally and broadcast the operation.
    pub async fn remove(&self, entry_key: &str) -> Result<(), ReplicationError> {
        self.ensure_live()?;
        let stamp = self.replicator.next_stamp();
        {
            let mut applied = self.state.applied.lock();
            self.state.delegate().apply_remove(entry_key);
            // The stamp stays behind as a tombstone so older puts lose
            applied.insert(entry_key.to_string(), stamp.clone());
        }

        self.replicator
            .broadcast(ReplicaMessage::Apply {
                key: self.state.key.clone(),
                op: Operation::Remove {
                    entry_key: entry_key.to_string(),
                    stamp,
                },
                origin: self.replicator.local_node().as_str().to_string(),
            })
            .await
    }

    /// Drop all entries locally and broadcast the operation.
    pub async fn clear(&self) -> Result<(), ReplicationError> {
        self.ensure_live()?;
        {
            let mut applied = self.state.applied.lock();
            self.state.delegate().apply_clear();
            applied.clear();
        }

        self.replicator
            .broadcast(ReplicaMessage::Apply {
                key: self.state.key.clone(),
                op: Operation::Clear,
                origin: self.replicator.local_node().as_str().to_string(),
            })
            .await
    }

    /// Broadcast the full local state as a snapshot record. Peers
    /// replace their replica content with it.
    pub async fn broadcast_snapshot(&self) -> Result<(), ReplicationError> {
        self.ensure_live()?;
        let stamp = self.replicator.next_stamp();
        let entries: Vec<(String, Vec<u8>)> = self
            .state
            .delegate()
            .snapshot()
            .into_iter()
            .map(|(k, v)| (k, v.to_vec()))
            .collect();

        self.replicator
            .broadcast(ReplicaMessage::Apply {
                key: self.state.key.clone(),
                op: Operation::Snapshot { entries, stamp },
                origin: self.replicator.local_node().as_str().to_string(),
            })
            .await
    }

    /// Forget an entry locally without broadcasting: removes both the
    /// value and its LWW stamp, so a later re-publish of the same key
    /// by any node is accepted. Used when an owner drops out of the
    /// view and its entries become garbage everywhere.
    pub fn forget_local(&self, entry_key: &str) {
        let mut applied = self.state.applied.lock();
        self.state.delegate().apply_remove(entry_key);
        applied.remove(entry_key);
    }
}

/// Replicates key-addressed delegates across the cluster.
pub struct Replicator {
    coordinator: Arc<Coordinator>,
    replicas: DashMap<String, Arc<ReplicaState>>,
    op_counter: AtomicU64,
}

impl Replicator {
    /// Create a replicator bound to a coordinator. Registers itself as
    /// a listener for inbound operations and membership changes.
    pub fn new(coordinator: Arc<Coordinator>) -> Arc<Self> {
        let replicator = Arc::new(Self {
            coordinator,
            replicas: DashMap::new(),
            op_counter: AtomicU64::new(0),
        });
        replicator
            .coordinator
            .add_listener(replicator.clone() as Arc<dyn CoordinatorListener>);
        replicator
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn local_node(&self) -> &NodeId {
        self.coordinator.local_node()
    }

    /// Register `delegate` under `key` and announce it to peers.
    ///
    /// If a peer-announced replica for the key already exists locally,
    /// the delegate adopts its accumulated state instead of creating a
    /// duplicate. A second locally-owned registration fails with
    /// `DuplicateKey`.
    pub async fn replicate(
        self: &Arc<Self>,
        key: &str,
        delegate: Arc<dyn ReplicaDelegate>,
        expected_replicas: u32,
    ) -> Result<ReplicatedHandle, ReplicationError> {
        let (state, created) = match self.replicas.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => {
                let state = occupied.get().clone();
                if state.locally_owned.swap(true, Ordering::AcqRel) {
                    return Err(ReplicationError::DuplicateKey(key.to_string()));
                }
                // Adopt what peers have already replicated to us
                {
                    let _applied = state.applied.lock();
                    delegate.apply_snapshot(state.delegate().snapshot());
                    *state.delegate.write() = delegate;
                }
                info!("Replica '{}': adopted peer-announced state", key);
                (state, false)
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let state = ReplicaState::new(key, delegate, true);
                vacant.insert(state.clone());
                (state, true)
            }
        };
        state
            .expected_replicas
            .store(expected_replicas, Ordering::Release);
        self.coordinator
            .metrics()
            .replicas_current
            .set(self.replicas.len() as i64);

        if let Err(e) = self
            .broadcast(ReplicaMessage::Announce {
                key: key.to_string(),
                expected_replicas,
                origin: self.local_node().as_str().to_string(),
            })
            .await
        {
            // Unwind so a retry of the same key is not DuplicateKey
            state.locally_owned.store(false, Ordering::Release);
            if created {
                self.replicas.remove(key);
            }
            self.coordinator
                .metrics()
                .replicas_current
                .set(self.replicas.len() as i64);
            return Err(e);
        }

        Ok(ReplicatedHandle {
            state,
            replicator: self.clone(),
        })
    }

    /// Deregister a handle and tell peers to purge this node's
    /// contribution. Idempotent: a second stop fails with
    /// `HandleStopped` and does not broadcast a second retract.
    pub async fn stop(&self, handle: &ReplicatedHandle) -> Result<(), ReplicationError> {
        let state = &handle.state;
        if state.stopped.swap(true, Ordering::AcqRel) {
            return Err(ReplicationError::HandleStopped(state.key.clone()));
        }
        state.locally_owned.store(false, Ordering::Release);
        self.replicas.remove(&state.key);
        self.coordinator
            .metrics()
            .replicas_current
            .set(self.replicas.len() as i64);
        info!("Replica '{}': stopped", state.key);

        self.broadcast(ReplicaMessage::Retract {
            key: state.key.clone(),
            origin: self.local_node().as_str().to_string(),
        })
        .await
    }

    /// Next LWW stamp for a local operation. Counters are bumped past
    /// every remote stamp seen, so a fresh local write always wins.
    fn next_stamp(&self) -> OpStamp {
        let counter = self.op_counter.fetch_add(1, Ordering::AcqRel) + 1;
        OpStamp::new(counter, self.local_node().as_str())
    }

    async fn broadcast(&self, msg: ReplicaMessage) -> Result<(), ReplicationError> {
        let encoded = msg
            .encode()
            .map_err(|e| ReplicationError::Channel(ChannelError::Codec(e.to_string())))?;
        self.coordinator.metrics().ops_broadcast_total.inc();
        self.coordinator
            .group_channel()
            .broadcast(Bytes::from(encoded))
            .await?;
        Ok(())
    }

    fn get_or_create_peer_replica(&self, key: &str) -> Arc<ReplicaState> {
        let state = self
            .replicas
            .entry(key.to_string())
            .or_insert_with(|| {
                debug!("Replica '{}': created from peer traffic", key);
                ReplicaState::new(key, Arc::new(MapReplica::new()), false)
            })
            .clone();
        self.coordinator
            .metrics()
            .replicas_current
            .set(self.replicas.len() as i64);
        state
    }

    /// Apply a peer-originated operation under the handle's lock,
    /// filtered by LWW stamp.
    fn apply_remote(&self, state: &ReplicaState, op: Operation) {
        let metrics = self.coordinator.metrics();
        let mut applied = state.applied.lock();

        match op {
            Operation::Put { entry_key, value, stamp } => {
                self.op_counter.fetch_max(stamp.counter, Ordering::AcqRel);
                if applied.get(&entry_key).map_or(true, |s| *s < stamp) {
                    state.delegate().apply_put(&entry_key, Bytes::from(value));
                    applied.insert(entry_key, stamp);
                    metrics.ops_applied_total.inc();
                } else {
                    metrics.ops_stale_total.inc();
                }
            }
            Operation::Remove { entry_key, stamp } => {
                self.op_counter.fetch_max(stamp.counter, Ordering::AcqRel);
                if applied.get(&entry_key).map_or(true, |s| *s < stamp) {
                    state.delegate().apply_remove(&entry_key);
                    applied.insert(entry_key, stamp);
                    metrics.ops_applied_total.inc();
                } else {
                    metrics.ops_stale_total.inc();
                }
            }
            Operation::Clear => {
                state.delegate().apply_clear();
                applied.clear();
                metrics.ops_applied_total.inc();
            }
            Operation::Snapshot { entries, stamp } => {
                self.op_counter.fetch_max(stamp.counter, Ordering::AcqRel);
                let converted: Vec<(String, Bytes)> = entries
                    .into_iter()
                    .map(|(k, v)| (k, Bytes::from(v)))
                    .collect();
                applied.clear();
                for (k, _) in &converted {
                    applied.insert(k.clone(), stamp.clone());
                }
                state.delegate().apply_snapshot(converted);
                metrics.ops_applied_total.inc();
            }
        }
    }
}

impl CoordinatorListener for Replicator {
    fn on_message(&self, from: &NodeId, payload: &Bytes) {
        let msg = match ReplicaMessage::decode(payload) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Undecodable frame from '{}': {}", from, e);
                return;
            }
        };

        match msg {
            ReplicaMessage::Announce { key, expected_replicas, origin } => {
                let state = self.get_or_create_peer_replica(&key);
                state
                    .expected_replicas
                    .store(expected_replicas, Ordering::Release);
                let contributing = {
                    let mut contributors = state.contributors.lock();
                    contributors.insert(origin.clone());
                    contributors.len()
                };
                debug!(
                    "Replica '{}': announce from '{}' ({} contributors, {} expected)",
                    key, origin, contributing, expected_replicas
                );
            }
            ReplicaMessage::Retract { key, origin } => {
                if let Some(state) = self.replicas.get(&key).map(|s| s.clone()) {
                    let orphaned = {
                        let mut contributors = state.contributors.lock();
                        contributors.remove(&origin);
                        contributors.is_empty()
                            && !state.locally_owned.load(Ordering::Acquire)
                    };
                    debug!("Replica '{}': retract from '{}'", key, origin);
                    if orphaned {
                        self.replicas.remove(&key);
                        self.coordinator
                            .metrics()
                            .replicas_current
                            .set(self.replicas.len() as i64);
                        debug!("Replica '{}': no contributors left, dropped", key);
                    }
                }
            }
            ReplicaMessage::Apply { key, op, origin } => {
                let state = self.get_or_create_peer_replica(&key);
                state.contributors.lock().insert(origin);
                self.apply_remote(&state, op);
            }
            // Point-to-point buffer transfer is the directory's concern
            ReplicaMessage::FetchRequest { .. } | ReplicaMessage::FetchResponse { .. } => {}
        }
    }

    fn on_view_changed(&self, view: &Arc<ClusterView>) {
        // A departed peer's in-flight operations are gone; just stop
        // routing for it.
        let mut orphaned = Vec::new();
        for entry in self.replicas.iter() {
            let state = entry.value();
            let mut contributors = state.contributors.lock();
            contributors.retain(|node| view.contains(&NodeId::new(node.clone())));
            if contributors.is_empty() && !state.locally_owned.load(Ordering::Acquire) {
                orphaned.push(entry.key().clone());
            }
        }
        for key in orphaned {
            warn!("Replica '{}': all contributors left the view, dropped", key);
            self.replicas.remove(&key);
        }
        self.coordinator
            .metrics()
            .replicas_current
            .set(self.replicas.len() as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::LocalNetwork;
    use crate::cluster::CoordinatorRegistry;
    use crate::metrics::Metrics;
    use std::time::Duration;
    use tokio::runtime::Handle;

    async fn replicator_on(network: &LocalNetwork, node: &str) -> Arc<Replicator> {
        let registry = CoordinatorRegistry::new(
            Arc::new(network.clone()),
            Handle::current(),
            Metrics::new(),
        )
        .with_probe_interval(Duration::from_secs(3600));
        let coordinator = registry.join("test", node).await.unwrap();
        Replicator::new(coordinator)
    }

    #[tokio::test]
    async fn duplicate_local_key_rejected() {
        let network = LocalNetwork::new();
        let replicator = replicator_on(&network, "a").await;

        let map = Arc::new(MapReplica::new());
        let _handle = replicator.replicate("cache", map.clone(), 1).await.unwrap();
        match replicator.replicate("cache", map, 1).await {
            Err(ReplicationError::DuplicateKey(key)) => assert_eq!(key, "cache"),
            other => panic!("expected DuplicateKey, got {:?}", other.map(|h| h.key().to_string())),
        }
    }

    #[tokio::test]
    async fn failed_announce_does_not_wedge_the_key() {
        let network = LocalNetwork::new();
        let registry = CoordinatorRegistry::new(
            Arc::new(network.clone()),
            Handle::current(),
            Metrics::new(),
        )
        .with_probe_interval(Duration::from_secs(3600));
        let coordinator = registry.join("test", "a").await.unwrap();
        let replicator = Replicator::new(coordinator.clone());

        // With the channel gone the announce broadcast fails
        coordinator.shutdown().await;
        let map = Arc::new(MapReplica::new());
        assert!(matches!(
            replicator.replicate("cache", map.clone(), 1).await,
            Err(ReplicationError::Channel(_))
        ));

        // The failed call left nothing behind; a retry sees the same
        // channel error, not DuplicateKey
        assert!(matches!(
            replicator.replicate("cache", map, 1).await,
            Err(ReplicationError::Channel(_))
        ));
    }

    #[tokio::test]
    async fn put_applies_locally() {
        let network = LocalNetwork::new();
        let replicator = replicator_on(&network, "a").await;

        let map = Arc::new(MapReplica::new());
        let handle = replicator.replicate("cache", map.clone(), 1).await.unwrap();
        handle.put("k1", Bytes::from_static(b"v1")).await.unwrap();

        assert_eq!(map.get("k1"), Some(Bytes::from_static(b"v1")));
        handle.remove("k1").await.unwrap();
        assert_eq!(map.get("k1"), None);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let network = LocalNetwork::new();
        let replicator = replicator_on(&network, "a").await;

        let handle = replicator
            .replicate("cache", Arc::new(MapReplica::new()), 1)
            .await
            .unwrap();

        replicator.stop(&handle).await.unwrap();
        assert!(handle.is_stopped());
        match replicator.stop(&handle).await {
            Err(ReplicationError::HandleStopped(key)) => assert_eq!(key, "cache"),
            other => panic!("expected HandleStopped, got {:?}", other),
        }

        // Operations after stop fail the same way
        assert!(matches!(
            handle.put("k", Bytes::new()).await,
            Err(ReplicationError::HandleStopped(_))
        ));
    }

    #[tokio::test]
    async fn stale_stamp_is_dropped() {
        let network = LocalNetwork::new();
        let replicator = replicator_on(&network, "a").await;

        let map = Arc::new(MapReplica::new());
        let _handle = replicator.replicate("cache", map.clone(), 1).await.unwrap();

        let fresh = ReplicaMessage::Apply {
            key: "cache".to_string(),
            op: Operation::Put {
                entry_key: "k".to_string(),
                value: b"new".to_vec(),
                stamp: OpStamp::new(10, "b"),
            },
            origin: "b".to_string(),
        };
        replicator.on_message(&NodeId::new("b"), &Bytes::from(fresh.encode().unwrap()));
        assert_eq!(map.get("k"), Some(Bytes::from_static(b"new")));

        let stale = ReplicaMessage::Apply {
            key: "cache".to_string(),
            op: Operation::Put {
                entry_key: "k".to_string(),
                value: b"old".to_vec(),
                stamp: OpStamp::new(3, "c"),
            },
            origin: "c".to_string(),
        };
        replicator.on_message(&NodeId::new("c"), &Bytes::from(stale.encode().unwrap()));
        assert_eq!(map.get("k"), Some(Bytes::from_static(b"new")));
    }

    #[tokio::test]
    async fn local_write_beats_previously_seen_remote_stamp() {
        let network = LocalNetwork::new();
        let replicator = replicator_on(&network, "a").await;

        let map = Arc::new(MapReplica::new());
        let handle = replicator.replicate("cache", map.clone(), 1).await.unwrap();

        let remote = ReplicaMessage::Apply {
            key: "cache".to_string(),
            op: Operation::Put {
                entry_key: "k".to_string(),
                value: b"remote".to_vec(),
                stamp: OpStamp::new(100, "z"),
            },
            origin: "z".to_string(),
        };
        replicator.on_message(&NodeId::new("z"), &Bytes::from(remote.encode().unwrap()));

        // The local counter advanced past the remote stamp
        handle.put("k", Bytes::from_static(b"local")).await.unwrap();
        assert_eq!(map.get("k"), Some(Bytes::from_static(b"local")));
    }

    #[tokio::test]
    async fn replicate_adopts_peer_announced_state() {
        let network = LocalNetwork::new();
        let replicator = replicator_on(&network, "a").await;

        // Peer traffic arrives before the local replicate call
        let apply = ReplicaMessage::Apply {
            key: "cache".to_string(),
            op: Operation::Put {
                entry_key: "k".to_string(),
                value: b"from-peer".to_vec(),
                stamp: OpStamp::new(1, "b"),
            },
            origin: "b".to_string(),
        };
        replicator.on_message(&NodeId::new("b"), &Bytes::from(apply.encode().unwrap()));

        let map = Arc::new(MapReplica::new());
        let handle = replicator.replicate("cache", map.clone(), 2).await.unwrap();
        assert_eq!(handle.key(), "cache");
        assert_eq!(map.get("k"), Some(Bytes::from_static(b"from-peer")));
    }

    #[tokio::test]
    async fn forget_local_clears_stamp() {
        let network = LocalNetwork::new();
        let replicator = replicator_on(&network, "a").await;

        let map = Arc::new(MapReplica::new());
        let handle = replicator.replicate("cache", map.clone(), 1).await.unwrap();

        let remote = ReplicaMessage::Apply {
            key: "cache".to_string(),
            op: Operation::Put {
                entry_key: "k".to_string(),
                value: b"v".to_vec(),
                stamp: OpStamp::new(50, "z"),
            },
            origin: "z".to_string(),
        };
        replicator.on_message(&NodeId::new("z"), &Bytes::from(remote.encode().unwrap()));

        handle.forget_local("k");
        assert_eq!(map.get("k"), None);

        // A lower-counter write is accepted again after the forget
        let republish = ReplicaMessage::Apply {
            key: "cache".to_string(),
            op: Operation::Put {
                entry_key: "k".to_string(),
                value: b"v2".to_vec(),
                stamp: OpStamp::new(2, "b"),
            },
            origin: "b".to_string(),
        };
        replicator.on_message(&NodeId::new("b"), &Bytes::from(republish.encode().unwrap()));
        assert_eq!(map.get("k"), Some(Bytes::from_static(b"v2")));
    }
}
