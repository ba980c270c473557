//! Replicated Buffer Directory
//!
//! A cluster-wide catalog of published buffers. Each node publishes
//! buffer payloads into its local [`BufferStore`] and replicates a
//! small [`BufferReference`] (owner, size) for each; any node can then
//! resolve a buffer id to its owner and fetch the payload over the
//! group channel's point-to-point path. Payloads themselves are never
//! replicated, only fetched on demand.
//!
//! When an owner drops out of the cluster view, every surviving node
//! purges that owner's references locally, so lookups stop routing to
//! a dead node.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bincode::{Decode, Encode};
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::channel::{ChannelError, NodeId};
use crate::cluster::{ClusterView, CoordinatorListener};
use crate::config::DirectoryConfig;
use crate::replicator::{ReplicaDelegate, ReplicaMessage, ReplicatedHandle, ReplicationError, Replicator};

mod store;

pub use store::BufferStore;

/// Pause between the first failed fetch attempt and the re-resolve,
/// covering the race where ownership just migrated.
const FETCH_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Error type for directory operations
#[derive(Debug)]
pub enum DirectoryError {
    /// No live owner is advertising this buffer id
    NotFound(String),
    /// The owner is still in the directory but did not answer
    OwnerUnreachable(String),
    /// The underlying replicated handle refused the operation
    Replication(ReplicationError),
    /// Local payload storage failed
    Storage(String),
}

impl fmt::Display for DirectoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirectoryError::NotFound(id) => write!(f, "Buffer '{}' not found", id),
            DirectoryError::OwnerUnreachable(id) => {
                write!(f, "Owner of buffer '{}' unreachable", id)
            }
            DirectoryError::Replication(e) => write!(f, "Replication error: {}", e),
            DirectoryError::Storage(msg) => write!(f, "Storage error: {}", msg),
        }
    }
}

impl std::error::Error for DirectoryError {}

impl From<ReplicationError> for DirectoryError {
    fn from(e: ReplicationError) -> Self {
        DirectoryError::Replication(e)
    }
}

/// The replicated record for one published buffer: who owns it and
/// how big it is. The payload stays with the owner.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct BufferReference {
    pub owner: String,
    pub size: u64,
    pub published_at_ms: u64,
}

impl BufferReference {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::encode_to_vec(self, bincode::config::standard())
    }

    pub fn decode(data: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        bincode::decode_from_slice(data, bincode::config::standard()).map(|(r, _)| r)
    }
}

/// Replica delegate holding the decoded reference catalog.
#[derive(Default)]
pub struct DirectoryReplica {
    refs: DashMap<String, BufferReference>,
}

impl DirectoryReplica {
    fn get(&self, buffer_id: &str) -> Option<BufferReference> {
        self.refs.get(buffer_id).map(|r| r.clone())
    }

    fn owners(&self) -> Vec<(String, String)> {
        self.refs
            .iter()
            .map(|e| (e.key().clone(), e.value().owner.clone()))
            .collect()
    }

    fn len(&self) -> usize {
        self.refs.len()
    }
}

impl ReplicaDelegate for DirectoryReplica {
    fn apply_put(&self, entry_key: &str, value: Bytes) {
        match BufferReference::decode(&value) {
            Ok(reference) => {
                self.refs.insert(entry_key.to_string(), reference);
            }
            Err(e) => warn!("Buffer '{}': undecodable reference: {}", entry_key, e),
        }
    }

    fn apply_remove(&self, entry_key: &str) {
        self.refs.remove(entry_key);
    }

    fn apply_clear(&self) {
        self.refs.clear();
    }

    fn apply_snapshot(&self, entries: Vec<(String, Bytes)>) {
        self.refs.clear();
        for (key, value) in entries {
            self.apply_put(&key, value);
        }
    }

    fn snapshot(&self) -> Vec<(String, Bytes)> {
        self.refs
            .iter()
            .filter_map(|e| {
                e.value()
                    .encode()
                    .ok()
                    .map(|bytes| (e.key().clone(), Bytes::from(bytes)))
            })
            .collect()
    }
}

/// Cluster-wide buffer catalog bound to one coordinator.
pub struct BufferDirectory {
    replicator: Arc<Replicator>,
    handle: ReplicatedHandle,
    refs: Arc<DirectoryReplica>,
    store: Arc<BufferStore>,
    fetch_timeout: Duration,
    pending: DashMap<u64, oneshot::Sender<Option<Bytes>>>,
    request_counter: AtomicU64,
}

impl BufferDirectory {
    /// Create the directory, register its replica under the configured
    /// key and hook it into the coordinator for fetch traffic and
    /// owner-failure purging.
    pub async fn new(
        replicator: Arc<Replicator>,
        config: &DirectoryConfig,
    ) -> Result<Arc<Self>, DirectoryError> {
        let refs = Arc::new(DirectoryReplica::default());
        let store = Arc::new(BufferStore::new(
            config.storage_dir.clone(),
            config.spill_threshold,
        )?);

        let expected = replicator.coordinator().current_view().len() as u32;
        let handle = replicator
            .replicate(&config.replica_key, refs.clone(), expected)
            .await?;

        let directory = Arc::new(Self {
            replicator: replicator.clone(),
            handle,
            refs,
            store,
            fetch_timeout: config.fetch_timeout,
            pending: DashMap::new(),
            request_counter: AtomicU64::new(0),
        });
        replicator
            .coordinator()
            .add_listener(directory.clone() as Arc<dyn CoordinatorListener>);
        Ok(directory)
    }

    fn local_node(&self) -> &NodeId {
        self.replicator.local_node()
    }

    /// Publish a payload under `buffer_id`. The payload lands in the
    /// local store; only the reference is replicated. Republishing an
    /// id this node already owns replaces the payload.
    pub async fn publish(&self, buffer_id: &str, data: Bytes) -> Result<(), DirectoryError> {
        let size = data.len() as u64;
        self.store.insert(buffer_id, data)?;

        let reference = BufferReference {
            owner: self.local_node().as_str().to_string(),
            size,
            published_at_ms: unix_millis(),
        };
        let encoded = reference
            .encode()
            .map_err(|e| DirectoryError::Storage(format!("encode reference: {}", e)))?;
        self.handle.put(buffer_id, Bytes::from(encoded)).await?;

        self.update_owned_gauges();
        info!("Buffer '{}': published ({} bytes)", buffer_id, size);
        Ok(())
    }

    /// Resolve a buffer id to its current owner, if any node is
    /// advertising it.
    pub fn lookup(&self, buffer_id: &str) -> Option<NodeId> {
        self.refs.get(buffer_id).map(|r| NodeId::new(r.owner))
    }

    /// The replicated reference for a buffer id.
    pub fn reference(&self, buffer_id: &str) -> Option<BufferReference> {
        self.refs.get(buffer_id)
    }

    /// Number of buffer ids currently in the catalog.
    pub fn catalog_len(&self) -> usize {
        self.refs.len()
    }

    /// Fetch a buffer's payload from wherever it lives.
    ///
    /// A local hit is served from the store. A remote fetch that times
    /// out or cannot reach the owner is retried once against a freshly
    /// resolved owner; an owner that answers "absent" is authoritative
    /// and fails with `NotFound` immediately.
    pub async fn fetch(&self, buffer_id: &str) -> Result<Bytes, DirectoryError> {
        let metrics = self.replicator.coordinator().metrics();
        metrics.fetches_total.inc();

        for attempt in 0..2 {
            let owner = match self.lookup(buffer_id) {
                Some(owner) => owner,
                None => {
                    metrics.fetch_failures_total.inc();
                    return Err(DirectoryError::NotFound(buffer_id.to_string()));
                }
            };

            if owner == *self.local_node() {
                return match self.store.get(buffer_id)? {
                    Some(data) => Ok(data),
                    None => {
                        metrics.fetch_failures_total.inc();
                        Err(DirectoryError::NotFound(buffer_id.to_string()))
                    }
                };
            }

            match self.fetch_remote(&owner, buffer_id).await {
                Ok(Some(data)) => return Ok(data),
                Ok(None) => {
                    // The owner is authoritative about its own store
                    metrics.fetch_failures_total.inc();
                    return Err(DirectoryError::NotFound(buffer_id.to_string()));
                }
                Err(e) => {
                    if attempt == 0 {
                        debug!(
                            "Buffer '{}': fetch from '{}' failed ({}), re-resolving",
                            buffer_id, owner, e
                        );
                        metrics.fetch_retries_total.inc();
                        // A migrated reference needs a moment to arrive
                        // before the re-resolve
                        tokio::time::sleep(FETCH_RETRY_DELAY).await;
                    } else {
                        metrics.fetch_failures_total.inc();
                        return Err(DirectoryError::OwnerUnreachable(buffer_id.to_string()));
                    }
                }
            }
        }

        metrics.fetch_failures_total.inc();
        Err(DirectoryError::OwnerUnreachable(buffer_id.to_string()))
    }

    async fn fetch_remote(
        &self,
        owner: &NodeId,
        buffer_id: &str,
    ) -> Result<Option<Bytes>, ChannelError> {
        let request_id = self.request_counter.fetch_add(1, Ordering::AcqRel) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, tx);

        let request = ReplicaMessage::FetchRequest {
            request_id,
            buffer_id: buffer_id.to_string(),
        };
        let encoded = request
            .encode()
            .map_err(|e| ChannelError::Codec(e.to_string()))?;

        let outcome = async {
            self.replicator
                .coordinator()
                .group_channel()
                .send_to(owner, Bytes::from(encoded))
                .await?;
            match tokio::time::timeout(self.fetch_timeout, rx).await {
                Ok(Ok(payload)) => Ok(payload),
                Ok(Err(_)) => Err(ChannelError::Closed),
                Err(_) => Err(ChannelError::Timeout),
            }
        }
        .await;

        self.pending.remove(&request_id);
        outcome
    }

    /// Withdraw a buffer this node owns: drops the payload and the
    /// replicated reference. Only the owner may release; anyone else
    /// gets `NotFound`.
    pub async fn release(&self, buffer_id: &str) -> Result<(), DirectoryError> {
        match self.refs.get(buffer_id) {
            Some(reference) if reference.owner == self.local_node().as_str() => {
                self.store.remove(buffer_id);
                self.handle.remove(buffer_id).await?;
                self.update_owned_gauges();
                info!("Buffer '{}': released", buffer_id);
                Ok(())
            }
            Some(reference) => {
                debug!(
                    "Buffer '{}': release refused, owned by '{}'",
                    buffer_id, reference.owner
                );
                Err(DirectoryError::NotFound(buffer_id.to_string()))
            }
            None => Err(DirectoryError::NotFound(buffer_id.to_string())),
        }
    }

    /// Stop contributing to the directory replica.
    pub async fn shutdown(&self) -> Result<(), DirectoryError> {
        self.replicator.stop(&self.handle).await?;
        Ok(())
    }

    fn update_owned_gauges(&self) {
        let metrics = self.replicator.coordinator().metrics();
        let mut owned = 0i64;
        let mut bytes = 0i64;
        let local = self.local_node().as_str();
        for entry in self.refs.refs.iter() {
            if entry.value().owner == local {
                owned += 1;
                bytes += entry.value().size as i64;
            }
        }
        metrics.buffers_owned_current.set(owned);
        metrics.buffer_bytes_current.set(bytes);
    }

    fn answer_fetch(&self, from: &NodeId, request_id: u64, buffer_id: String) {
        let payload = match self.store.get(&buffer_id) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Buffer '{}': fetch read failed: {}", buffer_id, e);
                None
            }
        };
        let response = ReplicaMessage::FetchResponse {
            request_id,
            payload: payload.map(|b| b.to_vec()),
        };
        let encoded = match response.encode() {
            Ok(encoded) => Bytes::from(encoded),
            Err(e) => {
                warn!("Buffer '{}': encode fetch response failed: {}", buffer_id, e);
                return;
            }
        };

        let channel = self.replicator.coordinator().group_channel();
        let requester = from.clone();
        self.replicator.coordinator().scheduler().spawn(async move {
            if let Err(e) = channel.send_to(&requester, encoded).await {
                debug!("Fetch response to '{}' failed: {}", requester, e);
            }
        });
    }
}

impl CoordinatorListener for BufferDirectory {
    fn on_message(&self, from: &NodeId, payload: &Bytes) {
        match ReplicaMessage::decode(payload) {
            Ok(ReplicaMessage::FetchRequest { request_id, buffer_id }) => {
                self.answer_fetch(from, request_id, buffer_id);
            }
            Ok(ReplicaMessage::FetchResponse { request_id, payload }) => {
                if let Some((_, tx)) = self.pending.remove(&request_id) {
                    let _ = tx.send(payload.map(Bytes::from));
                }
            }
            // Replication traffic is the replicator's concern
            Ok(_) | Err(_) => {}
        }
    }

    fn on_view_changed(&self, view: &Arc<ClusterView>) {
        let metrics = self.replicator.coordinator().metrics();
        let mut purged = 0u64;
        for (buffer_id, owner) in self.refs.owners() {
            if owner == self.local_node().as_str() {
                continue;
            }
            if !view.contains(&NodeId::new(owner.clone())) {
                // Forget the stamp too: a re-publish by a restarted
                // owner must not be rejected as stale
                self.handle.forget_local(&buffer_id);
                warn!(
                    "Buffer '{}': owner '{}' left the view, reference purged",
                    buffer_id, owner
                );
                purged += 1;
            }
        }
        if purged > 0 {
            metrics.buffers_purged_total.inc_by(purged);
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::LocalNetwork;
    use crate::cluster::CoordinatorRegistry;
    use crate::metrics::Metrics;
    use std::path::PathBuf;
    use tokio::runtime::Handle;

    fn test_config(dir: &tempfile::TempDir) -> DirectoryConfig {
        DirectoryConfig {
            storage_dir: PathBuf::from(dir.path()),
            spill_threshold: 64 * 1024,
            fetch_timeout: Duration::from_millis(500),
            replica_key: "buffer-directory".to_string(),
        }
    }

    async fn directory_on(
        network: &LocalNetwork,
        node: &str,
        dir: &tempfile::TempDir,
    ) -> Arc<BufferDirectory> {
        let registry = CoordinatorRegistry::new(
            Arc::new(network.clone()),
            Handle::current(),
            Metrics::new(),
        )
        .with_probe_interval(Duration::from_secs(3600));
        let coordinator = registry.join("test", node).await.unwrap();
        let replicator = Replicator::new(coordinator);
        BufferDirectory::new(replicator, &test_config(dir))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn publish_then_local_fetch() {
        let network = LocalNetwork::new();
        let dir = tempfile::tempdir().unwrap();
        let directory = directory_on(&network, "a", &dir).await;

        directory
            .publish("b1", Bytes::from_static(b"payload"))
            .await
            .unwrap();

        assert_eq!(directory.lookup("b1"), Some(NodeId::new("a")));
        let reference = directory.reference("b1").unwrap();
        assert_eq!(reference.owner, "a");
        assert_eq!(reference.size, 7);

        let data = directory.fetch("b1").await.unwrap();
        assert_eq!(data, Bytes::from_static(b"payload"));
    }

    #[tokio::test]
    async fn fetch_unknown_id_is_not_found() {
        let network = LocalNetwork::new();
        let dir = tempfile::tempdir().unwrap();
        let directory = directory_on(&network, "a", &dir).await;

        match directory.fetch("missing").await {
            Err(DirectoryError::NotFound(id)) => assert_eq!(id, "missing"),
            other => panic!("expected NotFound, got {:?}", other.map(|b| b.len())),
        }
    }

    #[tokio::test]
    async fn release_removes_reference_and_payload() {
        let network = LocalNetwork::new();
        let dir = tempfile::tempdir().unwrap();
        let directory = directory_on(&network, "a", &dir).await;

        directory.publish("b1", Bytes::from_static(b"x")).await.unwrap();
        directory.release("b1").await.unwrap();

        assert_eq!(directory.lookup("b1"), None);
        assert!(matches!(
            directory.fetch("b1").await,
            Err(DirectoryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn release_of_unknown_id_is_not_found() {
        let network = LocalNetwork::new();
        let dir = tempfile::tempdir().unwrap();
        let directory = directory_on(&network, "a", &dir).await;

        assert!(matches!(
            directory.release("nope").await,
            Err(DirectoryError::NotFound(_))
        ));
    }

    #[test]
    fn reference_roundtrip() {
        let reference = BufferReference {
            owner: "node-a".to_string(),
            size: 1024,
            published_at_ms: 1_700_000_000_000,
        };
        let encoded = reference.encode().unwrap();
        assert_eq!(BufferReference::decode(&encoded).unwrap(), reference);
    }
}
