//! bufmesh - Replicated buffer directory over gossip clustering
//!
//! Nodes join a named group channel, track each other through gossip
//! membership, and replicate a directory of published buffers. Buffer
//! payloads stay with their owner and are fetched point-to-point on
//! demand; only the small owner references are replicated everywhere.

pub mod channel;
pub mod cluster;
pub mod config;
pub mod directory;
pub mod metrics;
pub mod replicator;

pub use channel::{ChannelError, ChannelFactory, GossipChannelFactory, GroupChannel, NodeId};
pub use cluster::{
    ClusterError, ClusterView, Coordinator, CoordinatorListener, CoordinatorRegistry,
};
pub use config::Config;
pub use directory::{BufferDirectory, BufferReference, DirectoryError};
pub use metrics::{Metrics, MetricsServer};
pub use replicator::{MapReplica, ReplicaDelegate, ReplicatedHandle, ReplicationError, Replicator};
