//! Group Channel Abstraction
//!
//! The coordinator and everything above it talk to the cluster through
//! an injected [`GroupChannel`]: an ordered, best-effort multicast
//! transport that also reports membership changes. Two implementations
//! ship with the crate:
//!
//! - [`GossipChannel`]: chitchat gossip for discovery plus a TCP mesh
//!   for data frames (production).
//! - [`LocalChannel`]: an in-process hub for tests and embedding.
//!
//! Every implementation must preserve per-sender delivery order; no
//! order is guaranteed across different senders.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bincode::{Decode, Encode};
use bytes::Bytes;
use tokio::sync::mpsc;

mod gossip;
mod link;
mod local;

pub use gossip::{GossipChannel, GossipChannelFactory};
pub use link::{
    frame_message, read_frame_length, LinkMessage, LinkStatus, PeerLink, LINK_PROTOCOL_VERSION,
};
pub use local::{LocalChannel, LocalNetwork};

/// Channel-assigned node address. Stable for the lifetime of a
/// connection and unique within the cluster at any instant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Error type for channel operations
#[derive(Debug)]
pub enum ChannelError {
    /// Transport down, never connected, or the target is unknown
    Unavailable(String),
    /// Operation timed out
    Timeout,
    /// Channel was closed locally
    Closed,
    /// Wire encode/decode failure
    Codec(String),
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::Unavailable(msg) => write!(f, "Channel unavailable: {}", msg),
            ChannelError::Timeout => write!(f, "Channel operation timed out"),
            ChannelError::Closed => write!(f, "Channel closed"),
            ChannelError::Codec(msg) => write!(f, "Codec error: {}", msg),
        }
    }
}

impl std::error::Error for ChannelError {}

/// Events a channel delivers to its consumer.
///
/// Events are pushed over an mpsc queue handed out at open time, so a
/// single coordination task consumes them without re-entering channel
/// internals.
#[derive(Debug)]
pub enum ChannelEvent {
    /// A data frame from another member
    Message { from: NodeId, payload: Bytes },
    /// The live member set changed (includes the local node)
    MembershipChanged { members: Vec<NodeId> },
    /// Transport trouble worth telling listeners about; advisory only
    PartitionSuspected { detail: String },
    /// The channel will produce no further events
    Closed,
}

/// Ordered, best-effort multicast transport among cluster nodes.
#[async_trait]
pub trait GroupChannel: Send + Sync {
    /// Name of the group channel this instance is attached to
    fn channel_name(&self) -> &str;

    /// The address this channel assigned to the local node
    fn local_node(&self) -> &NodeId;

    /// Send a payload to every other current member, fire-and-forget
    async fn broadcast(&self, payload: Bytes) -> Result<(), ChannelError>;

    /// Send a payload to a single member
    async fn send_to(&self, target: &NodeId, payload: Bytes) -> Result<(), ChannelError>;

    /// Cheap liveness check of the transport itself
    async fn probe(&self) -> Result<(), ChannelError>;

    /// Detach from the group. Remaining members observe a membership
    /// change; the event queue ends after a final `Closed`.
    async fn close(&self);
}

/// Opens group channels by name.
///
/// The factory is the seam the hosting code injects: production wires
/// a [`GossipChannelFactory`], tests wire a [`LocalNetwork`].
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    async fn open(
        &self,
        channel_name: &str,
        node_name: &str,
    ) -> Result<(Arc<dyn GroupChannel>, mpsc::Receiver<ChannelEvent>), ChannelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_display_and_order() {
        let a = NodeId::new("a");
        let b = NodeId::from("b");
        assert_eq!(a.to_string(), "a");
        assert_eq!(a.as_str(), "a");
        assert!(a < b);
    }

    #[test]
    fn channel_error_display() {
        assert_eq!(
            ChannelError::Unavailable("no transport".into()).to_string(),
            "Channel unavailable: no transport"
        );
        assert_eq!(ChannelError::Timeout.to_string(), "Channel operation timed out");
    }
}
