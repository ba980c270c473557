//! In-Process Group Channel
//!
//! A hub that connects any number of [`LocalChannel`]s by name inside
//! one process. Used by the test suite and by hosts that embed several
//! logical nodes in a single runtime. Supports abrupt `kill` and
//! reachability toggling to simulate node failure and partitions.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::{ChannelError, ChannelEvent, ChannelFactory, GroupChannel, NodeId};

const EVENT_QUEUE_CAPACITY: usize = 1024;

#[derive(Default)]
struct Group {
    nodes: HashMap<String, mpsc::Sender<ChannelEvent>>,
    unreachable: HashSet<String>,
}

impl Group {
    fn member_list(&self) -> Vec<NodeId> {
        let mut members: Vec<NodeId> = self.nodes.keys().map(|n| NodeId::new(n.clone())).collect();
        members.sort();
        members
    }
}

/// In-process channel hub. Cloning shares the hub.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    groups: Arc<Mutex<HashMap<String, Group>>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abruptly remove a node, as if its process died. Remaining
    /// members observe a membership change; the victim's event queue
    /// ends without a `Closed` marker.
    pub fn kill(&self, channel_name: &str, node_name: &str) {
        let (notify, members) = {
            let mut groups = self.groups.lock();
            match groups.get_mut(channel_name) {
                Some(group) => {
                    group.nodes.remove(node_name);
                    group.unreachable.remove(node_name);
                    (
                        group.nodes.values().cloned().collect::<Vec<_>>(),
                        group.member_list(),
                    )
                }
                None => return,
            }
        };
        Self::notify_membership(notify, members);
    }

    /// Toggle reachability of a node for point-to-point sends and
    /// broadcasts without changing membership. Simulates a link-level
    /// partition around one node.
    pub fn set_reachable(&self, channel_name: &str, node_name: &str, reachable: bool) {
        let mut groups = self.groups.lock();
        if let Some(group) = groups.get_mut(channel_name) {
            if reachable {
                group.unreachable.remove(node_name);
            } else {
                group.unreachable.insert(node_name.to_string());
            }
        }
    }

    /// Current member names of a group, mostly for test assertions.
    pub fn members(&self, channel_name: &str) -> Vec<NodeId> {
        let groups = self.groups.lock();
        groups
            .get(channel_name)
            .map(|g| g.member_list())
            .unwrap_or_default()
    }

    fn notify_membership(targets: Vec<mpsc::Sender<ChannelEvent>>, members: Vec<NodeId>) {
        for tx in targets {
            // Queues are sized so membership events only drop if a
            // consumer is wedged; best-effort is the contract.
            let _ = tx.try_send(ChannelEvent::MembershipChanged {
                members: members.clone(),
            });
        }
    }

    fn detach(&self, channel_name: &str, node_name: &str) {
        self.kill(channel_name, node_name);
    }
}

#[async_trait]
impl ChannelFactory for LocalNetwork {
    async fn open(
        &self,
        channel_name: &str,
        node_name: &str,
    ) -> Result<(Arc<dyn GroupChannel>, mpsc::Receiver<ChannelEvent>), ChannelError> {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

        let (notify, members) = {
            let mut groups = self.groups.lock();
            let group = groups.entry(channel_name.to_string()).or_default();
            if group.nodes.contains_key(node_name) {
                return Err(ChannelError::Unavailable(format!(
                    "node '{}' already joined channel '{}'",
                    node_name, channel_name
                )));
            }
            group.nodes.insert(node_name.to_string(), tx);
            (
                group.nodes.values().cloned().collect::<Vec<_>>(),
                group.member_list(),
            )
        };
        Self::notify_membership(notify, members);

        let channel = Arc::new(LocalChannel {
            network: self.clone(),
            channel_name: channel_name.to_string(),
            local: NodeId::new(node_name),
            closed: AtomicBool::new(false),
        });

        Ok((channel, rx))
    }
}

/// One node's endpoint on a [`LocalNetwork`].
pub struct LocalChannel {
    network: LocalNetwork,
    channel_name: String,
    local: NodeId,
    closed: AtomicBool,
}

impl LocalChannel {
    fn sender_for(&self, target: &str) -> Result<mpsc::Sender<ChannelEvent>, ChannelError> {
        let groups = self.network.groups.lock();
        let group = groups
            .get(&self.channel_name)
            .ok_or_else(|| ChannelError::Unavailable("channel gone".to_string()))?;
        if group.unreachable.contains(target) {
            return Err(ChannelError::Unavailable(format!(
                "node '{}' unreachable",
                target
            )));
        }
        group
            .nodes
            .get(target)
            .cloned()
            .ok_or_else(|| ChannelError::Unavailable(format!("unknown member '{}'", target)))
    }

    fn check_open(&self) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl GroupChannel for LocalChannel {
    fn channel_name(&self) -> &str {
        &self.channel_name
    }

    fn local_node(&self) -> &NodeId {
        &self.local
    }

    async fn broadcast(&self, payload: Bytes) -> Result<(), ChannelError> {
        self.check_open()?;

        let targets: Vec<(String, mpsc::Sender<ChannelEvent>)> = {
            let groups = self.network.groups.lock();
            match groups.get(&self.channel_name) {
                Some(group) => group
                    .nodes
                    .iter()
                    .filter(|(name, _)| {
                        name.as_str() != self.local.as_str()
                            && !group.unreachable.contains(name.as_str())
                    })
                    .map(|(name, tx)| (name.clone(), tx.clone()))
                    .collect(),
                None => return Err(ChannelError::Unavailable("channel gone".to_string())),
            }
        };

        for (name, tx) in targets {
            let event = ChannelEvent::Message {
                from: self.local.clone(),
                payload: payload.clone(),
            };
            if tx.send(event).await.is_err() {
                debug!("local broadcast: member '{}' queue closed", name);
            }
        }
        Ok(())
    }

    async fn send_to(&self, target: &NodeId, payload: Bytes) -> Result<(), ChannelError> {
        self.check_open()?;
        let tx = self.sender_for(target.as_str())?;
        tx.send(ChannelEvent::Message {
            from: self.local.clone(),
            payload,
        })
        .await
        .map_err(|_| ChannelError::Unavailable(format!("node '{}' queue closed", target)))
    }

    async fn probe(&self) -> Result<(), ChannelError> {
        self.check_open()
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.network.detach(&self.channel_name, self.local.as_str());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain_until_membership(rx: &mut mpsc::Receiver<ChannelEvent>) -> Vec<NodeId> {
        loop {
            match rx.recv().await {
                Some(ChannelEvent::MembershipChanged { members }) => return members,
                Some(_) => continue,
                None => panic!("event queue ended"),
            }
        }
    }

    #[tokio::test]
    async fn join_notifies_all_members() {
        let network = LocalNetwork::new();
        let (_a, mut rx_a) = network.open("test", "a").await.unwrap();
        assert_eq!(drain_until_membership(&mut rx_a).await, vec![NodeId::new("a")]);

        let (_b, mut rx_b) = network.open("test", "b").await.unwrap();
        let expected = vec![NodeId::new("a"), NodeId::new("b")];
        assert_eq!(drain_until_membership(&mut rx_a).await, expected);
        assert_eq!(drain_until_membership(&mut rx_b).await, expected);
    }

    #[tokio::test]
    async fn duplicate_name_rejected() {
        let network = LocalNetwork::new();
        let (_a, _rx) = network.open("test", "a").await.unwrap();
        assert!(network.open("test", "a").await.is_err());
    }

    #[tokio::test]
    async fn broadcast_reaches_others_not_self() {
        let network = LocalNetwork::new();
        let (a, mut rx_a) = network.open("test", "a").await.unwrap();
        let (_b, mut rx_b) = network.open("test", "b").await.unwrap();
        drain_until_membership(&mut rx_a).await;
        drain_until_membership(&mut rx_b).await;
        drain_until_membership(&mut rx_a).await;

        a.broadcast(Bytes::from_static(b"hello")).await.unwrap();

        match rx_b.recv().await {
            Some(ChannelEvent::Message { from, payload }) => {
                assert_eq!(from, NodeId::new("a"));
                assert_eq!(&payload[..], b"hello");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn per_sender_order_preserved() {
        let network = LocalNetwork::new();
        let (a, _rx_a) = network.open("test", "a").await.unwrap();
        let (_b, mut rx_b) = network.open("test", "b").await.unwrap();

        for i in 0..32u8 {
            a.broadcast(Bytes::from(vec![i])).await.unwrap();
        }

        let mut seen = Vec::new();
        while seen.len() < 32 {
            match rx_b.recv().await {
                Some(ChannelEvent::Message { payload, .. }) => seen.push(payload[0]),
                Some(_) => continue,
                None => break,
            }
        }
        assert_eq!(seen, (0..32u8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn unreachable_node_fails_send() {
        let network = LocalNetwork::new();
        let (a, _rx_a) = network.open("test", "a").await.unwrap();
        let (_b, _rx_b) = network.open("test", "b").await.unwrap();

        network.set_reachable("test", "b", false);
        assert!(a
            .send_to(&NodeId::new("b"), Bytes::from_static(b"x"))
            .await
            .is_err());

        network.set_reachable("test", "b", true);
        assert!(a
            .send_to(&NodeId::new("b"), Bytes::from_static(b"x"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn close_removes_member() {
        let network = LocalNetwork::new();
        let (a, _rx_a) = network.open("test", "a").await.unwrap();
        let (_b, mut rx_b) = network.open("test", "b").await.unwrap();

        a.close().await;
        assert!(a.broadcast(Bytes::from_static(b"x")).await.is_err());

        loop {
            match rx_b.recv().await {
                Some(ChannelEvent::MembershipChanged { members })
                    if members == vec![NodeId::new("b")] =>
                {
                    break;
                }
                Some(_) => continue,
                None => panic!("event queue ended early"),
            }
        }
    }
}
