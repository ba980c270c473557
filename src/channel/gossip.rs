//! Gossip-Backed Group Channel
//!
//! Production [`GroupChannel`] implementation: chitchat gossip (UDP)
//! handles node discovery and failure detection, while data frames
//! travel over a TCP mesh of [`PeerLink`]s. Each node advertises its
//! TCP data address through the gossip key-value state; a watcher task
//! diffs gossip snapshots into membership events and keeps the link
//! set in sync.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use chitchat::transport::UdpTransport;
use chitchat::{spawn_chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::GossipConfig;

use super::link::{
    frame_message, read_frame_length, reserve_frame, LinkMessage, INITIAL_READ_BUF_SIZE,
    LINK_PROTOCOL_VERSION,
};
use super::{ChannelError, ChannelEvent, ChannelFactory, GroupChannel, LinkStatus, NodeId, PeerLink};

/// Gossip state key advertising the TCP data address
const KEY_DATA_ADDR: &str = "data_addr";

const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Opens [`GossipChannel`]s from a shared gossip configuration.
pub struct GossipChannelFactory {
    config: GossipConfig,
}

impl GossipChannelFactory {
    pub fn new(config: GossipConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ChannelFactory for GossipChannelFactory {
    async fn open(
        &self,
        channel_name: &str,
        node_name: &str,
    ) -> Result<(Arc<dyn GroupChannel>, mpsc::Receiver<ChannelEvent>), ChannelError> {
        let (channel, rx) = GossipChannel::open(self.config.clone(), channel_name, node_name).await?;
        Ok((channel as Arc<dyn GroupChannel>, rx))
    }
}

/// Gossip-discovered TCP mesh channel.
pub struct GossipChannel {
    channel_name: String,
    local: NodeId,
    links: Arc<DashMap<String, Arc<PeerLink>>>,
    chitchat: Mutex<Option<ChitchatHandle>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
    events_tx: mpsc::Sender<ChannelEvent>,
}

impl GossipChannel {
    /// Attach to a named channel: start gossiping, bind the data
    /// listener, and begin watching for peers.
    pub async fn open(
        config: GossipConfig,
        channel_name: &str,
        node_name: &str,
    ) -> Result<(Arc<Self>, mpsc::Receiver<ChannelEvent>), ChannelError> {
        let gossip_advertise_addr = config.get_gossip_advertise_addr();
        let data_advertise_addr = config.get_data_advertise_addr();
        let local = NodeId::new(node_name);

        info!(
            "Joining channel '{}' as '{}' (gossip_advertise={}, data_advertise={})",
            channel_name, node_name, gossip_advertise_addr, data_advertise_addr
        );

        // Generation distinguishes restarts of the same node name
        let generation = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let chitchat_id = ChitchatId::new(node_name.to_string(), generation, gossip_advertise_addr);

        let failure_detector_config = FailureDetectorConfig {
            phi_threshold: 8.0,
            initial_interval: config.gossip_interval,
            ..Default::default()
        };

        let chitchat_config = ChitchatConfig {
            chitchat_id,
            cluster_id: channel_name.to_string(),
            gossip_interval: config.gossip_interval,
            listen_addr: config.gossip_addr,
            seed_nodes: config.seeds.clone(),
            failure_detector_config,
            marked_for_deletion_grace_period: config.dead_node_grace_period,
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let initial_kvs = vec![(KEY_DATA_ADDR.to_string(), data_advertise_addr.to_string())];

        let chitchat_handle = spawn_chitchat(chitchat_config, initial_kvs, &UdpTransport)
            .await
            .map_err(|e| ChannelError::Unavailable(e.to_string()))?;

        let listener = TcpListener::bind(config.data_addr)
            .await
            .map_err(|e| ChannelError::Unavailable(e.to_string()))?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let links: Arc<DashMap<String, Arc<PeerLink>>> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        // The local node is a member before any peer is discovered
        let _ = events_tx
            .send(ChannelEvent::MembershipChanged {
                members: vec![local.clone()],
            })
            .await;

        let mut tasks = Vec::new();

        {
            let events_tx = events_tx.clone();
            let channel_name = channel_name.to_string();
            let local = local.clone();
            tasks.push(tokio::spawn(async move {
                Self::data_listener_loop(listener, events_tx, channel_name, local).await;
            }));
        }

        {
            let chitchat = chitchat_handle.chitchat();
            let links = links.clone();
            let events_tx = events_tx.clone();
            let closed = closed.clone();
            let channel_name = channel_name.to_string();
            let local = local.clone();
            let gossip_interval = config.gossip_interval;
            tasks.push(tokio::spawn(async move {
                Self::gossip_watcher_loop(
                    chitchat,
                    links,
                    events_tx,
                    closed,
                    channel_name,
                    local,
                    gossip_interval,
                )
                .await;
            }));
        }

        let channel = Arc::new(Self {
            channel_name: channel_name.to_string(),
            local,
            links,
            chitchat: Mutex::new(Some(chitchat_handle)),
            tasks: Mutex::new(tasks),
            closed,
            events_tx,
        });

        Ok((channel, events_rx))
    }

    /// Accept inbound links and feed their data frames into the event
    /// queue.
    async fn data_listener_loop(
        listener: TcpListener,
        events_tx: mpsc::Sender<ChannelEvent>,
        channel_name: String,
        local: NodeId,
    ) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("Incoming peer link from {}", addr);
                    let events_tx = events_tx.clone();
                    let channel_name = channel_name.clone();
                    let local = local.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            Self::handle_incoming_link(stream, events_tx, channel_name, local).await
                        {
                            debug!("Incoming peer link error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept peer link: {}", e);
                }
            }
        }
    }

    /// Handshake an inbound link and pump its frames.
    async fn handle_incoming_link(
        stream: tokio::net::TcpStream,
        events_tx: mpsc::Sender<ChannelEvent>,
        channel_name: String,
        local: NodeId,
    ) -> Result<(), ChannelError> {
        let (mut read_half, mut write_half) = stream.into_split();
        let mut read_buf = vec![0u8; INITIAL_READ_BUF_SIZE];

        // Wait for Hello
        let n = tokio::time::timeout(Duration::from_secs(10), read_half.read(&mut read_buf))
            .await
            .map_err(|_| ChannelError::Timeout)?
            .map_err(|e| ChannelError::Unavailable(e.to_string()))?;

        if n == 0 {
            return Err(ChannelError::Unavailable("connection closed".to_string()));
        }

        let len = read_frame_length(&read_buf[..n])
            .ok_or_else(|| ChannelError::Codec("invalid frame".to_string()))?;
        if n < 4 + len as usize {
            return Err(ChannelError::Codec("incomplete handshake frame".to_string()));
        }

        let msg = LinkMessage::decode(&read_buf[4..4 + len as usize])
            .map_err(|e| ChannelError::Codec(e.to_string()))?;

        let peer_node = match msg {
            LinkMessage::Hello { channel, node_id, version } => {
                if version != LINK_PROTOCOL_VERSION {
                    return Err(ChannelError::Unavailable(format!(
                        "protocol version mismatch: {} vs {}",
                        version, LINK_PROTOCOL_VERSION
                    )));
                }
                if channel != channel_name {
                    return Err(ChannelError::Unavailable(format!(
                        "wrong channel '{}', expected '{}'",
                        channel, channel_name
                    )));
                }
                node_id
            }
            _ => return Err(ChannelError::Codec("expected Hello".to_string())),
        };

        info!("Incoming peer link: {}", peer_node);

        let ack = LinkMessage::HelloAck {
            node_id: local.as_str().to_string(),
            version: LINK_PROTOCOL_VERSION,
        };
        let frame = frame_message(&ack).map_err(|e| ChannelError::Codec(e.to_string()))?;
        write_half
            .write_all(&frame)
            .await
            .map_err(|e| ChannelError::Unavailable(e.to_string()))?;

        let mut buf_offset = 0usize;

        loop {
            let n = read_half
                .read(&mut read_buf[buf_offset..])
                .await
                .map_err(|e| ChannelError::Unavailable(e.to_string()))?;
            if n == 0 {
                info!("Peer link '{}' disconnected", peer_node);
                return Ok(());
            }

            buf_offset += n;

            while let Some(len) = read_frame_length(&read_buf[..buf_offset]) {
                let len = len as usize;
                reserve_frame(&mut read_buf, len)?;
                if buf_offset < 4 + len {
                    break;
                }

                if let Ok(msg) = LinkMessage::decode(&read_buf[4..4 + len]) {
                    match msg {
                        LinkMessage::Data { from, payload } => {
                            let _ = events_tx
                                .send(ChannelEvent::Message {
                                    from: NodeId::new(from),
                                    payload: Bytes::from(payload),
                                })
                                .await;
                        }
                        LinkMessage::Ping => {
                            if let Ok(frame) = frame_message(&LinkMessage::Pong) {
                                let _ = write_half.write_all(&frame).await;
                            }
                        }
                        LinkMessage::Goodbye => {
                            info!("Peer link '{}' said goodbye", peer_node);
                            return Ok(());
                        }
                        _ => {}
                    }
                }

                read_buf.copy_within(4 + len..buf_offset, 0);
                buf_offset -= 4 + len;
            }
        }
    }

    /// Watch gossip state, connect to new peers, drop dead ones, and
    /// publish membership changes.
    async fn gossip_watcher_loop(
        chitchat: Arc<tokio::sync::Mutex<chitchat::Chitchat>>,
        links: Arc<DashMap<String, Arc<PeerLink>>>,
        events_tx: mpsc::Sender<ChannelEvent>,
        closed: Arc<AtomicBool>,
        channel_name: String,
        local: NodeId,
        gossip_interval: Duration,
    ) {
        let mut known_nodes: HashSet<String> = HashSet::new();
        let mut last_members: Vec<NodeId> = vec![local.clone()];

        loop {
            tokio::time::sleep(gossip_interval).await;
            if closed.load(Ordering::Acquire) {
                return;
            }

            let cluster_state = {
                let cc = chitchat.lock().await;
                cc.state_snapshot()
            };

            for node_state in &cluster_state.node_states {
                let node_id_str = node_state.chitchat_id().node_id.clone();
                if node_id_str == local.as_str() {
                    continue;
                }

                if !known_nodes.contains(&node_id_str) {
                    known_nodes.insert(node_id_str.clone());

                    if let Some(data_addr_str) = node_state.get(KEY_DATA_ADDR) {
                        if let Ok(data_addr) = data_addr_str.parse::<SocketAddr>() {
                            info!(
                                "Discovered peer '{}' on channel '{}' at {}",
                                node_id_str, channel_name, data_addr
                            );
                            let link = PeerLink::spawn(
                                NodeId::new(node_id_str.clone()),
                                data_addr,
                                channel_name.clone(),
                                local.clone(),
                                events_tx.clone(),
                            );
                            links.insert(node_id_str.clone(), link);
                        } else {
                            warn!(
                                "Peer '{}' advertised unparseable data address '{}'",
                                node_id_str, data_addr_str
                            );
                        }
                    }
                }
            }

            // Nodes gone from the snapshot are dead
            let current_nodes: HashSet<String> = cluster_state
                .node_states
                .iter()
                .map(|ns| ns.chitchat_id().node_id.clone())
                .collect();

            let dead_nodes: Vec<String> = known_nodes
                .iter()
                .filter(|n| !current_nodes.contains(*n))
                .cloned()
                .collect();

            for node_id in dead_nodes {
                info!("Peer '{}' left channel '{}'", node_id, channel_name);
                known_nodes.remove(&node_id);
                if let Some((_, link)) = links.remove(&node_id) {
                    link.stop().await;
                }
            }

            let mut members: Vec<NodeId> = known_nodes.iter().map(|n| NodeId::new(n.clone())).collect();
            members.push(local.clone());
            members.sort();
            members.dedup();

            if members != last_members {
                last_members = members.clone();
                if events_tx
                    .send(ChannelEvent::MembershipChanged { members })
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl GroupChannel for GossipChannel {
    fn channel_name(&self) -> &str {
        &self.channel_name
    }

    fn local_node(&self) -> &NodeId {
        &self.local
    }

    async fn broadcast(&self, payload: Bytes) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }

        for link in self.links.iter() {
            if link.value().status() != LinkStatus::Connected {
                continue;
            }
            if let Err(e) = link.value().send(payload.clone()).await {
                warn!("Broadcast to peer '{}' failed: {}", link.key(), e);
            }
        }
        Ok(())
    }

    async fn send_to(&self, target: &NodeId, payload: Bytes) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }

        let link = self
            .links
            .get(target.as_str())
            .map(|l| l.value().clone())
            .ok_or_else(|| ChannelError::Unavailable(format!("unknown member '{}'", target)))?;
        link.send(payload).await
    }

    async fn probe(&self) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        // Gossip failure detection reports peer liveness; the probe
        // only has to vouch for the local transport.
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Closing channel '{}'", self.channel_name);

        for link in self.links.iter() {
            link.value().stop().await;
        }
        self.links.clear();

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        // Chitchat stops gossiping when the handle drops
        let _ = self.chitchat.lock().take();

        let _ = self.events_tx.try_send(ChannelEvent::Closed);
    }
}
