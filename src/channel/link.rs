//! Peer Link Protocol
//!
//! Binary protocol and connection handling for the TCP data mesh that
//! backs [`GossipChannel`](super::GossipChannel). Frames are
//! length-prefixed bincode. Each node keeps one outbound link per
//! discovered peer; the link reconnects with exponential backoff until
//! told to shut down.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bincode::{Decode, Encode};
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::{ChannelError, ChannelEvent, NodeId};

/// Protocol version for compatibility checking
pub const LINK_PROTOCOL_VERSION: u8 = 1;

/// Handshake and connect timeouts
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(15);

/// Messages exchanged between peer links over TCP
#[derive(Debug, Clone, Encode, Decode)]
pub enum LinkMessage {
    /// Handshake sent when connecting to a peer
    Hello {
        /// Group channel the sender belongs to
        channel: String,
        /// Node ID of the sender
        node_id: String,
        /// Protocol version
        version: u8,
    },

    /// Handshake acknowledgment
    HelloAck {
        /// Node ID of the responder
        node_id: String,
        /// Protocol version
        version: u8,
    },

    /// Opaque data frame carried for the layers above
    Data {
        /// Node ID of the originator
        from: String,
        /// Serialized operation record
        payload: Vec<u8>,
    },

    /// Keep-alive ping
    Ping,

    /// Keep-alive pong
    Pong,

    /// Graceful disconnect notification
    Goodbye,
}

impl LinkMessage {
    /// Encode message to bytes using bincode
    pub fn encode(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::encode_to_vec(self, bincode::config::standard())
    }

    /// Decode message from bytes using bincode
    pub fn decode(data: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        bincode::decode_from_slice(data, bincode::config::standard()).map(|(msg, _)| msg)
    }
}

/// Frame a message with length prefix for TCP transmission
pub fn frame_message(msg: &LinkMessage) -> Result<Vec<u8>, bincode::error::EncodeError> {
    let payload = msg.encode()?;
    let len = payload.len() as u32;

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);

    Ok(frame)
}

/// Read frame length from bytes (returns None if not enough data)
pub fn read_frame_length(data: &[u8]) -> Option<u32> {
    if data.len() < 4 {
        return None;
    }
    Some(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
}

/// Largest frame a link will accept; a declared length beyond this is
/// treated as a protocol error rather than an allocation request.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Initial size of a link's read buffer; grows on demand up to
/// [`MAX_FRAME_SIZE`] when a larger frame is announced.
pub(crate) const INITIAL_READ_BUF_SIZE: usize = 65536;

/// Make sure `buf` can hold a complete frame of the declared length.
pub(crate) fn reserve_frame(buf: &mut Vec<u8>, len: usize) -> Result<(), ChannelError> {
    if len > MAX_FRAME_SIZE {
        return Err(ChannelError::Codec(format!(
            "frame of {} bytes exceeds the {} byte limit",
            len, MAX_FRAME_SIZE
        )));
    }
    if buf.len() < 4 + len {
        buf.resize(4 + len, 0);
    }
    Ok(())
}

/// Commands sent to the link connection task
#[derive(Debug)]
enum LinkCommand {
    /// Send a data frame to the peer
    Send(Bytes),
    /// Shutdown the connection
    Shutdown,
}

/// Connection state of a peer link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// Not connected, will attempt to connect
    Disconnected,
    /// Currently connecting
    Connecting,
    /// Connected and operational
    Connected,
    /// Connection failed, backing off before retry
    Backoff,
}

/// An outbound TCP link to another cluster node.
///
/// Data frames arriving on this link are forwarded into the channel's
/// event queue, so a link is usable in both directions once up.
pub struct PeerLink {
    node_id: NodeId,
    peer_addr: SocketAddr,
    status: Arc<RwLock<LinkStatus>>,
    command_tx: mpsc::Sender<LinkCommand>,
}

impl PeerLink {
    /// Spawn the connection task for a discovered peer.
    pub fn spawn(
        node_id: NodeId,
        peer_addr: SocketAddr,
        channel_name: String,
        local_node: NodeId,
        events: mpsc::Sender<ChannelEvent>,
    ) -> Arc<Self> {
        let (command_tx, command_rx) = mpsc::channel(1024);
        let status = Arc::new(RwLock::new(LinkStatus::Disconnected));

        let link = Arc::new(Self {
            node_id: node_id.clone(),
            peer_addr,
            status: status.clone(),
            command_tx,
        });

        tokio::spawn(async move {
            Self::connection_loop(
                node_id,
                peer_addr,
                channel_name,
                local_node,
                status,
                command_rx,
                events,
            )
            .await;
        });

        link
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn status(&self) -> LinkStatus {
        *self.status.read()
    }

    /// Queue a data frame for transmission.
    pub async fn send(&self, payload: Bytes) -> Result<(), ChannelError> {
        self.command_tx
            .send(LinkCommand::Send(payload))
            .await
            .map_err(|_| ChannelError::Unavailable("link command queue closed".to_string()))
    }

    /// Ask the connection task to say Goodbye and exit.
    pub async fn stop(&self) {
        let _ = self.command_tx.send(LinkCommand::Shutdown).await;
    }

    /// Run the connection loop with reconnection
    async fn connection_loop(
        node_id: NodeId,
        peer_addr: SocketAddr,
        channel_name: String,
        local_node: NodeId,
        status: Arc<RwLock<LinkStatus>>,
        mut command_rx: mpsc::Receiver<LinkCommand>,
        events: mpsc::Sender<ChannelEvent>,
    ) {
        let mut retry_interval = Duration::from_secs(1);
        let max_retry = Duration::from_secs(30);

        loop {
            *status.write() = LinkStatus::Connecting;
            debug!("PeerLink '{}': connecting to {}", node_id, peer_addr);

            match Self::connect_and_run(
                &node_id,
                peer_addr,
                &channel_name,
                &local_node,
                &status,
                &mut command_rx,
                &events,
            )
            .await
            {
                Ok(()) => {
                    info!("PeerLink '{}': disconnected gracefully", node_id);
                    *status.write() = LinkStatus::Disconnected;
                    return;
                }
                Err(e) => {
                    error!("PeerLink '{}': connection failed: {}", node_id, e);
                    *status.write() = LinkStatus::Backoff;

                    debug!("PeerLink '{}': reconnecting in {:?}", node_id, retry_interval);
                    tokio::time::sleep(retry_interval).await;
                    retry_interval = std::cmp::min(retry_interval * 2, max_retry);
                }
            }

            // Drain a shutdown request that arrived while down
            match command_rx.try_recv() {
                Ok(LinkCommand::Shutdown) | Err(mpsc::error::TryRecvError::Disconnected) => {
                    info!("PeerLink '{}': shutdown requested", node_id);
                    *status.write() = LinkStatus::Disconnected;
                    return;
                }
                _ => {}
            }
        }
    }

    /// Connect to the peer and run the message loop
    async fn connect_and_run(
        node_id: &NodeId,
        peer_addr: SocketAddr,
        channel_name: &str,
        local_node: &NodeId,
        status: &Arc<RwLock<LinkStatus>>,
        command_rx: &mut mpsc::Receiver<LinkCommand>,
        events: &mpsc::Sender<ChannelEvent>,
    ) -> Result<(), ChannelError> {
        let stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(peer_addr))
            .await
            .map_err(|_| ChannelError::Timeout)?
            .map_err(|e| ChannelError::Unavailable(e.to_string()))?;

        let (mut read_half, mut write_half) = stream.into_split();

        // Send Hello
        let hello = LinkMessage::Hello {
            channel: channel_name.to_string(),
            node_id: local_node.as_str().to_string(),
            version: LINK_PROTOCOL_VERSION,
        };
        let frame = frame_message(&hello).map_err(|e| ChannelError::Codec(e.to_string()))?;
        write_half
            .write_all(&frame)
            .await
            .map_err(|e| ChannelError::Unavailable(e.to_string()))?;

        // Wait for HelloAck
        let mut read_buf = vec![0u8; INITIAL_READ_BUF_SIZE];
        let n = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_half.read(&mut read_buf))
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

        match msg {
            LinkMessage::HelloAck { node_id: peer_id, version } => {
                if version != LINK_PROTOCOL_VERSION {
                    return Err(ChannelError::Unavailable(format!(
                        "protocol version mismatch: {} vs {}",
                        version, LINK_PROTOCOL_VERSION
                    )));
                }
                info!("PeerLink '{}': connected (peer_id={})", node_id, peer_id);
            }
            _ => {
                return Err(ChannelError::Codec("expected HelloAck".to_string()));
            }
        }

        *status.write() = LinkStatus::Connected;

        let mut ping_timer = tokio::time::interval(PING_INTERVAL);
        ping_timer.reset();

        let mut buf_offset = 0usize;

        loop {
            tokio::select! {
                // Commands from the channel
                Some(cmd) = command_rx.recv() => {
                    match cmd {
                        LinkCommand::Send(payload) => {
                            let msg = LinkMessage::Data {
                                from: local_node.as_str().to_string(),
                                payload: payload.to_vec(),
                            };
                            let frame = frame_message(&msg)
                                .map_err(|e| ChannelError::Codec(e.to_string()))?;
                            if let Err(e) = write_half.write_all(&frame).await {
                                error!("PeerLink '{}': TCP write error: {}", node_id, e);
                                return Err(ChannelError::Unavailable(e.to_string()));
                            }
                        }
                        LinkCommand::Shutdown => {
                            let msg = LinkMessage::Goodbye;
                            if let Ok(frame) = frame_message(&msg) {
                                let _ = write_half.write_all(&frame).await;
                            }
                            return Ok(());
                        }
                    }
                }

                // Frames from the peer
                result = read_half.read(&mut read_buf[buf_offset..]) => {
                    let n = result.map_err(|e| ChannelError::Unavailable(e.to_string()))?;
                    if n == 0 {
                        return Err(ChannelError::Unavailable("connection closed".to_string()));
                    }

                    buf_offset += n;

                    while let Some(len) = read_frame_length(&read_buf[..buf_offset]) {
                        let len = len as usize;
                        reserve_frame(&mut read_buf, len)?;
                        if buf_offset < 4 + len {
                            break; // Need more data
                        }

                        if let Ok(msg) = LinkMessage::decode(&read_buf[4..4 + len]) {
                            match msg {
                                LinkMessage::Data { from, payload } => {
                                    let _ = events.send(ChannelEvent::Message {
                                        from: NodeId::new(from),
                                        payload: Bytes::from(payload),
                                    }).await;
                                }
                                LinkMessage::Ping => {
                                    if let Ok(frame) = frame_message(&LinkMessage::Pong) {
                                        let _ = write_half.write_all(&frame).await;
                                    }
                                }
                                LinkMessage::Pong => {
                                    debug!("PeerLink '{}': pong received", node_id);
                                }
                                LinkMessage::Goodbye => {
                                    info!("PeerLink '{}': received Goodbye", node_id);
                                    return Err(ChannelError::Unavailable(
                                        "peer disconnected".to_string(),
                                    ));
                                }
                                _ => {}
                            }
                        }

                        read_buf.copy_within(4 + len..buf_offset, 0);
                        buf_offset -= 4 + len;
                    }
                }

                _ = ping_timer.tick() => {
                    if let Ok(frame) = frame_message(&LinkMessage::Ping) {
                        if let Err(e) = write_half.write_all(&frame).await {
                            return Err(ChannelError::Unavailable(e.to_string()));
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_hello() {
        let msg = LinkMessage::Hello {
            channel: "analytics".to_string(),
            node_id: "node1".to_string(),
            version: LINK_PROTOCOL_VERSION,
        };

        let encoded = msg.encode().unwrap();
        let decoded = LinkMessage::decode(&encoded).unwrap();

        match decoded {
            LinkMessage::Hello { channel, node_id, version } => {
                assert_eq!(channel, "analytics");
                assert_eq!(node_id, "node1");
                assert_eq!(version, LINK_PROTOCOL_VERSION);
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn encode_decode_data() {
        let msg = LinkMessage::Data {
            from: "node1".to_string(),
            payload: vec![1, 2, 3, 4],
        };

        let encoded = msg.encode().unwrap();
        let decoded = LinkMessage::decode(&encoded).unwrap();

        match decoded {
            LinkMessage::Data { from, payload } => {
                assert_eq!(from, "node1");
                assert_eq!(payload, vec![1, 2, 3, 4]);
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn frame_roundtrip() {
        let msg = LinkMessage::Ping;
        let frame = frame_message(&msg).unwrap();

        // First 4 bytes are length
        let len = read_frame_length(&frame).unwrap();
        assert_eq!(len as usize, frame.len() - 4);

        let decoded = LinkMessage::decode(&frame[4..]).unwrap();
        assert!(matches!(decoded, LinkMessage::Ping));
    }

    #[test]
    fn frame_length_needs_four_bytes() {
        assert_eq!(read_frame_length(&[0, 0, 1]), None);
        assert_eq!(read_frame_length(&[0, 0, 0, 7]), Some(7));
    }

    #[test]
    fn reserve_frame_grows_but_bounds_the_buffer() {
        let mut buf = vec![0u8; INITIAL_READ_BUF_SIZE];
        reserve_frame(&mut buf, 100_000).unwrap();
        assert_eq!(buf.len(), 4 + 100_000);

        // A smaller frame never shrinks the buffer
        reserve_frame(&mut buf, 16).unwrap();
        assert_eq!(buf.len(), 4 + 100_000);

        assert!(matches!(
            reserve_frame(&mut buf, MAX_FRAME_SIZE + 1),
            Err(ChannelError::Codec(_))
        ));
    }

    #[tokio::test]
    async fn delivers_frames_larger_than_the_initial_read_buffer() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let large = vec![0x5A_u8; 100_000];
        let sent = large.clone();
        let acceptor = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            // Consume the Hello, then complete the handshake
            let mut buf = vec![0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0);
            let ack = frame_message(&LinkMessage::HelloAck {
                node_id: "b".to_string(),
                version: LINK_PROTOCOL_VERSION,
            })
            .unwrap();
            stream.write_all(&ack).await.unwrap();

            let small = frame_message(&LinkMessage::Data {
                from: "b".to_string(),
                payload: vec![1, 2, 3],
            })
            .unwrap();
            stream.write_all(&small).await.unwrap();

            let frame = frame_message(&LinkMessage::Data {
                from: "b".to_string(),
                payload: sent,
            })
            .unwrap();
            stream.write_all(&frame).await.unwrap();

            // Keep the connection open until the link is told to stop
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let (events_tx, mut events_rx) = mpsc::channel(16);
        let link = PeerLink::spawn(
            NodeId::new("b"),
            addr,
            "test".to_string(),
            NodeId::new("a"),
            events_tx,
        );

        let first = tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match first {
            ChannelEvent::Message { payload, .. } => assert_eq!(&payload[..], &[1, 2, 3]),
            other => panic!("unexpected event: {:?}", other),
        }

        let second = tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match second {
            ChannelEvent::Message { from, payload } => {
                assert_eq!(from, NodeId::new("b"));
                assert_eq!(payload.len(), large.len());
                assert_eq!(&payload[..], &large[..]);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        link.stop().await;
        acceptor.abort();
    }
}
