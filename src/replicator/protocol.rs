//! Replication Protocol Messages
//!
//! The closed set of operation records carried over the group channel.
//! Messages are serialized using bincode; the channel treats them as
//! opaque payloads.

use bincode::{Decode, Encode};

/// Last-writer-wins stamp: a monotonic per-node counter with the node
/// id as tie-break. Derived ordering compares counter first, so two
/// stamps never compare equal unless they are the same write.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Encode, Decode)]
pub struct OpStamp {
    /// Per-node monotonic operation counter
    pub counter: u64,
    /// Originating node id
    pub node: String,
}

impl OpStamp {
    pub fn new(counter: u64, node: impl Into<String>) -> Self {
        Self {
            counter,
            node: node.into(),
        }
    }
}

/// A single replicated operation on a handle's entry space.
#[derive(Debug, Clone, Encode, Decode)]
pub enum Operation {
    /// Set an entry
    Put {
        entry_key: String,
        value: Vec<u8>,
        stamp: OpStamp,
    },

    /// Delete an entry
    Remove { entry_key: String, stamp: OpStamp },

    /// Drop all entries and their stamps
    Clear,

    /// Full-state record replacing the local replica
    Snapshot {
        entries: Vec<(String, Vec<u8>)>,
        stamp: OpStamp,
    },
}

impl Operation {
    /// Operation kind name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Put { .. } => "Put",
            Operation::Remove { .. } => "Remove",
            Operation::Clear => "Clear",
            Operation::Snapshot { .. } => "Snapshot",
        }
    }
}

/// Messages exchanged between replicators over the group channel
#[derive(Debug, Clone, Encode, Decode)]
pub enum ReplicaMessage {
    /// A node started contributing a replica under `key`
    Announce {
        key: String,
        expected_replicas: u32,
        origin: String,
    },

    /// A node stopped its contribution; peers purge its routing entry
    Retract { key: String, origin: String },

    /// Apply an operation to the replica under `key`
    Apply {
        key: String,
        op: Operation,
        origin: String,
    },

    /// Point-to-point: request the content of a buffer
    FetchRequest { request_id: u64, buffer_id: String },

    /// Point-to-point: buffer content, or None if absent at the owner
    FetchResponse {
        request_id: u64,
        payload: Option<Vec<u8>>,
    },
}

impl ReplicaMessage {
    /// Encode message to bytes using bincode
    pub fn encode(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::encode_to_vec(self, bincode::config::standard())
    }

    /// Decode message from bytes using bincode
    pub fn decode(data: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        bincode::decode_from_slice(data, bincode::config::standard()).map(|(msg, _)| msg)
    }

    /// Get the message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            ReplicaMessage::Announce { .. } => "Announce",
            ReplicaMessage::Retract { .. } => "Retract",
            ReplicaMessage::Apply { .. } => "Apply",
            ReplicaMessage::FetchRequest { .. } => "FetchRequest",
            ReplicaMessage::FetchResponse { .. } => "FetchResponse",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamp_ordering_counter_first_node_tiebreak() {
        let older = OpStamp::new(1, "b");
        let newer = OpStamp::new(2, "a");
        assert!(older < newer);

        let left = OpStamp::new(3, "a");
        let right = OpStamp::new(3, "b");
        assert!(left < right);
    }

    #[test]
    fn encode_decode_apply_put() {
        let msg = ReplicaMessage::Apply {
            key: "buffer-directory".to_string(),
            op: Operation::Put {
                entry_key: "b1".to_string(),
                value: vec![1, 2, 3],
                stamp: OpStamp::new(7, "node-a"),
            },
            origin: "node-a".to_string(),
        };

        let encoded = msg.encode().unwrap();
        let decoded = ReplicaMessage::decode(&encoded).unwrap();

        match decoded {
            ReplicaMessage::Apply { key, op, origin } => {
                assert_eq!(key, "buffer-directory");
                assert_eq!(origin, "node-a");
                match op {
                    Operation::Put { entry_key, value, stamp } => {
                        assert_eq!(entry_key, "b1");
                        assert_eq!(value, vec![1, 2, 3]);
                        assert_eq!(stamp, OpStamp::new(7, "node-a"));
                    }
                    other => panic!("wrong op: {:?}", other),
                }
            }
            other => panic!("wrong message: {:?}", other),
        }
    }

    #[test]
    fn encode_decode_fetch_response() {
        let msg = ReplicaMessage::FetchResponse {
            request_id: 42,
            payload: Some(vec![9; 16]),
        };

        let encoded = msg.encode().unwrap();
        match ReplicaMessage::decode(&encoded).unwrap() {
            ReplicaMessage::FetchResponse { request_id, payload } => {
                assert_eq!(request_id, 42);
                assert_eq!(payload.unwrap().len(), 16);
            }
            other => panic!("wrong message: {:?}", other),
        }
    }

    #[test]
    fn type_and_kind_names() {
        assert_eq!(
            ReplicaMessage::Retract {
                key: "k".to_string(),
                origin: "n".to_string()
            }
            .type_name(),
            "Retract"
        );
        assert_eq!(Operation::Clear.kind(), "Clear");
    }
}
