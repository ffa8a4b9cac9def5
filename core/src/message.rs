//! Replication protocol messages and their serialization
//!
//! A `ProtocolMessage` is the envelope exchanged by the two endpoints of a
//! proxy pair. Content frames consume exactly one sender token; ack-only
//! frames (no operations) re-declare the sender's last token.

use crate::identifier::{AccessPath, MeshBaseId, MeshObjectId};
use crate::mesh::object::{Change, ReplicaPayload};
use crate::probe::coherence::CoherenceSpecification;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire/persisted format errors
#[derive(Debug, Error, Clone)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

/// Hands one role (lock or home) for one object to the receiver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipTransfer {
    pub object: MeshObjectId,
    /// The receiver did not replicate this object with the sender before
    pub is_new_proxy: bool,
    /// Lock fencing epoch after the transfer
    pub epoch: u64,
}

/// One operation carried by a protocol message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    /// Ask for first-time replicas, with the freshness the requester wants
    ObtainReplicas {
        paths: Vec<AccessPath>,
        coherence: Option<CoherenceSpecification>,
    },
    /// Give the lock to the receiver
    PushLock(Vec<OwnershipTransfer>),
    /// Give home status to the receiver
    PushHome(Vec<OwnershipTransfer>),
    /// Sender has taken the lock unilaterally
    ForceObtainLock(Vec<OwnershipTransfer>),
    /// Sender no longer wants updates for these objects
    CancelLease(Vec<MeshObjectId>),
    /// Sender wants the current authoritative state
    Resynchronize(Vec<MeshObjectId>),
    /// Sender wants the receiver to refresh from its source, then convey
    Freshen(Vec<MeshObjectId>),
    /// Committed changes to replicated objects
    TransactionDelta(Vec<Change>),
    /// Replica state, in response to obtain/resynchronize/freshen
    ConveyReplicas(Vec<ReplicaPayload>),
    /// Ask the receiver to push the lock back
    RequestLock(Vec<MeshObjectId>),
    /// Ask the receiver to push home status back
    RequestHome(Vec<MeshObjectId>),
    /// A lock or home request was refused
    Denied {
        objects: Vec<MeshObjectId>,
        reason: String,
    },
    /// Requested objects do not exist at the receiver
    Missing(Vec<MeshObjectId>),
}

impl Operation {
    /// Human-readable operation name
    pub fn operation_type(&self) -> &'static str {
        match self {
            Operation::ObtainReplicas { .. } => "ObtainReplicas",
            Operation::PushLock(_) => "PushLock",
            Operation::PushHome(_) => "PushHome",
            Operation::ForceObtainLock(_) => "ForceObtainLock",
            Operation::CancelLease(_) => "CancelLease",
            Operation::Resynchronize(_) => "Resynchronize",
            Operation::Freshen(_) => "Freshen",
            Operation::TransactionDelta(_) => "TransactionDelta",
            Operation::ConveyReplicas(_) => "ConveyReplicas",
            Operation::RequestLock(_) => "RequestLock",
            Operation::RequestHome(_) => "RequestHome",
            Operation::Denied { .. } => "Denied",
            Operation::Missing(_) => "Missing",
        }
    }
}

/// The envelope exchanged between two endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    pub sender: MeshBaseId,
    pub receiver: MeshBaseId,
    /// Sender's token; strictly increasing per content frame
    pub token_sent: u64,
    /// Highest token the sender has accepted from the receiver
    pub token_acked: u64,
    pub operations: Vec<Operation>,
}

impl ProtocolMessage {
    /// Whether this frame only carries an acknowledgment
    pub fn is_ack_only(&self) -> bool {
        self.operations.is_empty()
    }

    /// Serialize to bytes using bincode
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(self).map_err(|e| CodecError::Serialization(e.to_string()))
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        bincode::deserialize(bytes).map_err(|e| CodecError::Deserialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::object::{MeshObject, PropertyValue};

    fn base(name: &str) -> MeshBaseId {
        MeshBaseId::new(name).unwrap()
    }

    #[test]
    fn test_message_roundtrip_with_payload() {
        let a = base("local:a");
        let mut obj = MeshObject::new(MeshObjectId::new(a.clone(), "x"), 5);
        obj.properties
            .insert("k".to_string(), PropertyValue::Float(0.25));

        let msg = ProtocolMessage {
            sender: a.clone(),
            receiver: base("local:b"),
            token_sent: 4,
            token_acked: 2,
            operations: vec![
                Operation::ObtainReplicas {
                    paths: vec![AccessPath::to_home(base("local:b"))],
                    coherence: Some(CoherenceSpecification::periodic(3000)),
                },
                Operation::ConveyReplicas(vec![obj.to_payload()]),
                Operation::PushLock(vec![OwnershipTransfer {
                    object: obj.identifier.clone(),
                    is_new_proxy: true,
                    epoch: 1,
                }]),
            ],
        };

        let decoded = ProtocolMessage::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert!(!decoded.is_ack_only());
    }

    #[test]
    fn test_garbage_is_rejected() {
        let result = ProtocolMessage::from_bytes(&[0xff, 0x01]);
        assert!(matches!(result, Err(CodecError::Deserialization(_))));
    }

    #[test]
    fn test_operation_type_names() {
        assert_eq!(Operation::Freshen(vec![]).operation_type(), "Freshen");
        assert_eq!(
            Operation::Denied {
                objects: vec![],
                reason: String::new()
            }
            .operation_type(),
            "Denied"
        );
    }
}
