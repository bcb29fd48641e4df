//! Messages exchanged between peers

use serde::{Deserialize, Serialize};

use strand_core::{Id, JoinBundle, NodeId, OplogCategory, Timestamp};

/// Peer-to-peer message
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PeerMessage {
    /// Admit the entity described by the bundle
    ApproveJoin(JoinBundle),
    /// Oplogs of one category, sealed with one of the entity's op keys
    Oplogs {
        entity_id: Id,
        category: OplogCategory,
        payload: Vec<u8>,
    },
    /// Ask for every applied log of `category` created after `since`
    SyncRequest {
        entity_id: Id,
        category: OplogCategory,
        since: Timestamp,
    },
    /// Identity-level logs for the devices of one identity, sealed with
    /// the identity's device key
    MeOplogs { entity_id: Id, payload: Vec<u8> },
}

impl PeerMessage {
    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::ApproveJoin(_) => "approve_join",
            PeerMessage::Oplogs { .. } => "oplogs",
            PeerMessage::SyncRequest { .. } => "sync_request",
            PeerMessage::MeOplogs { .. } => "me_oplogs",
        }
    }

    /// Entity the message concerns, when it names one
    pub fn entity_id(&self) -> Option<Id> {
        match self {
            PeerMessage::ApproveJoin(bundle) => Some(bundle.entity_id()),
            PeerMessage::Oplogs { entity_id, .. }
            | PeerMessage::SyncRequest { entity_id, .. }
            | PeerMessage::MeOplogs { entity_id, .. } => Some(*entity_id),
        }
    }
}

/// Message tagged with the node it came from
#[derive(Clone, Debug)]
pub struct Envelope {
    pub from: NodeId,
    pub message: PeerMessage,
}
