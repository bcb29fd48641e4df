//! Peer and transport traits

use async_trait::async_trait;

use strand_core::{Id, NodeId, StrandResult};

use crate::PeerMessage;

/// A reachable remote device
#[async_trait]
pub trait Peer: Send + Sync {
    fn node_id(&self) -> NodeId;

    /// Deliver a message; delivery failures are `PeerDelivery` errors
    async fn send(&self, message: PeerMessage) -> StrandResult<()>;
}

/// Session management for the peers of each entity
///
/// Masters are identities, not devices: registering a master binds every
/// device of that identity to the entity.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish or refresh the sessions with `master_id`'s devices for
    /// `entity_id`. Idempotent.
    async fn register_peer(&self, entity_id: Id, master_id: Id) -> StrandResult<()>;

    /// Send to the devices of one registered master
    async fn send_to(&self, entity_id: Id, master_id: Id, message: PeerMessage) -> StrandResult<()>;

    /// Send to every registered device of the entity. Returns the number of
    /// devices reached.
    async fn broadcast(&self, entity_id: Id, message: PeerMessage) -> StrandResult<usize>;
}

/// Transport that reaches nobody
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTransport;

#[async_trait]
impl Transport for NullTransport {
    async fn register_peer(&self, _entity_id: Id, _master_id: Id) -> StrandResult<()> {
        Ok(())
    }

    async fn send_to(&self, _entity_id: Id, _master_id: Id, _message: PeerMessage) -> StrandResult<()> {
        Ok(())
    }

    async fn broadcast(&self, _entity_id: Id, _message: PeerMessage) -> StrandResult<usize> {
        Ok(0)
    }
}
