//! In-process loopback network
//!
//! Every joined node gets a bounded mpsc inbox. Nodes are addressed by
//! `NodeId` and grouped by the identity they run, which is how masters are
//! resolved to devices.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use strand_core::{Id, NodeId, StrandError, StrandResult};

use crate::{Envelope, Peer, PeerMessage, Transport};

/// Inbox of one node
pub type MessageReceiver = mpsc::Receiver<Envelope>;

/// Default inbox capacity
pub const DEFAULT_INBOX_SIZE: usize = 256;

struct NodeEntry {
    identity: Id,
    tx: mpsc::Sender<Envelope>,
    online: bool,
}

/// Shared hub all loopback transports deliver through
pub struct LoopbackNetwork {
    nodes: RwLock<HashMap<NodeId, NodeEntry>>,
    inbox_size: usize,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Self::with_inbox_size(DEFAULT_INBOX_SIZE)
    }

    pub fn with_inbox_size(inbox_size: usize) -> Arc<Self> {
        Arc::new(LoopbackNetwork {
            nodes: RwLock::new(HashMap::new()),
            inbox_size,
        })
    }

    /// Attach a node running `identity`
    pub fn join(self: &Arc<Self>, node_id: NodeId, identity: Id) -> (LoopbackTransport, MessageReceiver) {
        let (tx, rx) = mpsc::channel(self.inbox_size);
        self.nodes.write().insert(
            node_id,
            NodeEntry {
                identity,
                tx,
                online: true,
            },
        );

        let transport = LoopbackTransport {
            network: Arc::clone(self),
            node_id,
            identity,
            sessions: RwLock::new(HashMap::new()),
        };
        (transport, rx)
    }

    /// Simulate a partition; messages to an offline node fail
    pub fn set_online(&self, node_id: NodeId, online: bool) {
        if let Some(entry) = self.nodes.write().get_mut(&node_id) {
            entry.online = online;
        }
    }

    /// Handle for replying from `from` to `to`
    pub fn peer(self: &Arc<Self>, from: NodeId, to: NodeId) -> Arc<dyn Peer> {
        Arc::new(LoopbackPeer {
            network: Arc::clone(self),
            from,
            to,
        })
    }

    /// Devices running `identity`, excluding `except`
    fn devices_of(&self, identity: &Id, except: NodeId) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = self
            .nodes
            .read()
            .iter()
            .filter(|(node_id, entry)| **node_id != except && entry.identity == *identity)
            .map(|(node_id, _)| *node_id)
            .collect();
        out.sort();
        out
    }

    async fn deliver(&self, from: NodeId, to: NodeId, message: PeerMessage) -> StrandResult<()> {
        let tx = {
            let nodes = self.nodes.read();
            match nodes.get(&to) {
                Some(entry) if entry.online => entry.tx.clone(),
                Some(_) => return Err(StrandError::PeerDelivery(format!("{} is offline", to))),
                None => return Err(StrandError::PeerDelivery(format!("{} is unknown", to))),
            }
        };

        tx.send(Envelope { from, message })
            .await
            .map_err(|_| StrandError::PeerDelivery(format!("{} inbox closed", to)))
    }
}

/// Reply handle to one node
pub struct LoopbackPeer {
    network: Arc<LoopbackNetwork>,
    from: NodeId,
    to: NodeId,
}

#[async_trait]
impl Peer for LoopbackPeer {
    fn node_id(&self) -> NodeId {
        self.to
    }

    async fn send(&self, message: PeerMessage) -> StrandResult<()> {
        self.network.deliver(self.from, self.to, message).await
    }
}

/// Transport of one node on a `LoopbackNetwork`
pub struct LoopbackTransport {
    network: Arc<LoopbackNetwork>,
    node_id: NodeId,
    identity: Id,
    /// entity -> registered masters; devices are resolved at send time
    sessions: RwLock<HashMap<Id, HashSet<Id>>>,
}

impl LoopbackTransport {
    #[inline]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Masters registered for `entity_id`
    pub fn registered(&self, entity_id: &Id) -> Vec<Id> {
        let mut out: Vec<Id> = self
            .sessions
            .read()
            .get(entity_id)
            .map(|masters| masters.iter().copied().collect())
            .unwrap_or_default();
        out.sort();
        out
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn register_peer(&self, entity_id: Id, master_id: Id) -> StrandResult<()> {
        // Our own identity may have no other device yet
        if master_id != self.identity && self.network.devices_of(&master_id, self.node_id).is_empty() {
            return Err(StrandError::PeerDelivery(format!("no device runs master {}", master_id)));
        }
        self.sessions.write().entry(entity_id).or_default().insert(master_id);
        Ok(())
    }

    async fn send_to(&self, entity_id: Id, master_id: Id, message: PeerMessage) -> StrandResult<()> {
        let registered = self
            .sessions
            .read()
            .get(&entity_id)
            .map_or(false, |masters| masters.contains(&master_id));
        if !registered {
            return Err(StrandError::PeerDelivery(format!(
                "master {} not registered for {}",
                master_id, entity_id
            )));
        }

        let devices = self.network.devices_of(&master_id, self.node_id);
        if devices.is_empty() {
            return Err(StrandError::PeerDelivery(format!("no device runs master {}", master_id)));
        }
        for device in devices {
            self.network.deliver(self.node_id, device, message.clone()).await?;
        }
        Ok(())
    }

    async fn broadcast(&self, entity_id: Id, message: PeerMessage) -> StrandResult<usize> {
        let mut devices: Vec<NodeId> = Vec::new();
        for master_id in self.registered(&entity_id) {
            devices.extend(self.network.devices_of(&master_id, self.node_id));
        }
        devices.sort();
        devices.dedup();

        let mut reached = 0;
        for device in devices {
            match self.network.deliver(self.node_id, device, message.clone()).await {
                Ok(()) => reached += 1,
                Err(e) => {
                    tracing::warn!(entity = %entity_id, node = %device, error = %e, "Broadcast delivery failed");
                }
            }
        }
        Ok(reached)
    }
}

/// Receiver of inbound peer messages
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, peer: Arc<dyn Peer>, message: PeerMessage);
}

/// Start a background loop feeding a node's inbox to `handler`
pub fn start_receive_loop(
    network: Arc<LoopbackNetwork>,
    node_id: NodeId,
    mut rx: MessageReceiver,
    handler: Arc<dyn MessageHandler>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            tracing::debug!(node = %node_id, from = %envelope.from, kind = envelope.message.kind(), "Inbound message");
            let peer = network.peer(node_id, envelope.from);
            handler.handle(peer, envelope.message).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::{OplogCategory, Timestamp};

    fn identity(b: u8) -> Id {
        Id::new([b; 32])
    }

    fn sync_request(entity_id: Id) -> PeerMessage {
        PeerMessage::SyncRequest {
            entity_id,
            category: OplogCategory::Master,
            since: Timestamp::ZERO,
        }
    }

    #[tokio::test]
    async fn test_send_to_registered_master() {
        let network = LoopbackNetwork::new();
        let (a, _rx_a) = network.join(NodeId::new(1), identity(1));
        let (_b, mut rx_b) = network.join(NodeId::new(2), identity(2));
        let entity = identity(9);

        a.register_peer(entity, identity(2)).await.unwrap();
        a.send_to(entity, identity(2), sync_request(entity)).await.unwrap();

        let envelope = rx_b.recv().await.unwrap();
        assert_eq!(envelope.from, NodeId::new(1));
        assert_eq!(envelope.message, sync_request(entity));
    }

    #[tokio::test]
    async fn test_register_unknown_master_fails() {
        let network = LoopbackNetwork::new();
        let (a, _rx) = network.join(NodeId::new(1), identity(1));

        let result = a.register_peer(identity(9), identity(5)).await;
        assert!(matches!(result, Err(StrandError::PeerDelivery(_))));
        // Own identity without other devices is fine
        assert!(a.register_peer(identity(9), identity(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_other_devices_of_identity() {
        let network = LoopbackNetwork::new();
        let (a, _rx_a) = network.join(NodeId::new(1), identity(1));
        let (_a2, mut rx_a2) = network.join(NodeId::new(2), identity(1));
        let (_c, mut rx_c) = network.join(NodeId::new(3), identity(3));
        let me_entity = identity(7);

        a.register_peer(me_entity, identity(1)).await.unwrap();
        let reached = a.broadcast(me_entity, PeerMessage::MeOplogs {
            entity_id: me_entity,
            payload: Vec::new(),
        }).await.unwrap();

        assert_eq!(reached, 1);
        assert!(rx_a2.recv().await.is_some());
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_offline_node_fails_delivery() {
        let network = LoopbackNetwork::new();
        let (a, _rx_a) = network.join(NodeId::new(1), identity(1));
        let (_b, _rx_b) = network.join(NodeId::new(2), identity(2));
        let entity = identity(9);

        a.register_peer(entity, identity(2)).await.unwrap();
        network.set_online(NodeId::new(2), false);

        assert!(a.send_to(entity, identity(2), sync_request(entity)).await.is_err());
        assert_eq!(a.broadcast(entity, sync_request(entity)).await.unwrap(), 0);
    }
}
