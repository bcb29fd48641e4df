//! STRAND node
//!
//! Ties one device together: its identity, the entity registry, the join
//! orchestrator and the dispatch of inbound peer messages.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use strand_core::{
    EntityMeta, EntityType, Id, NodeId, Op, Oplog, OplogCategory, StrandError, StrandResult, Timestamp,
};
use strand_crypto::Identity;
use strand_store::{KvStore, MemoryStore};
use strand_sync::{ProtocolManager, SyncContext};
use strand_time::Env;
use strand_transport::{MessageHandler, NullTransport, Peer, PeerMessage, Transport};

use crate::{
    Board, BoardBody, Entity, EntityRegistry, EntitySlot, JoinOptions, JoinOrchestrator, MyEntity, StrandConfig, SyncSettings,
};

/// One device running STRAND
pub struct StrandNode {
    node_id: NodeId,
    identity: Arc<Identity>,
    config: StrandConfig,
    ctx: SyncContext,
    registry: Arc<EntityRegistry>,
    orchestrator: Arc<JoinOrchestrator>,
    me: RwLock<Option<Arc<MyEntity>>>,
}

impl StrandNode {
    pub fn new(
        identity: Arc<Identity>,
        node_id: NodeId,
        config: StrandConfig,
        env: Env,
        store: Arc<dyn KvStore>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        let ctx = SyncContext {
            env,
            store,
            transport,
            local: Some(Arc::clone(&identity)),
            max_pending_logs: config.service.max_pending_logs,
        };
        let registry = Arc::new(EntityRegistry::new(config.lock_timeout()));
        let settings = SyncSettings {
            interval: config.sync_interval(),
            op_key_ttl: config.op_key_ttl(),
        };
        let orchestrator = Arc::new(JoinOrchestrator::new(Arc::clone(&registry), ctx.clone(), settings));

        Arc::new(StrandNode {
            node_id,
            identity,
            config,
            ctx,
            registry,
            orchestrator,
            me: RwLock::new(None),
        })
    }

    #[inline]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    #[inline]
    pub fn my_id(&self) -> Id {
        self.identity.id()
    }

    pub fn config(&self) -> &StrandConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    pub fn orchestrator(&self) -> &Arc<JoinOrchestrator> {
        &self.orchestrator
    }

    pub fn me(&self) -> Option<Arc<MyEntity>> {
        self.me.read().clone()
    }

    fn slot(&self, entity_id: &Id) -> StrandResult<Arc<EntitySlot>> {
        self.registry.get(entity_id).ok_or(StrandError::EntityNotFound(*entity_id))
    }

    /// Start a new identity on this device
    pub async fn create_identity(&self) -> StrandResult<Arc<MyEntity>> {
        let me = MyEntity::create(Arc::clone(&self.identity), self.node_id, Arc::clone(&self.orchestrator)).await?;
        *self.me.write() = Some(Arc::clone(&me));
        Ok(me)
    }

    /// Join an existing identity as an additional device
    pub async fn attach_identity(&self, me_entity_id: Id) -> StrandResult<Arc<MyEntity>> {
        let me = MyEntity::attach(
            Arc::clone(&self.identity),
            self.node_id,
            me_entity_id,
            Arc::clone(&self.orchestrator),
        )
        .await?;
        *self.me.write() = Some(Arc::clone(&me));
        Ok(me)
    }

    /// Create a board owned by this identity and admit it locally
    pub async fn create_board(&self, title: &str) -> StrandResult<Arc<EntitySlot>> {
        let env = &self.ctx.env;
        let my_id = self.my_id();
        let entity_id = env.new_id(&my_id);

        // Genesis history is written on a scratch store and admitted through
        // the same path as a bundle received from a peer
        let scratch = SyncContext {
            store: Arc::new(MemoryStore::new()),
            transport: Arc::new(NullTransport),
            ..self.ctx.clone()
        };
        let pm = ProtocolManager::open(entity_id, scratch, Vec::new())?;
        pm.author_genesis_master(&self.identity)?;
        pm.author(&self.identity, Op::AddMember, my_id, &())?;
        let body = BoardBody { title: title.to_string() };
        let log0 = pm.author(&self.identity, Op::CreateObject, entity_id, &body)?;
        pm.set_log0(&log0)?;
        let (key, key_log) = pm.new_op_key(&self.identity, self.config.op_key_ttl())?;
        pm.set_op_key(&key, &key_log)?;

        let meta = EntityMeta::new(entity_id, my_id, EntityType::Group, env.now());
        let record = Board { meta, body }.to_record()?;
        let bundle = pm.export_bundle(record)?;

        let opts = JoinOptions::new().new_entity().started();
        self.orchestrator.create_join_entity(bundle, None, opts).await
    }

    /// Write a member log on an entity this identity masters
    pub fn add_member(&self, entity_id: &Id, member_id: Id) -> StrandResult<Oplog> {
        let slot = self.slot(entity_id)?;
        slot.pm().author(&self.identity, Op::AddMember, member_id, &())
    }

    /// Send the entity's bundle to `peer`
    pub async fn invite(&self, entity_id: &Id, peer: Arc<dyn Peer>) -> StrandResult<()> {
        let slot = self.slot(entity_id)?;
        let bundle = slot.pm().export_bundle(slot.entity().to_record()?)?;
        peer.send(PeerMessage::ApproveJoin(bundle)).await
    }

    /// Create a content object and push it to the entity's masters
    pub async fn post<T: serde::Serialize + Sync + ?Sized>(&self, entity_id: &Id, body: &T) -> StrandResult<Oplog> {
        let slot = self.slot(entity_id)?;
        let obj_id = self.ctx.env.new_id(&self.my_id());
        let log = slot.pm().author(&self.identity, Op::CreateObject, obj_id, body)?;
        self.push(&slot, OplogCategory::Content, vec![log.clone()]).await;
        Ok(log)
    }

    async fn push(&self, slot: &EntitySlot, category: OplogCategory, logs: Vec<Oplog>) {
        let entity_id = slot.id();
        let message = match slot.pm().seal_logs(category, &logs) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(entity = %entity_id, error = %e, "Cannot seal oplogs");
                return;
            }
        };
        if let Err(e) = self.ctx.transport.broadcast(entity_id, message).await {
            tracing::warn!(entity = %entity_id, error = %e, "Oplog broadcast failed");
        }
    }

    /// Stop every sync service and refuse further admissions
    pub fn shutdown(&self) {
        self.registry.close();
    }

    async fn on_oplogs(&self, peer: &dyn Peer, entity_id: Id, category: OplogCategory, payload: &[u8]) -> StrandResult<()> {
        let slot = self.slot(&entity_id)?;
        let logs = slot.pm().open_logs(category, payload)?;
        let from = Some(peer.node_id());
        let report = match category {
            OplogCategory::Member => slot.pm().handle_member_oplogs(logs, from)?,
            _ => slot.pm().merge_logs(category, logs, from)?,
        };
        tracing::debug!(
            entity = %entity_id,
            category = %category,
            applied = report.applied,
            buffered = report.buffered,
            rejected = report.rejected,
            "Merged peer oplogs"
        );
        Ok(())
    }

    async fn on_sync_request(&self, peer: &dyn Peer, entity_id: Id, category: OplogCategory, since: Timestamp) -> StrandResult<()> {
        let slot = self.slot(&entity_id)?;
        let logs = slot.pm().logs_since(category, since);
        if logs.is_empty() {
            return Ok(());
        }
        tracing::debug!(entity = %entity_id, category = %category, count = logs.len(), peer = %peer.node_id(), "Answering sync request");
        let message = slot.pm().seal_logs(category, &logs)?;
        peer.send(message).await
    }
}

#[async_trait]
impl MessageHandler for StrandNode {
    async fn handle(&self, peer: Arc<dyn Peer>, message: PeerMessage) {
        let kind = message.kind();
        let result = match message {
            PeerMessage::ApproveJoin(bundle) => {
                let opts = JoinOptions::new().new_entity().started();
                self.orchestrator
                    .create_join_entity(bundle, Some(Arc::clone(&peer)), opts)
                    .await
                    .map(|_| ())
            }
            PeerMessage::Oplogs {
                entity_id,
                category,
                payload,
            } => self.on_oplogs(peer.as_ref(), entity_id, category, &payload).await,
            PeerMessage::SyncRequest {
                entity_id,
                category,
                since,
            } => self.on_sync_request(peer.as_ref(), entity_id, category, since).await,
            PeerMessage::MeOplogs { entity_id, payload } => match self.me() {
                Some(me) => match me.open_history(entity_id, &payload) {
                    Ok(logs) => me.handle_me_oplogs(logs, Some(peer.node_id())).await.map(|_| ()),
                    Err(e) => Err(e),
                },
                None => {
                    tracing::debug!(node = %self.node_id, "Ignoring me-oplogs without an identity");
                    Ok(())
                }
            },
        };

        if let Err(e) = result {
            tracing::warn!(node = %self.node_id, peer = %peer.node_id(), kind, error = %e, "Failed to handle peer message");
        }
    }
}

impl std::fmt::Debug for StrandNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrandNode")
            .field("node_id", &self.node_id)
            .field("my_id", &self.my_id())
            .field("entities", &self.registry.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use strand_core::EntityStatus;
    use strand_transport::{start_receive_loop, LoopbackNetwork};

    fn node(network: &Arc<LoopbackNetwork>, env: &Env, node_id: u64) -> (Arc<StrandNode>, tokio::task::JoinHandle<()>) {
        let identity = Arc::new(Identity::generate(env.random.as_ref(), NodeId::new(node_id)));
        let (transport, rx) = network.join(NodeId::new(node_id), identity.id());
        let node = StrandNode::new(
            identity,
            NodeId::new(node_id),
            StrandConfig::default().with_sync_interval(Duration::from_millis(20)),
            env.clone(),
            Arc::new(MemoryStore::new()),
            Arc::new(transport),
        );
        let handle = start_receive_loop(Arc::clone(network), NodeId::new(node_id), rx, node.clone());
        (node, handle)
    }

    #[tokio::test]
    async fn test_create_board() {
        let network = LoopbackNetwork::new();
        let env = Env::deterministic(Timestamp::from_secs(1_000), 31);
        let (alice, _rx) = node(&network, &env, 1);
        alice.create_identity().await.unwrap();

        let slot = alice.create_board("plans").await.unwrap();
        assert_eq!(slot.entity().meta().status, EntityStatus::Alive);
        assert!(slot.pm().is_master(&alice.my_id()));
        assert!(slot.is_started());

        // The identity recorded the creation
        let me = alice.me().unwrap();
        assert_eq!(me.info().joined, vec![slot.id()]);
        assert_eq!(slot.entity().meta().me_log_id, me.info().log_id);
        alice.shutdown();
    }

    #[tokio::test]
    async fn test_invite_and_sync_content() {
        let network = LoopbackNetwork::new();
        let env = Env::deterministic(Timestamp::from_secs(1_000), 32);
        let (alice, _a) = node(&network, &env, 1);
        let (bob, _b) = node(&network, &env, 2);

        let board = alice.create_board("shared").await.unwrap();
        alice.add_member(&board.id(), bob.my_id()).unwrap();
        alice
            .invite(&board.id(), network.peer(NodeId::new(1), NodeId::new(2)))
            .await
            .unwrap();

        let mut joined = None;
        for _ in 0..50 {
            if let Some(slot) = bob.registry().get(&board.id()) {
                joined = Some(slot);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let bob_board = joined.expect("bob admitted the board");
        assert!(bob_board.pm().members().is_member(&bob.my_id()));
        assert_eq!(bob_board.pm().master_list(false).unwrap()[0].id, alice.my_id());

        alice.post(&board.id(), "hello").await.unwrap();
        let mut seen = false;
        for _ in 0..50 {
            if bob_board.pm().objects().objects().len() == 2 {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(seen, "content did not reach bob");
        alice.shutdown();
        bob.shutdown();
    }
}
