//! Identity layer
//!
//! One logical identity ("Me") runs on several devices. Its own entity holds
//! a chain of me-oplogs recording which entities it created or joined and
//! which devices it runs on. `MyInfo` is a fold over that chain.
//!
//! A device that receives a `CreateEntity` or `JoinEntity` log for an entity
//! it does not hold admits the embedded bundle with the log attached, so the
//! replay never writes a second me-oplog.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use strand_core::{
    EntityStatus, Id, JoinBundle, NodeId, Op, Oplog, OplogCategory, StrandError, StrandResult, Timestamp,
};
use strand_crypto::{Identity, OpKeyCipher};
use strand_store::{get_json, me_key, put_json, Durability, KvStore};
use strand_sync::{MergeReport, OplogHandler, ProtocolManager, SyncContext};
use strand_transport::PeerMessage;

use crate::{Entity, JoinHook, JoinOptions, JoinOrchestrator};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeStatus {
    /// Announced, handshake not yet confirmed
    Init,
    Alive,
}

/// One device of the identity; never removed
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MyNode {
    pub node_id: NodeId,
    pub status: NodeStatus,
    pub join_ts: Timestamp,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MyInfo {
    pub id: Id,
    pub status: EntityStatus,
    pub owner_ids: Vec<Id>,
    /// The identity's own entity, holding its me-oplogs
    pub board_id: Id,
    /// Latest applied me-oplog
    pub log_id: Id,
    /// Entities recorded by CreateEntity/JoinEntity logs
    pub joined: Vec<Id>,
    pub nodes: Vec<MyNode>,
}

impl MyInfo {
    pub fn node(&self, node_id: NodeId) -> Option<&MyNode> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }
}

/// Payload of `CreateMe`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateMePayload {
    pub board_id: Id,
}

/// Payload of `MigrateMe`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrateMePayload {
    pub new_owner: Id,
}

/// Payload of `AddDevice`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevicePayload {
    pub node_id: NodeId,
    pub confirmed: bool,
}

/// Object ID of a device's chain, created by `my_id`
pub fn device_object_id(my_id: &Id, node_id: NodeId) -> Id {
    Id::with_creator(&node_id.suffix(), my_id)
}

/// Me-oplog projection
pub struct MyInfoProjection {
    my_id: Id,
    store: Arc<dyn KvStore>,
    info: RwLock<MyInfo>,
}

impl MyInfoProjection {
    pub fn new(my_id: Id, board_id: Id, store: Arc<dyn KvStore>) -> Self {
        MyInfoProjection {
            my_id,
            store,
            info: RwLock::new(MyInfo {
                id: my_id,
                board_id,
                ..Default::default()
            }),
        }
    }

    pub fn info(&self) -> MyInfo {
        self.info.read().clone()
    }

    fn save(&self, info: &MyInfo) -> StrandResult<()> {
        put_json(self.store.as_ref(), &me_key(&self.my_id), info, Durability::Batched)
    }
}

impl OplogHandler for MyInfoProjection {
    fn category(&self) -> OplogCategory {
        OplogCategory::Me
    }

    fn validate(&self, log: &Oplog) -> StrandResult<()> {
        match log.op {
            Op::CreateMe => {
                if !log.is_root() || log.obj_id != log.creator_id {
                    return Err(StrandError::BrokenChain(log.id));
                }
                log.extra_as::<CreateMePayload>()?;
            }
            Op::CreateEntity | Op::JoinEntity => {
                let bundle: JoinBundle = log.extra_as()?;
                if bundle.entity_id() != log.obj_id {
                    return Err(StrandError::InvalidBundle(format!(
                        "me-oplog {:?} embeds entity {:?}",
                        log.id,
                        bundle.entity_id()
                    )));
                }
            }
            Op::AddDevice => {
                let device: DevicePayload = log.extra_as()?;
                if device_object_id(&log.creator_id, device.node_id) != log.obj_id {
                    return Err(StrandError::InvalidOp {
                        op: log.op,
                        category: OplogCategory::Me,
                    });
                }
            }
            Op::MigrateMe => {
                log.extra_as::<MigrateMePayload>()?;
            }
            _ => {}
        }
        Ok(())
    }

    fn apply(&self, obj_id: &Id, chain: &[&Oplog]) -> StrandResult<()> {
        let (Some(root), Some(head)) = (chain.first(), chain.last()) else {
            return Ok(());
        };

        let mut info = self.info.write();
        match root.op {
            Op::CreateMe => {
                for log in chain {
                    match log.op {
                        Op::CreateMe => {
                            let payload: CreateMePayload = log.extra_as()?;
                            info.id = *obj_id;
                            info.status = EntityStatus::Alive;
                            info.board_id = payload.board_id;
                            if !info.owner_ids.contains(&log.creator_id) {
                                info.owner_ids.push(log.creator_id);
                            }
                        }
                        Op::MigrateMe => {
                            let payload: MigrateMePayload = log.extra_as()?;
                            info.status = EntityStatus::Migrated;
                            if !info.owner_ids.contains(&payload.new_owner) {
                                info.owner_ids.push(payload.new_owner);
                            }
                        }
                        _ => {}
                    }
                }
            }
            Op::CreateEntity | Op::JoinEntity => {
                if !info.joined.contains(obj_id) {
                    info.joined.push(*obj_id);
                }
            }
            Op::AddDevice => {
                let device: DevicePayload = head.extra_as()?;
                let confirmed = chain
                    .iter()
                    .filter_map(|log| log.extra_as::<DevicePayload>().ok())
                    .any(|d| d.confirmed);
                let status = if confirmed { NodeStatus::Alive } else { NodeStatus::Init };
                match info.nodes.iter_mut().find(|n| n.node_id == device.node_id) {
                    // A confirmed device stays confirmed
                    Some(node) if node.status == NodeStatus::Alive => {}
                    Some(node) => node.status = status,
                    None => info.nodes.push(MyNode {
                        node_id: device.node_id,
                        status,
                        join_ts: root.create_ts,
                    }),
                }
            }
            op => {
                return Err(StrandError::InvalidOp {
                    op,
                    category: OplogCategory::Me,
                })
            }
        }
        info.log_id = head.id;
        self.save(&info)
    }

    fn reload(&self) -> StrandResult<()> {
        if let Some(stored) = get_json::<MyInfo>(self.store.as_ref(), &me_key(&self.my_id))? {
            *self.info.write() = stored;
        }
        Ok(())
    }
}

/// The local device's view of its identity
pub struct MyEntity {
    identity: Arc<Identity>,
    node_id: NodeId,
    pm: Arc<ProtocolManager>,
    info: Arc<MyInfoProjection>,
    orchestrator: Arc<JoinOrchestrator>,
}

impl MyEntity {
    fn open(
        identity: Arc<Identity>,
        node_id: NodeId,
        me_entity_id: Id,
        orchestrator: Arc<JoinOrchestrator>,
    ) -> StrandResult<Arc<Self>> {
        let ctx: SyncContext = orchestrator.context().clone();
        let info = Arc::new(MyInfoProjection::new(identity.id(), me_entity_id, Arc::clone(&ctx.store)));
        let handler: Arc<dyn OplogHandler> = info.clone();
        let pm = Arc::new(ProtocolManager::open(me_entity_id, ctx, vec![handler])?);

        let me = Arc::new(MyEntity {
            identity,
            node_id,
            pm,
            info,
            orchestrator,
        });
        let hook: Arc<dyn JoinHook> = me.clone();
        me.orchestrator.set_hook(Arc::downgrade(&hook));
        Ok(me)
    }

    /// Start a new identity on this device
    pub async fn create(identity: Arc<Identity>, node_id: NodeId, orchestrator: Arc<JoinOrchestrator>) -> StrandResult<Arc<Self>> {
        let my_id = identity.id();
        let me_entity_id = orchestrator.context().env.new_id(&my_id);
        let me = Self::open(identity, node_id, me_entity_id, orchestrator)?;

        me.pm.author_genesis_master(&me.identity)?;
        me.pm.author(
            &me.identity,
            Op::CreateMe,
            my_id,
            &CreateMePayload {
                board_id: me_entity_id,
            },
        )?;
        me.add_device(node_id, true)?;
        me.register_self().await;

        tracing::info!(me = %my_id, board = %me_entity_id, node = %node_id, "Created identity");
        Ok(me)
    }

    /// Run an existing identity on an additional device
    ///
    /// The identity's history arrives through `MeOplogs` from its other devices.
    pub async fn attach(
        identity: Arc<Identity>,
        node_id: NodeId,
        me_entity_id: Id,
        orchestrator: Arc<JoinOrchestrator>,
    ) -> StrandResult<Arc<Self>> {
        let me = Self::open(identity, node_id, me_entity_id, orchestrator)?;
        me.register_self().await;
        tracing::info!(me = %me.my_id(), board = %me_entity_id, node = %node_id, "Attached identity");
        Ok(me)
    }

    /// Let broadcasts of the me entity reach the identity's other devices
    async fn register_self(&self) {
        let Some(master) = self.pm.masters().get(&self.my_id()) else {
            // Learned from the first incoming me-oplogs
            if let Err(e) = self.pm.transport().register_peer(self.pm.entity_id(), self.my_id()).await {
                tracing::warn!(me = %self.my_id(), error = %e, "Failed to register own devices");
            }
            return;
        };
        if let Err(e) = self.pm.register_master(&master, false).await {
            tracing::warn!(me = %self.my_id(), error = %e, "Failed to register own devices");
        }
    }

    #[inline]
    pub fn my_id(&self) -> Id {
        self.identity.id()
    }

    #[inline]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    pub fn me_entity_id(&self) -> Id {
        self.pm.entity_id()
    }

    pub fn pm(&self) -> &Arc<ProtocolManager> {
        &self.pm
    }

    pub fn info(&self) -> MyInfo {
        self.info.info()
    }

    /// Announce a device of this identity
    pub fn add_device(&self, node_id: NodeId, confirmed: bool) -> StrandResult<Oplog> {
        let obj_id = device_object_id(&self.my_id(), node_id);
        self.pm.author(&self.identity, Op::AddDevice, obj_id, &DevicePayload { node_id, confirmed })
    }

    /// Mark a device's handshake as confirmed
    pub fn confirm_node(&self, node_id: NodeId) -> StrandResult<Oplog> {
        if self.info().node(node_id).is_none() {
            return Err(StrandError::EntityNotFound(device_object_id(&self.my_id(), node_id)));
        }
        self.add_device(node_id, true)
    }

    /// Record that ownership moves to `new_owner`
    pub fn migrate_to(&self, new_owner: Id) -> StrandResult<Oplog> {
        self.pm.author(&self.identity, Op::MigrateMe, self.my_id(), &MigrateMePayload { new_owner })
    }

    /// Send the identity's history to its other devices
    pub async fn broadcast(&self, logs: Vec<Oplog>) -> StrandResult<usize> {
        let mut all = self.pm.logs(OplogCategory::Master);
        all.extend(logs);
        let message = self.seal_history(&all)?;
        self.pm.transport().broadcast(self.me_entity_id(), message).await
    }

    fn history_aad(&self) -> Vec<u8> {
        let mut aad = self.me_entity_id().as_bytes().to_vec();
        aad.extend_from_slice(OplogCategory::Me.name().as_bytes());
        aad
    }

    /// Encrypt me-oplogs for the identity's other devices
    pub fn seal_history(&self, logs: &[Oplog]) -> StrandResult<PeerMessage> {
        let plaintext = serde_json::to_vec(logs)?;
        let key = self.identity.device_key()?;
        let payload = OpKeyCipher::new(&key).seal(self.pm.env().random.as_ref(), &self.history_aad(), &plaintext)?;
        Ok(PeerMessage::MeOplogs {
            entity_id: self.me_entity_id(),
            payload,
        })
    }

    /// Decrypt a payload produced by `seal_history`
    pub fn open_history(&self, entity_id: Id, payload: &[u8]) -> StrandResult<Vec<Oplog>> {
        if entity_id != self.me_entity_id() {
            return Err(StrandError::EntityNotFound(entity_id));
        }
        let key = self.identity.device_key()?;
        let plaintext = OpKeyCipher::new(&key).open(&self.history_aad(), payload)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    /// Full me-oplog history, masters first
    pub fn history(&self) -> Vec<Oplog> {
        let mut logs = self.pm.logs(OplogCategory::Master);
        logs.extend(self.pm.logs(OplogCategory::Me));
        logs
    }

    /// Merge me-oplogs from another device, then admit entities they record
    pub async fn handle_me_oplogs(&self, logs: Vec<Oplog>, peer: Option<NodeId>) -> StrandResult<MergeReport> {
        let (masters, rest): (Vec<Oplog>, Vec<Oplog>) =
            logs.into_iter().partition(|log| log.category() == OplogCategory::Master);
        let mut report = self.pm.merge_logs(OplogCategory::Master, masters, peer)?;
        let me_logs: Vec<Oplog> = rest.into_iter().filter(|log| log.category() == OplogCategory::Me).collect();
        report.absorb(&self.pm.merge_logs(OplogCategory::Me, me_logs, peer)?);

        self.register_self().await;
        self.replay_joins().await;
        Ok(report)
    }

    /// Admit every recorded entity this device does not hold yet
    pub async fn replay_joins(&self) -> usize {
        let registry = Arc::clone(self.orchestrator.registry());
        let recorded: Vec<Oplog> = self
            .pm
            .logs(OplogCategory::Me)
            .into_iter()
            .filter(|log| log.is_newer && matches!(log.op, Op::CreateEntity | Op::JoinEntity))
            .filter(|log| !registry.contains(&log.obj_id))
            .collect();

        let mut admitted = 0;
        for me_log in recorded {
            let bundle: JoinBundle = match me_log.extra_as() {
                Ok(bundle) => bundle,
                Err(e) => {
                    tracing::warn!(me_log = ?me_log.id, error = %e, "Undecodable join record");
                    continue;
                }
            };
            let entity_id = bundle.entity_id();
            let opts = JoinOptions::new().new_entity().started().with_me_log(me_log);
            match self.orchestrator.create_join_entity(bundle, None, opts).await {
                Ok(_) => admitted += 1,
                Err(e) => tracing::warn!(entity = %entity_id, error = %e, "Failed to replay join"),
            }
        }
        admitted
    }
}

#[async_trait]
impl JoinHook for MyEntity {
    async fn create_join_entity_oplog(&self, entity: &dyn Entity) -> StrandResult<()> {
        let entity_id = entity.id();
        let slot = self
            .orchestrator
            .registry()
            .get(&entity_id)
            .ok_or(StrandError::EntityNotFound(entity_id))?;
        let bundle = slot.pm().export_bundle(entity.to_record()?)?;

        let op = if entity.meta().creator_id == self.my_id() {
            Op::CreateEntity
        } else {
            Op::JoinEntity
        };
        let log = self.pm.author(&self.identity, op, entity_id, &bundle)?;

        let store = Arc::clone(&self.orchestrator.context().store);
        slot.update(|e| {
            let meta = e.meta_mut();
            meta.me_log_id = log.id;
            meta.me_log_ts = log.update_ts;
            e.save(store.as_ref(), false)
        })?;

        match self.broadcast(vec![log.clone()]).await {
            Ok(reached) => tracing::debug!(entity = %entity_id, devices = reached, "Broadcast join record"),
            Err(e) => tracing::warn!(entity = %entity_id, error = %e, "Failed to broadcast join record"),
        }
        Ok(())
    }
}

impl std::fmt::Debug for MyEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MyEntity")
            .field("my_id", &self.my_id())
            .field("node_id", &self.node_id)
            .field("me_entity_id", &self.me_entity_id())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use strand_store::MemoryStore;
    use strand_time::Env;
    use strand_transport::NullTransport;

    use crate::{EntityRegistry, SyncSettings};

    fn orchestrator(env: &Env, identity: &Arc<Identity>) -> Arc<JoinOrchestrator> {
        let ctx = SyncContext {
            env: env.clone(),
            store: Arc::new(MemoryStore::new()),
            transport: Arc::new(NullTransport),
            local: Some(identity.clone()),
            max_pending_logs: 64,
        };
        Arc::new(JoinOrchestrator::new(
            Arc::new(EntityRegistry::new(Duration::from_secs(1))),
            ctx,
            SyncSettings {
                interval: Duration::from_secs(60),
                op_key_ttl: Duration::from_secs(3600),
            },
        ))
    }

    #[tokio::test]
    async fn test_create_identity() {
        let env = Env::deterministic(Timestamp::from_secs(100), 9);
        let identity = Arc::new(Identity::generate(env.random.as_ref(), NodeId::new(1)));
        let me = MyEntity::create(identity.clone(), NodeId::new(1), orchestrator(&env, &identity))
            .await
            .unwrap();

        let info = me.info();
        assert_eq!(info.id, identity.id());
        assert_eq!(info.status, EntityStatus::Alive);
        assert_eq!(info.owner_ids, vec![identity.id()]);
        assert_eq!(info.board_id, me.me_entity_id());
        assert_eq!(info.nodes.len(), 1);
        assert_eq!(info.nodes[0].status, NodeStatus::Alive);
    }

    #[tokio::test]
    async fn test_device_confirmation_is_sticky() {
        let env = Env::deterministic(Timestamp::from_secs(100), 9);
        let identity = Arc::new(Identity::generate(env.random.as_ref(), NodeId::new(1)));
        let me = MyEntity::create(identity.clone(), NodeId::new(1), orchestrator(&env, &identity))
            .await
            .unwrap();

        me.add_device(NodeId::new(2), false).unwrap();
        assert_eq!(me.info().node(NodeId::new(2)).unwrap().status, NodeStatus::Init);

        me.confirm_node(NodeId::new(2)).unwrap();
        assert_eq!(me.info().node(NodeId::new(2)).unwrap().status, NodeStatus::Alive);

        // A late unconfirmed announcement does not demote the device
        me.add_device(NodeId::new(2), false).unwrap();
        assert_eq!(me.info().node(NodeId::new(2)).unwrap().status, NodeStatus::Alive);
        assert_eq!(me.info().nodes.len(), 2);

        assert!(me.confirm_node(NodeId::new(9)).is_err());
    }

    #[tokio::test]
    async fn test_migrate() {
        let env = Env::deterministic(Timestamp::from_secs(100), 9);
        let identity = Arc::new(Identity::generate(env.random.as_ref(), NodeId::new(1)));
        let me = MyEntity::create(identity.clone(), NodeId::new(1), orchestrator(&env, &identity))
            .await
            .unwrap();
        let heir = Id::new([7; 32]);

        me.migrate_to(heir).unwrap();
        let info = me.info();
        assert_eq!(info.status, EntityStatus::Migrated);
        assert_eq!(info.owner_ids, vec![identity.id(), heir]);
    }

    #[tokio::test]
    async fn test_foreign_create_me_rejected() {
        let env = Env::deterministic(Timestamp::from_secs(100), 9);
        let identity = Arc::new(Identity::generate(env.random.as_ref(), NodeId::new(1)));
        let me = MyEntity::create(identity.clone(), NodeId::new(1), orchestrator(&env, &identity))
            .await
            .unwrap();

        let result = me.pm().author(&identity, Op::CreateMe, Id::new([3; 32]), &CreateMePayload { board_id: Id::NIL });
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_history_sealed_for_own_devices() {
        let env = Env::deterministic(Timestamp::from_secs(100), 9);
        let identity = Arc::new(Identity::generate(env.random.as_ref(), NodeId::new(1)));
        let me = MyEntity::create(identity.clone(), NodeId::new(1), orchestrator(&env, &identity))
            .await
            .unwrap();
        let history = me.history();

        let PeerMessage::MeOplogs { entity_id, payload } = me.seal_history(&history).unwrap() else {
            panic!("expected me-oplogs");
        };
        assert_eq!(entity_id, me.me_entity_id());
        assert!(serde_json::from_slice::<Vec<Oplog>>(&payload).is_err());
        assert_eq!(me.open_history(entity_id, &payload).unwrap(), history);

        // Another identity cannot read it
        let stranger = Arc::new(Identity::generate(env.random.as_ref(), NodeId::new(2)));
        let other = MyEntity::attach(stranger.clone(), NodeId::new(2), entity_id, orchestrator(&env, &stranger))
            .await
            .unwrap();
        assert!(matches!(other.open_history(entity_id, &payload), Err(StrandError::DecryptionFailed)));
        assert!(me.open_history(Id::new([1; 32]), &payload).is_err());
    }
}
