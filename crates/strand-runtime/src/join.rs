//! Entity join orchestration
//!
//! `create_join_entity` admits a join bundle under the entity lock: it merges
//! the bundle's master and member history, re-registers live masters, binds
//! the genesis log and op key, and finally publishes the entity in the
//! registry. Nothing is registered unless every step up to the op-key
//! registration succeeded.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;

use strand_core::{EntityStatus, JoinBundle, Oplog, StrandResult, Timestamp};
use strand_sync::{ProtocolManager, SyncContext};
use strand_transport::Peer;

use crate::{decode_entity, start_sync_service, Entity, EntityRegistry, EntitySlot, SyncSettings};

/// Identity-level follow-up of a join
#[async_trait]
pub trait JoinHook: Send + Sync {
    /// Record that the local identity now holds `entity`
    async fn create_join_entity_oplog(&self, entity: &dyn Entity) -> StrandResult<()>;
}

/// Flags of one admission
#[derive(Clone, Debug, Default)]
pub struct JoinOptions {
    /// Identity log that already records this join (replay on another device)
    pub me_log: Option<Oplog>,
    /// Start the entity's sync service
    pub is_start: bool,
    /// Admission of an entity not yet known locally
    pub is_new: bool,
    /// Never write the identity-level log
    pub is_force_not_broadcast: bool,
    /// The caller already holds the entity lock
    pub is_locked: bool,
}

impl JoinOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_me_log(mut self, log: Oplog) -> Self {
        self.me_log = Some(log);
        self
    }

    pub fn started(mut self) -> Self {
        self.is_start = true;
        self
    }

    pub fn new_entity(mut self) -> Self {
        self.is_new = true;
        self
    }

    pub fn not_broadcast(mut self) -> Self {
        self.is_force_not_broadcast = true;
        self
    }

    pub fn locked(mut self) -> Self {
        self.is_locked = true;
        self
    }
}

/// Admits join bundles into the entity registry
pub struct JoinOrchestrator {
    registry: Arc<EntityRegistry>,
    ctx: SyncContext,
    settings: SyncSettings,
    hook: RwLock<Option<Weak<dyn JoinHook>>>,
}

impl JoinOrchestrator {
    pub fn new(registry: Arc<EntityRegistry>, ctx: SyncContext, settings: SyncSettings) -> Self {
        JoinOrchestrator {
            registry,
            ctx,
            settings,
            hook: RwLock::new(None),
        }
    }

    /// Install the identity hook; held weakly since the hook owns the orchestrator
    pub fn set_hook(&self, hook: Weak<dyn JoinHook>) {
        *self.hook.write() = Some(hook);
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    fn hook(&self) -> Option<Arc<dyn JoinHook>> {
        self.hook.read().as_ref().and_then(Weak::upgrade)
    }

    /// Admit `bundle`, returning the registered entity
    pub async fn create_join_entity(
        &self,
        bundle: JoinBundle,
        peer: Option<Arc<dyn Peer>>,
        opts: JoinOptions,
    ) -> StrandResult<Arc<EntitySlot>> {
        bundle.check()?;
        let entity_id = bundle.entity_id();
        let peer_node = peer.as_ref().map(|p| p.node_id());
        let store = Arc::clone(&self.ctx.store);

        // 1. lock, released on every exit
        let guard = if opts.is_locked {
            None
        } else {
            Some(self.registry.lock(entity_id).await?)
        };

        // 2. a repeated first admission refreshes the registered entity
        let existing = self.registry.get(&entity_id);
        let is_refresh = opts.is_new && existing.is_some();
        let mut entity: Box<dyn Entity> = match &existing {
            Some(slot) if opts.is_new => slot.entity(),
            _ => decode_entity(bundle.entity.clone())?,
        };
        if existing.is_none() {
            let ts = entity.meta().update_ts;
            entity.set_status(EntityStatus::Init, ts);
        }

        // 3. join time
        let now = self.ctx.env.now();
        {
            let meta = entity.meta_mut();
            match &opts.me_log {
                None => meta.join_ts = now,
                Some(me_log) => {
                    meta.join_ts = me_log.update_ts;
                    meta.me_log_ts = me_log.update_ts;
                    meta.me_log_id = me_log.id;
                }
            }
            // 4. pending-sync marker is obsolete once the bundle is in hand
            meta.sync_info = None;
        }
        entity.save(store.as_ref(), true)?;

        // 5. first admission wires a protocol manager
        let pm = match &existing {
            Some(slot) => Arc::clone(slot.pm()),
            None => {
                let handlers = entity.handlers(&store);
                let pm = Arc::new(ProtocolManager::open(entity_id, self.ctx.clone(), handlers)?);
                entity.init(&pm)?;
                pm
            }
        };

        // 6. masters before members
        let masters = pm.handle_master_oplogs(bundle.master_logs, peer_node)?;
        let members = pm.handle_member_oplogs(bundle.member_logs, peer_node)?;
        tracing::debug!(
            entity = %entity_id,
            masters_applied = masters.applied,
            masters_rejected = masters.rejected,
            members_applied = members.applied,
            members_rejected = members.rejected,
            "Merged join bundle history"
        );

        // 7. full member resync from the start
        pm.set_member_sync_time(Timestamp::ZERO)?;

        // 8. live master sessions
        for master in pm.master_list(true)? {
            if let Err(e) = pm.register_master(&master, opts.is_start).await {
                tracing::warn!(entity = %entity_id, master = ?master.id, error = %e, "Failed to register master");
            }
        }

        // 9. genesis log and op key
        pm.set_log0(&bundle.oplog0)?;
        pm.set_op_key(&bundle.op_key, &bundle.op_key_log)?;

        // 10.
        pm.register_op_key(bundle.op_key.clone())?;

        // 11. publish
        entity.set_status(EntityStatus::Alive, self.ctx.env.now());
        let slot = match existing {
            Some(slot) => {
                slot.replace(entity.clone_box());
                slot
            }
            None => Arc::new(EntitySlot::new(entity.clone_box(), Arc::clone(&pm))),
        };
        self.registry.insert(Arc::clone(&slot))?;
        entity.save(store.as_ref(), true)?;
        tracing::info!(entity = %entity_id, kind = entity.kind(), refresh = is_refresh, "Admitted entity");

        // 12.
        if opts.is_start && !slot.is_started() {
            slot.set_service(start_sync_service(pm, self.ctx.local.clone(), self.settings.clone()));
        }
        drop(guard);

        // 13.
        if opts.me_log.is_some() || opts.is_force_not_broadcast {
            return Ok(slot);
        }

        // 14. a refresh was already recorded by the first admission
        if is_refresh {
            return Ok(slot);
        }
        match self.hook() {
            Some(hook) => {
                if let Err(e) = hook.create_join_entity_oplog(&*entity).await {
                    tracing::warn!(entity = %entity_id, error = %e, "Failed to record join in identity log");
                }
            }
            None => tracing::debug!(entity = %entity_id, "No identity hook installed"),
        }
        Ok(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use parking_lot::Mutex;
    use strand_core::{EntityMeta, EntityRecord, EntityType, Id, NodeId, Op, StrandError};
    use strand_crypto::Identity;
    use strand_store::MemoryStore;
    use strand_time::Env;
    use strand_transport::NullTransport;

    use crate::Board;

    struct CountingHook {
        entities: Mutex<Vec<Id>>,
    }

    #[async_trait]
    impl JoinHook for CountingHook {
        async fn create_join_entity_oplog(&self, entity: &dyn Entity) -> StrandResult<()> {
            self.entities.lock().push(entity.id());
            Ok(())
        }
    }

    struct Fixture {
        env: Env,
        owner: Arc<Identity>,
        orchestrator: JoinOrchestrator,
        hook: Arc<CountingHook>,
    }

    fn fixture() -> Fixture {
        let env = Env::deterministic(Timestamp::from_secs(10_000), 21);
        let owner = Arc::new(Identity::generate(env.random.as_ref(), NodeId::new(1)));
        let ctx = SyncContext {
            env: env.clone(),
            store: Arc::new(MemoryStore::new()),
            transport: Arc::new(NullTransport),
            local: Some(owner.clone()),
            max_pending_logs: 64,
        };
        let registry = Arc::new(EntityRegistry::new(Duration::from_millis(200)));
        let orchestrator = JoinOrchestrator::new(
            registry,
            ctx,
            SyncSettings {
                interval: Duration::from_secs(60),
                op_key_ttl: Duration::from_secs(3600),
            },
        );
        let hook = Arc::new(CountingHook {
            entities: Mutex::new(Vec::new()),
        });
        let weak: Weak<dyn JoinHook> = Arc::downgrade(&(hook.clone() as Arc<dyn JoinHook>));
        orchestrator.set_hook(weak);
        Fixture {
            env,
            owner,
            orchestrator,
            hook,
        }
    }

    /// Genesis bundle built on a scratch store
    fn bundle(f: &Fixture) -> JoinBundle {
        let entity_id = f.env.new_id(&f.owner.id());
        let ctx = SyncContext {
            env: f.env.clone(),
            store: Arc::new(MemoryStore::new()),
            transport: Arc::new(NullTransport),
            local: Some(f.owner.clone()),
            max_pending_logs: 64,
        };
        let pm = ProtocolManager::open(entity_id, ctx, Vec::new()).unwrap();
        pm.author_genesis_master(&f.owner).unwrap();
        pm.author(&f.owner, Op::AddMember, f.owner.id(), &()).unwrap();
        let log0 = pm.author(&f.owner, Op::CreateObject, entity_id, "genesis").unwrap();
        pm.set_log0(&log0).unwrap();
        let (key, key_log) = pm.new_op_key(&f.owner, Duration::from_secs(3600)).unwrap();
        pm.set_op_key(&key, &key_log).unwrap();

        let meta = EntityMeta::new(entity_id, f.owner.id(), EntityType::Group, f.env.now());
        let record = Board::new(meta, "plans").to_record().unwrap();
        pm.export_bundle(record).unwrap()
    }

    #[tokio::test]
    async fn test_first_admission() {
        let f = fixture();
        let bundle = bundle(&f);
        let entity_id = bundle.entity_id();

        let slot = f
            .orchestrator
            .create_join_entity(bundle, None, JoinOptions::new().new_entity())
            .await
            .unwrap();

        assert_eq!(slot.entity().meta().status, EntityStatus::Alive);
        assert!(f.orchestrator.registry().contains(&entity_id));
        assert_eq!(slot.pm().master_list(false).unwrap().len(), 1);
        assert!(slot.pm().members().is_member(&f.owner.id()));
        assert!(slot.pm().log0().is_some());
        assert_eq!(slot.pm().member_sync_time(), Timestamp::ZERO);
        assert_eq!(*f.hook.entities.lock(), vec![entity_id]);
    }

    #[tokio::test]
    async fn test_repeat_admission_is_refresh() {
        let f = fixture();
        let bundle = bundle(&f);
        let opts = JoinOptions::new().new_entity();

        let first = f.orchestrator.create_join_entity(bundle.clone(), None, opts.clone()).await.unwrap();
        let second = f.orchestrator.create_join_entity(bundle, None, opts).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(f.orchestrator.registry().len(), 1);
        assert_eq!(f.hook.entities.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_me_log_sets_join_time_and_skips_hook() {
        let f = fixture();
        let bundle = bundle(&f);
        let mut me_log = bundle.oplog0.clone();
        me_log.update_ts = Timestamp::from_secs(42);

        let slot = f
            .orchestrator
            .create_join_entity(bundle, None, JoinOptions::new().new_entity().with_me_log(me_log.clone()))
            .await
            .unwrap();

        let meta = slot.entity().meta().clone();
        assert_eq!(meta.join_ts, Timestamp::from_secs(42));
        assert_eq!(meta.me_log_ts, Timestamp::from_secs(42));
        assert_eq!(meta.me_log_id, me_log.id);
        assert!(f.hook.entities.lock().is_empty());
    }

    #[tokio::test]
    async fn test_forged_genesis_registers_nothing() {
        let f = fixture();
        let mut bundle = bundle(&f);
        bundle.oplog0.extra = b"\"tampered\"".to_vec();

        let result = f.orchestrator.create_join_entity(bundle.clone(), None, JoinOptions::new()).await;
        assert!(matches!(result, Err(StrandError::InvalidBundle(_))));
        assert!(!f.orchestrator.registry().contains(&bundle.entity_id()));
    }

    #[tokio::test]
    async fn test_lock_held_by_caller_times_out() {
        let f = fixture();
        let bundle = bundle(&f);
        let _held = f.orchestrator.registry().lock(bundle.entity_id()).await.unwrap();

        let result = f.orchestrator.create_join_entity(bundle.clone(), None, JoinOptions::new()).await;
        assert!(matches!(result, Err(StrandError::LockTimeout(_))));

        // The holder can admit with `is_locked`
        let slot = f
            .orchestrator
            .create_join_entity(bundle, None, JoinOptions::new().locked().not_broadcast())
            .await
            .unwrap();
        assert_eq!(slot.entity().meta().status, EntityStatus::Alive);
        assert!(f.hook.entities.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_kind_rejected() {
        let f = fixture();
        let mut bundle = bundle(&f);
        bundle.entity = EntityRecord {
            kind: "calendar".into(),
            ..bundle.entity
        };
        let result = f.orchestrator.create_join_entity(bundle, None, JoinOptions::new()).await;
        assert!(matches!(result, Err(StrandError::UnknownEntityKind(_))));
    }
}
