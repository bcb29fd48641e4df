//! Protocol manager
//!
//! Bundles the merger and the projections of one entity. The manager holds
//! only the entity ID; the entity itself lives in the runtime's registry.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use strand_core::{
    EntityRecord, Id, JoinBundle, NodeId, Op, OpKey, Oplog, OplogCategory, StrandError, StrandResult, Timestamp,
};
use strand_crypto::{op_key_hash, Identity, KeyChain, OpKeyCipher};
use strand_store::{get_json, oplog_prefix, put_json, ref_key, scan_json, Durability, KvStore};
use strand_time::Env;
use strand_transport::{PeerMessage, Transport};

use crate::{
    save_op_key, Admission, ChainPosition, Master, MasterRegistry, MemberRegistry, MergeReport, ObjectProjection,
    OpKeyPayload, OpKeyRegistry, OplogBuilder, OplogHandler, OplogMerger,
};

/// Default bound of each pending buffer
pub const DEFAULT_MAX_PENDING_LOGS: usize = 1024;

/// Shared services a protocol manager is built from
#[derive(Clone)]
pub struct SyncContext {
    pub env: Env,
    pub store: Arc<dyn KvStore>,
    pub transport: Arc<dyn Transport>,
    /// Local identity, co-signs while it is a master
    pub local: Option<Arc<Identity>>,
    pub max_pending_logs: usize,
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("local", &self.local.as_ref().map(|i| i.id()))
            .field("max_pending_logs", &self.max_pending_logs)
            .finish_non_exhaustive()
    }
}

/// Persisted references of an entity
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
struct EntityRefs {
    member_sync_ts: Timestamp,
    log0: Option<(OplogCategory, Id)>,
    op_key: Option<Id>,
}

/// Per-entity protocol manager
pub struct ProtocolManager {
    entity_id: Id,
    ctx: SyncContext,
    merger: Mutex<OplogMerger>,
    masters: Arc<MasterRegistry>,
    members: Arc<MemberRegistry>,
    op_keys: Arc<OpKeyRegistry>,
    objects: Arc<ObjectProjection>,
    handlers: Vec<Arc<dyn OplogHandler>>,
    refs: RwLock<EntityRefs>,
    key_chain: Mutex<Option<KeyChain>>,
}

impl ProtocolManager {
    /// Build the manager of `entity_id` and reload its persisted state
    ///
    /// `extra_handlers` replace the default handler of their category.
    pub fn open(entity_id: Id, ctx: SyncContext, extra_handlers: Vec<Arc<dyn OplogHandler>>) -> StrandResult<Self> {
        let local_id = ctx.local.as_ref().map(|identity| identity.id());
        let masters = Arc::new(MasterRegistry::new(
            entity_id,
            local_id,
            Arc::clone(&ctx.store),
            Arc::clone(&ctx.transport),
        ));
        let members = Arc::new(MemberRegistry::new(entity_id, Arc::clone(&ctx.store)));
        let op_keys = Arc::new(OpKeyRegistry::new(entity_id, Arc::clone(&ctx.store)));
        let objects = Arc::new(ObjectProjection::new(entity_id, Arc::clone(&ctx.store)));

        let mut handlers: Vec<Arc<dyn OplogHandler>> = vec![
            masters.clone(),
            members.clone(),
            op_keys.clone(),
            objects.clone(),
        ];
        for extra in extra_handlers {
            handlers.retain(|h| h.category() != extra.category());
            handlers.push(extra);
        }

        let mut merger = OplogMerger::new(
            entity_id,
            Arc::clone(&ctx.store),
            Arc::clone(&ctx.env.clock),
            ctx.max_pending_logs,
        );
        for handler in &handlers {
            merger.set_handler(Arc::clone(handler));
        }
        merger.set_cosigner(ctx.local.clone());

        let pm = ProtocolManager {
            entity_id,
            ctx,
            merger: Mutex::new(merger),
            masters,
            members,
            op_keys,
            objects,
            handlers,
            refs: RwLock::new(EntityRefs::default()),
            key_chain: Mutex::new(None),
        };
        pm.reload()?;
        Ok(pm)
    }

    /// Rebuild chain indexes, projections and references from the store
    pub fn reload(&self) -> StrandResult<()> {
        let store = self.ctx.store.as_ref();
        let mut restored = 0usize;
        {
            let mut merger = self.merger.lock();
            for category in OplogCategory::ALL {
                let logs: Vec<Oplog> = scan_json(store, &oplog_prefix(&self.entity_id, category))?;
                restored += logs.len();
                merger.restore(category, logs)?;
            }
        }
        for handler in &self.handlers {
            handler.reload()?;
        }
        {
            let merger = self.merger.lock();
            self.op_keys
                .retain_logged(|log_id| merger.contains(OplogCategory::OpKey, log_id));
        }
        if let Some(refs) = get_json::<EntityRefs>(store, &ref_key(&self.entity_id, "refs"))? {
            *self.refs.write() = refs;
        }

        if restored > 0 {
            tracing::info!(entity = %self.entity_id, logs = restored, "Reloaded entity state");
        }
        Ok(())
    }

    #[inline]
    pub fn entity_id(&self) -> Id {
        self.entity_id
    }

    #[inline]
    pub fn env(&self) -> &Env {
        &self.ctx.env
    }

    pub fn members(&self) -> &MemberRegistry {
        &self.members
    }

    pub fn objects(&self) -> &ObjectProjection {
        &self.objects
    }

    pub fn op_keys(&self) -> &OpKeyRegistry {
        &self.op_keys
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.ctx.transport
    }

    fn save_refs(&self, durability: Durability) -> StrandResult<()> {
        let refs = self.refs.read().clone();
        put_json(self.ctx.store.as_ref(), &ref_key(&self.entity_id, "refs"), &refs, durability)
    }

    // -- merge ----------------------------------------------------------

    /// Merge a batch of one category
    pub fn merge_logs(&self, category: OplogCategory, logs: Vec<Oplog>, peer: Option<NodeId>) -> StrandResult<MergeReport> {
        self.merger.lock().merge(category, logs, peer)
    }

    pub fn handle_master_oplogs(&self, logs: Vec<Oplog>, peer: Option<NodeId>) -> StrandResult<MergeReport> {
        self.merge_logs(OplogCategory::Master, logs, peer)
    }

    /// Merge member logs and advance the member-sync cursor
    pub fn handle_member_oplogs(&self, logs: Vec<Oplog>, peer: Option<NodeId>) -> StrandResult<MergeReport> {
        let report = self.merge_logs(OplogCategory::Member, logs, peer)?;
        if report.applied > 0 {
            let newest = self
                .merger
                .lock()
                .chain(OplogCategory::Member)
                .map_or(Timestamp::ZERO, |chain| chain.max_create_ts());
            if newest > self.member_sync_time() {
                self.set_member_sync_time(newest)?;
            }
        }
        Ok(report)
    }

    pub fn set_member_sync_time(&self, ts: Timestamp) -> StrandResult<()> {
        self.refs.write().member_sync_ts = ts;
        self.save_refs(Durability::Batched)
    }

    pub fn member_sync_time(&self) -> Timestamp {
        self.refs.read().member_sync_ts
    }

    // -- masters and keys -----------------------------------------------

    pub fn master_list(&self, force_reload: bool) -> StrandResult<Vec<Master>> {
        self.masters.master_list(force_reload)
    }

    pub fn masters(&self) -> &MasterRegistry {
        &self.masters
    }

    pub async fn register_master(&self, master: &Master, is_start: bool) -> StrandResult<()> {
        self.masters.register_master(master, is_start).await
    }

    pub fn is_master(&self, id: &Id) -> bool {
        self.merger.lock().is_current_master(id)
    }

    pub fn register_op_key(&self, key: OpKey) -> StrandResult<()> {
        self.op_keys.register_op_key(key)
    }

    /// Merge `log` and fail unless it ends up applied
    fn merge_required(&self, category: OplogCategory, log: &Oplog, what: &str) -> StrandResult<()> {
        let report = self.merge_logs(category, vec![log.clone()], None)?;
        if !self.merger.lock().contains(category, &log.id) {
            let reason = if report.buffered > 0 { "waits on a missing dependency" } else { "was rejected" };
            return Err(StrandError::InvalidBundle(format!("{} {:?} {}", what, log.id, reason)));
        }
        Ok(())
    }

    /// Merge the genesis log and bind it as the entity's log0
    pub fn set_log0(&self, log: &Oplog) -> StrandResult<()> {
        let category = log.category();
        self.merge_required(category, log, "genesis log")?;

        self.refs.write().log0 = Some((category, log.id));
        self.save_refs(Durability::Important)
    }

    pub fn log0(&self) -> Option<Oplog> {
        let (category, id) = self.refs.read().log0?;
        self.merger.lock().get(category, &id).cloned()
    }

    /// Merge the log that introduced `key`, then persist and bind the key
    pub fn set_op_key(&self, key: &OpKey, log: &Oplog) -> StrandResult<()> {
        if key.log_id != log.id || key.hash != log.obj_id || key.entity_id != self.entity_id {
            return Err(StrandError::InvalidBundle(format!("op key {:?} does not match its log", key.hash)));
        }
        if op_key_hash(&key.key) != key.hash {
            return Err(StrandError::InvalidHash(key.hash));
        }
        self.merge_required(OplogCategory::OpKey, log, "op key log")?;
        save_op_key(self.ctx.store.as_ref(), key, true)?;

        self.refs.write().op_key = Some(key.hash);
        self.save_refs(Durability::Important)
    }

    pub fn op_key(&self) -> Option<OpKey> {
        let hash = self.refs.read().op_key?;
        self.op_keys.get(&hash)
    }

    // -- encrypted exchange ---------------------------------------------

    fn aad(&self, category: OplogCategory) -> Vec<u8> {
        let mut aad = self.entity_id.as_bytes().to_vec();
        aad.extend_from_slice(category.name().as_bytes());
        aad
    }

    /// Encrypt `logs` with the newest active op key
    pub fn seal_logs(&self, category: OplogCategory, logs: &[Oplog]) -> StrandResult<PeerMessage> {
        let key = self
            .op_keys
            .newest_active(self.ctx.env.now())
            .ok_or(StrandError::OpKeyNotFound(Id::NIL))?;
        self.seal_logs_with(&key, category, logs)
    }

    /// Encrypt `logs` with a specific, possibly expired, key
    ///
    /// Used to hand out a rotated key under the key peers already hold.
    pub fn seal_logs_with(&self, key: &OpKey, category: OplogCategory, logs: &[Oplog]) -> StrandResult<PeerMessage> {
        let plaintext = serde_json::to_vec(logs)?;
        let sealed = OpKeyCipher::new(&key.key).seal(self.ctx.env.random.as_ref(), &self.aad(category), &plaintext)?;

        let mut payload = key.hash.as_bytes().to_vec();
        payload.extend_from_slice(&sealed);
        Ok(PeerMessage::Oplogs {
            entity_id: self.entity_id,
            category,
            payload,
        })
    }

    /// Decrypt a payload produced by `seal_logs`
    pub fn open_logs(&self, category: OplogCategory, payload: &[u8]) -> StrandResult<Vec<Oplog>> {
        if payload.len() < 32 {
            return Err(StrandError::DecryptionFailed);
        }
        let (hash, sealed) = payload.split_at(32);
        let mut hash_bytes = [0u8; 32];
        hash_bytes.copy_from_slice(hash);
        let hash = Id::new(hash_bytes);

        let key = self.op_keys.get(&hash).ok_or(StrandError::OpKeyNotFound(hash))?;
        let plaintext = OpKeyCipher::new(&key.key).open(&self.aad(category), sealed)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    // -- queries --------------------------------------------------------

    /// Applied logs of a category, oldest first
    pub fn logs(&self, category: OplogCategory) -> Vec<Oplog> {
        self.merger
            .lock()
            .chain(category)
            .map(|chain| chain.sorted_logs().into_iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn logs_since(&self, category: OplogCategory, since: Timestamp) -> Vec<Oplog> {
        self.logs(category)
            .into_iter()
            .filter(|log| log.create_ts >= since)
            .collect()
    }

    /// Position to request the next sync from
    pub fn sync_cursor(&self, category: OplogCategory) -> Timestamp {
        match category {
            OplogCategory::Member => self.member_sync_time(),
            _ => self
                .merger
                .lock()
                .chain(category)
                .map_or(Timestamp::ZERO, |chain| chain.max_create_ts()),
        }
    }

    /// Applied log with `id` in any category
    pub fn oplog(&self, id: &Id) -> Option<Oplog> {
        let merger = self.merger.lock();
        OplogCategory::ALL
            .iter()
            .find_map(|category| merger.get(*category, id).cloned())
    }

    pub fn canonical_chain(&self, category: OplogCategory, obj_id: &Id) -> Vec<Oplog> {
        self.merger
            .lock()
            .chain(category)
            .map(|chain| chain.canonical_chain(obj_id).into_iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn head(&self, category: OplogCategory, obj_id: &Id) -> Option<Oplog> {
        self.merger.lock().head(category, obj_id).cloned()
    }

    pub fn walk_to_root(&self, category: OplogCategory, id: &Id) -> Option<Vec<Id>> {
        self.merger.lock().chain(category).and_then(|chain| chain.walk_to_root(id))
    }

    pub fn pending_len(&self, category: OplogCategory) -> usize {
        self.merger.lock().pending(category).map_or(0, |pending| pending.len())
    }

    /// Snapshot a device needs to admit this entity
    pub fn export_bundle(&self, entity: EntityRecord) -> StrandResult<JoinBundle> {
        if entity.meta.id != self.entity_id {
            return Err(StrandError::InvalidBundle("record of another entity".into()));
        }
        let oplog0 = self
            .log0()
            .ok_or_else(|| StrandError::InvalidBundle(format!("entity {:?} has no genesis log", self.entity_id)))?;
        let op_key = self
            .op_keys
            .newest_active(self.ctx.env.now())
            .or_else(|| self.op_key())
            .ok_or(StrandError::OpKeyNotFound(Id::NIL))?;
        let op_key_log = self.oplog(&op_key.log_id).ok_or(StrandError::MissingDependency(op_key.log_id))?;

        Ok(JoinBundle {
            entity,
            oplog0,
            master_logs: self.logs(OplogCategory::Master),
            member_logs: self.logs(OplogCategory::Member),
            op_key,
            op_key_log,
        })
    }

    // -- authoring ------------------------------------------------------

    fn admit_local(merger: &mut OplogMerger, log: Oplog) -> StrandResult<Oplog> {
        let category = log.category();
        match merger.admit(category, log.clone())? {
            Admission::Applied | Admission::Duplicate => Ok(log),
            Admission::Buffered { missing, .. } => Err(StrandError::MissingDependency(missing)),
            Admission::Rejected(e) => Err(e),
        }
    }

    /// Write the entity's self-authorized first AddMaster
    pub fn author_genesis_master(&self, identity: &Identity) -> StrandResult<Oplog> {
        let log = OplogBuilder::new(&self.ctx.env, identity).build(
            Op::AddMaster,
            identity.id(),
            ChainPosition::self_authorized(),
            &(),
        )?;
        Self::admit_local(&mut self.merger.lock(), log)
    }

    /// Write a log on top of `obj_id`'s canonical head
    ///
    /// `identity` must currently be a master of the entity.
    pub fn author<T: Serialize + ?Sized>(&self, identity: &Identity, op: Op, obj_id: Id, extra: &T) -> StrandResult<Oplog> {
        let creator = identity.id();
        let mut merger = self.merger.lock();
        let master_log_id = merger.master_log_for(&creator).ok_or(StrandError::UnauthorizedMaster {
            master_log_id: Id::NIL,
            creator_id: creator,
        })?;
        let pre_log_id = merger.head(op.category(), &obj_id).map_or(Id::NIL, |head| head.id);

        let log = OplogBuilder::new(&self.ctx.env, identity).build(
            op,
            obj_id,
            ChainPosition::after(pre_log_id, master_log_id),
            extra,
        )?;
        Self::admit_local(&mut merger, log)
    }

    /// Derive the next op key and write its `CreateOpKey` log
    pub fn new_op_key(&self, identity: &Identity, ttl: Duration) -> StrandResult<(OpKey, Oplog)> {
        let key = {
            let mut chain = self.key_chain.lock();
            match chain.as_mut() {
                Some(existing) => {
                    existing.advance()?;
                    existing.current_key()?
                }
                None => {
                    let fresh = KeyChain::new(&self.ctx.env.random.bytes32(), self.entity_id)?;
                    let key = fresh.current_key()?;
                    *chain = Some(fresh);
                    key
                }
            }
        };

        let hash = op_key_hash(&key);
        let payload = OpKeyPayload {
            key,
            expire_ts: self.ctx.env.now().saturating_add(ttl),
        };
        let log = self.author(identity, Op::CreateOpKey, hash, &payload)?;
        let op_key = self.op_keys.get(&hash).ok_or(StrandError::OpKeyNotFound(hash))?;
        tracing::info!(entity = %self.entity_id, key = ?hash, "Created op key");
        Ok((op_key, log))
    }

    /// Create a fresh op key when none is active and `identity` is a master
    pub fn rotate_op_key(&self, identity: &Identity, ttl: Duration) -> StrandResult<Option<(OpKey, Oplog)>> {
        if self.op_keys.newest_active(self.ctx.env.now()).is_some() || !self.is_master(&identity.id()) {
            return Ok(None);
        }
        let created = self.new_op_key(identity, ttl)?;
        self.refs.write().op_key = Some(created.0.hash);
        self.save_refs(Durability::Important)?;
        Ok(Some(created))
    }
}

impl std::fmt::Debug for ProtocolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolManager")
            .field("entity_id", &self.entity_id)
            .finish_non_exhaustive()
    }
}
