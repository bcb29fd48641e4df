//! Oplog merge pipeline
//!
//! Every entry of a batch goes through the same stages:
//! 1. Category and duplicate checks
//! 2. Hash, creator and signature verification
//! 3. Authority: the master log named by the entry must be an `AddMaster`
//!    for its creator (or the entity's self-authorized genesis master), and
//!    the creator must not have been revoked or transferred before the entry
//!    was created
//! 4. Chain placement: the predecessor must already be applied
//! 5. Apply: flag, co-sign, persist, recompute the canonical chain and hand
//!    the new head to the category's projection. A projection that refuses
//!    the new head rolls the entry back and rejects it.
//!
//! Entries missing a dependency are parked and re-admitted as soon as the
//! dependency is applied, in whichever category it lives.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use strand_core::{Id, NodeId, Op, Oplog, OplogCategory, StrandError, StrandResult};
use strand_crypto::{co_sign, verify_oplog, Identity};
use strand_store::{oplog_key, put_json, Durability, KvStore};
use strand_time::Clock;

use crate::{BufferDecision, ChainIndex, PendingBuffer};

/// Projection fed by one oplog category
pub trait OplogHandler: Send + Sync {
    fn category(&self) -> OplogCategory;

    /// Op-specific checks on a single entry
    fn validate(&self, _log: &Oplog) -> StrandResult<()> {
        Ok(())
    }

    /// The canonical chain of `obj_id` changed; `chain` runs root to head
    fn apply(&self, obj_id: &Id, chain: &[&Oplog]) -> StrandResult<()>;

    /// Rebuild from persisted projections
    fn reload(&self) -> StrandResult<()> {
        Ok(())
    }
}

/// Merge result for a batch of oplogs
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub applied: u32,
    pub duplicate: u32,
    pub buffered: u32,
    pub rejected: u32,
    pub evicted: u32,
}

impl MergeReport {
    pub fn absorb(&mut self, other: &MergeReport) {
        self.applied += other.applied;
        self.duplicate += other.duplicate;
        self.buffered += other.buffered;
        self.rejected += other.rejected;
        self.evicted += other.evicted;
    }
}

/// Outcome of admitting one entry
#[derive(Debug)]
pub enum Admission {
    Applied,
    Duplicate,
    Buffered { missing: Id, evicted: Option<Id> },
    Rejected(StrandError),
}

struct Lane {
    chain: ChainIndex,
    pending: PendingBuffer,
}

/// Per-entity merger over all categories
pub struct OplogMerger {
    entity_id: Id,
    lanes: HashMap<OplogCategory, Lane>,
    handlers: HashMap<OplogCategory, Arc<dyn OplogHandler>>,
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    cosigner: Option<Arc<Identity>>,
}

impl OplogMerger {
    pub fn new(entity_id: Id, store: Arc<dyn KvStore>, clock: Arc<dyn Clock>, max_pending_logs: usize) -> Self {
        let lanes = OplogCategory::ALL
            .iter()
            .map(|category| {
                (
                    *category,
                    Lane {
                        chain: ChainIndex::new(),
                        pending: PendingBuffer::new(max_pending_logs),
                    },
                )
            })
            .collect();

        OplogMerger {
            entity_id,
            lanes,
            handlers: HashMap::new(),
            store,
            clock,
            cosigner: None,
        }
    }

    pub fn set_handler(&mut self, handler: Arc<dyn OplogHandler>) {
        self.handlers.insert(handler.category(), handler);
    }

    /// Identity that co-signs applied logs while it is a current master
    pub fn set_cosigner(&mut self, identity: Option<Arc<Identity>>) {
        self.cosigner = identity;
    }

    #[inline]
    pub fn entity_id(&self) -> Id {
        self.entity_id
    }

    fn lane(&self, category: OplogCategory) -> StrandResult<&Lane> {
        self.lanes
            .get(&category)
            .ok_or_else(|| StrandError::Storage(format!("no lane for {}", category)))
    }

    fn lane_mut(&mut self, category: OplogCategory) -> StrandResult<&mut Lane> {
        self.lanes
            .get_mut(&category)
            .ok_or_else(|| StrandError::Storage(format!("no lane for {}", category)))
    }

    /// Merge a batch of one category
    ///
    /// Only persistence failures are returned as errors; problems with
    /// single entries are counted in the report. Parked entries whose
    /// dependency is already applied are retried first.
    pub fn merge(&mut self, category: OplogCategory, incoming: Vec<Oplog>, peer: Option<NodeId>) -> StrandResult<MergeReport> {
        let mut batch = incoming;
        batch.sort_by(|a, b| (a.create_ts, a.id).cmp(&(b.create_ts, b.id)));

        let mut report = MergeReport::default();
        // Third field: the dependency that released a parked entry
        let mut queue: VecDeque<(OplogCategory, Oplog, Option<Id>)> = self.release_satisfied().into();
        queue.extend(batch.into_iter().map(|log| (category, log, None)));

        while let Some((cat, log, released_by)) = queue.pop_front() {
            let log_id = log.id;
            let parked = released_by.map(|missing| (cat, log.clone(), missing));
            let admission = match self.admit(cat, log) {
                Ok(admission) => admission,
                Err(e) => {
                    let unprocessed = queue
                        .into_iter()
                        .filter_map(|(cat, log, released_by)| released_by.map(|missing| (cat, log, missing)));
                    let reparked = self.repark(parked.into_iter().chain(unprocessed));
                    if reparked > 0 {
                        tracing::warn!(entity = %self.entity_id, reparked, error = %e, "Merge aborted, parked released oplogs again");
                    }
                    return Err(e);
                }
            };

            match admission {
                Admission::Applied => {
                    report.applied += 1;
                    let mut released = self.release(&log_id);
                    released.sort_by(|a, b| (b.1.create_ts, b.1.id).cmp(&(a.1.create_ts, a.1.id)));
                    for (cat, log) in released {
                        queue.push_front((cat, log, Some(log_id)));
                    }
                }
                Admission::Duplicate => report.duplicate += 1,
                Admission::Buffered { missing, evicted } => {
                    report.buffered += 1;
                    tracing::debug!(entity = %self.entity_id, log = ?log_id, missing = ?missing, "Buffered oplog");
                    if let Some(old) = evicted {
                        report.evicted += 1;
                        tracing::warn!(entity = %self.entity_id, category = %cat, evicted = ?old, "Pending buffer full, evicted oldest oplog");
                    }
                }
                Admission::Rejected(e) => {
                    report.rejected += 1;
                    tracing::warn!(entity = %self.entity_id, category = %cat, log = ?log_id, peer = ?peer, error = %e, "Dropping oplog");
                }
            }
        }

        tracing::debug!(
            entity = %self.entity_id,
            category = %category,
            applied = report.applied,
            duplicate = report.duplicate,
            buffered = report.buffered,
            rejected = report.rejected,
            "Merged oplogs"
        );
        Ok(report)
    }

    /// Admit one entry; released dependents are not processed
    pub fn admit(&mut self, category: OplogCategory, mut log: Oplog) -> StrandResult<Admission> {
        if log.category() != category {
            return Ok(Admission::Rejected(StrandError::InvalidOp { op: log.op, category }));
        }

        let lane = self.lane(category)?;
        if lane.chain.contains(&log.id) || lane.pending.contains(&log.id) {
            return Ok(Admission::Duplicate);
        }
        // Some(true) when the predecessor is known but does not extend to `log`
        let broken_chain = lane
            .chain
            .get(&log.pre_log_id)
            .map(|pre| pre.obj_id != log.obj_id || log.create_ts < pre.create_ts);
        let authority = self.authority(&log)?;

        let Some(handler) = self.handlers.get(&category).cloned() else {
            return Ok(Admission::Rejected(StrandError::InvalidOp { op: log.op, category }));
        };
        if let Err(e) = verify_oplog(&log) {
            return Ok(Admission::Rejected(e));
        }
        if let Err(e) = handler.validate(&log) {
            return Ok(Admission::Rejected(e));
        }

        if !log.is_root() {
            match broken_chain {
                None => {
                    let missing = log.pre_log_id;
                    return Ok(self.buffer(category, log, missing));
                }
                Some(true) => return Ok(Admission::Rejected(StrandError::BrokenChain(log.id))),
                Some(false) => {}
            }
        }

        let unauthorized = StrandError::UnauthorizedMaster {
            master_log_id: log.master_log_id,
            creator_id: log.creator_id,
        };
        if log.is_self_authorized() {
            if !self.is_genesis_master(category, &log) {
                return Ok(Admission::Rejected(unauthorized));
            }
        } else {
            match authority {
                None => {
                    let missing = log.master_log_id;
                    return Ok(self.buffer(category, log, missing));
                }
                Some(false) => return Ok(Admission::Rejected(unauthorized)),
                Some(true) => {}
            }
        }

        log.is_sync = true;
        log.is_newer = false;
        if let Some(signer) = self.cosigner.clone() {
            if self.is_current_master(&signer.id()) {
                co_sign(&signer, &mut log);
            }
        }
        match self.apply(category, log, handler) {
            Ok(()) => Ok(Admission::Applied),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => Ok(Admission::Rejected(e)),
        }
    }

    /// `Some(true)` when the master log named by `log` authorizes its creator
    /// at the log's creation time, `None` while that master log is unknown
    fn authority(&self, log: &Oplog) -> StrandResult<Option<bool>> {
        let masters = &self.lane(OplogCategory::Master)?.chain;
        let Some(master) = masters.get(&log.master_log_id) else {
            return Ok(None);
        };
        if master.op != Op::AddMaster || master.obj_id != log.creator_id {
            return Ok(Some(false));
        }
        // A revoked or transferred master keeps only what it wrote before
        let in_office = match masters.head(&log.creator_id) {
            Some(head) if head.op != Op::AddMaster => log.create_ts < head.create_ts,
            _ => true,
        };
        Ok(Some(in_office))
    }

    /// Root AddMaster of its own slot, created by the entity's creator
    fn is_genesis_master(&self, category: OplogCategory, log: &Oplog) -> bool {
        category == OplogCategory::Master
            && log.op == Op::AddMaster
            && log.is_root()
            && log.obj_id == log.creator_id
            && self.entity_id.is_created_by(&log.creator_id)
    }

    /// Canonical master slot of `id` ends in an AddMaster
    pub fn is_current_master(&self, id: &Id) -> bool {
        self.lanes
            .get(&OplogCategory::Master)
            .and_then(|lane| lane.chain.head(id))
            .map_or(false, |head| head.op == Op::AddMaster)
    }

    /// Log that currently authorizes `id` as a master
    pub fn master_log_for(&self, id: &Id) -> Option<Id> {
        self.lanes
            .get(&OplogCategory::Master)
            .and_then(|lane| lane.chain.head(id))
            .filter(|head| head.op == Op::AddMaster)
            .map(|head| head.id)
    }

    fn buffer(&mut self, category: OplogCategory, log: Oplog, missing: Id) -> Admission {
        let now = self.clock.now();
        let Some(lane) = self.lanes.get_mut(&category) else {
            return Admission::Rejected(StrandError::MissingDependency(missing));
        };
        match lane.pending.insert(log, missing, now) {
            BufferDecision::Buffered => Admission::Buffered { missing, evicted: None },
            BufferDecision::Evicted(old) => Admission::Buffered {
                missing,
                evicted: Some(old),
            },
            BufferDecision::Duplicate => Admission::Duplicate,
        }
    }

    /// Insert, persist and project one admitted log
    ///
    /// On any failure the log is taken out of the chain and the store again,
    /// and the `is_newer` flags of its siblings are restored.
    fn apply(&mut self, category: OplogCategory, log: Oplog, handler: Arc<dyn OplogHandler>) -> StrandResult<()> {
        let entity_id = self.entity_id;
        let obj_id = log.obj_id;
        let log_id = log.id;

        let lane = self.lane_mut(category)?;
        lane.chain.insert(log);
        let refresh = lane.chain.refresh(&obj_id);

        let mut to_save = refresh.flipped.clone();
        if !to_save.contains(&log_id) {
            to_save.push(log_id);
        }
        if let Err(e) = self.persist(category, &to_save) {
            self.roll_back(category, &obj_id, &log_id);
            return Err(e);
        }

        if refresh.head_changed {
            let lane = self.lane(category)?;
            let chain = lane.chain.canonical_chain(&obj_id);
            if let Err(e) = handler.apply(&obj_id, &chain) {
                self.roll_back(category, &obj_id, &log_id);
                return Err(e);
            }
        }
        tracing::debug!(entity = %entity_id, category = %category, log = ?log_id, head_changed = refresh.head_changed, "Applied oplog");
        Ok(())
    }

    fn persist(&self, category: OplogCategory, ids: &[Id]) -> StrandResult<()> {
        let lane = self.lane(category)?;
        for id in ids {
            if let Some(log) = lane.chain.get(id) {
                put_json(self.store.as_ref(), &oplog_key(&self.entity_id, category, id), log, Durability::Batched)?;
            }
        }
        Ok(())
    }

    /// Undo `apply` for `log_id`; store failures here are only logged
    fn roll_back(&mut self, category: OplogCategory, obj_id: &Id, log_id: &Id) {
        let Some(lane) = self.lanes.get_mut(&category) else {
            return;
        };
        lane.chain.remove(log_id);
        let restored = lane.chain.refresh(obj_id);

        let mut result = self
            .store
            .delete(&oplog_key(&self.entity_id, category, log_id))
            .map_err(StrandError::from);
        if result.is_ok() {
            result = self.persist(category, &restored.flipped);
        }
        if let Err(e) = result {
            tracing::warn!(entity = %self.entity_id, category = %category, log = ?log_id, error = %e, "Incomplete oplog rollback");
        }
    }

    /// Park released entries again after an aborted merge
    fn repark(&mut self, entries: impl Iterator<Item = (OplogCategory, Oplog, Id)>) -> usize {
        let now = self.clock.now();
        let mut count = 0;
        for (category, log, missing) in entries {
            if let Some(lane) = self.lanes.get_mut(&category) {
                lane.pending.insert(log, missing, now);
                count += 1;
            }
        }
        count
    }

    /// Take parked entries whose dependency has been applied meanwhile
    fn release_satisfied(&mut self) -> Vec<(OplogCategory, Oplog, Option<Id>)> {
        let ready: Vec<Id> = self
            .lanes
            .values()
            .flat_map(|lane| lane.pending.missing_dependencies())
            .filter(|id| self.lanes.values().any(|lane| lane.chain.contains(id)))
            .collect();

        let mut out = Vec::new();
        for id in ready {
            for (category, log) in self.release(&id) {
                out.push((category, log, Some(id)));
            }
        }
        out
    }

    /// Take every parked entry, in any category, waiting on `arrived`
    fn release(&mut self, arrived: &Id) -> Vec<(OplogCategory, Oplog)> {
        let mut out = Vec::new();
        for (category, lane) in self.lanes.iter_mut() {
            for log in lane.pending.release(arrived) {
                out.push((*category, log));
            }
        }
        out
    }

    /// Re-insert persisted logs without verification
    pub fn restore(&mut self, category: OplogCategory, logs: Vec<Oplog>) -> StrandResult<()> {
        let lane = self.lane_mut(category)?;
        let mut objects = Vec::new();
        for log in logs {
            objects.push(log.obj_id);
            lane.chain.insert(log);
        }
        objects.sort();
        objects.dedup();
        for obj_id in objects {
            lane.chain.refresh(&obj_id);
        }
        Ok(())
    }

    pub fn contains(&self, category: OplogCategory, id: &Id) -> bool {
        self.lanes.get(&category).map_or(false, |lane| lane.chain.contains(id))
    }

    pub fn get(&self, category: OplogCategory, id: &Id) -> Option<&Oplog> {
        self.lanes.get(&category).and_then(|lane| lane.chain.get(id))
    }

    pub fn head(&self, category: OplogCategory, obj_id: &Id) -> Option<&Oplog> {
        self.lanes.get(&category).and_then(|lane| lane.chain.head(obj_id))
    }

    pub fn chain(&self, category: OplogCategory) -> Option<&ChainIndex> {
        self.lanes.get(&category).map(|lane| &lane.chain)
    }

    pub fn pending(&self, category: OplogCategory) -> Option<&PendingBuffer> {
        self.lanes.get(&category).map(|lane| &lane.pending)
    }
}
