//! Chain index and fork resolution
//!
//! Logs of one object are linked through `pre_log_id`. Several logs may share
//! a slot `(obj_id, pre_log_id)`; the canonical chain is found by walking from
//! the root slot and taking the fork winner at every step, so the result
//! depends only on the set of logs and never on arrival order.

use std::collections::{HashMap, HashSet};

use strand_core::{Id, Oplog, Timestamp};

/// Effect of recomputing one object's canonical chain
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Refresh {
    /// The canonical head moved (including first appearance)
    pub head_changed: bool,
    /// Logs whose `is_newer` flag flipped
    pub flipped: Vec<Id>,
}

/// Applied logs of one category
#[derive(Debug, Default)]
pub struct ChainIndex {
    logs: HashMap<Id, Oplog>,
    /// (obj_id, pre_log_id) -> logs occupying that slot
    slots: HashMap<(Id, Id), Vec<Id>>,
    by_object: HashMap<Id, Vec<Id>>,
    heads: HashMap<Id, Id>,
}

impl ChainIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.logs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }

    #[inline]
    pub fn contains(&self, id: &Id) -> bool {
        self.logs.contains_key(id)
    }

    #[inline]
    pub fn get(&self, id: &Id) -> Option<&Oplog> {
        self.logs.get(id)
    }

    /// Add a log; a log with the same ID is left untouched
    pub fn insert(&mut self, log: Oplog) {
        if self.logs.contains_key(&log.id) {
            return;
        }
        self.slots.entry(log.fork_key()).or_default().push(log.id);
        self.by_object.entry(log.obj_id).or_default().push(log.id);
        self.logs.insert(log.id, log);
    }

    pub fn remove(&mut self, id: &Id) -> Option<Oplog> {
        let log = self.logs.remove(id)?;
        if let Some(ids) = self.slots.get_mut(&log.fork_key()) {
            ids.retain(|other| other != id);
        }
        if let Some(ids) = self.by_object.get_mut(&log.obj_id) {
            ids.retain(|other| other != id);
        }
        if self.heads.get(&log.obj_id) == Some(id) {
            self.heads.remove(&log.obj_id);
        }
        Some(log)
    }

    /// Winner of one fork slot
    fn winner(&self, slot: &(Id, Id)) -> Option<&Oplog> {
        let mut best: Option<&Oplog> = None;
        for id in self.slots.get(slot)? {
            let Some(candidate) = self.logs.get(id) else {
                continue;
            };
            best = match best {
                Some(current) if !candidate.wins_over(current) => Some(current),
                _ => Some(candidate),
            };
        }
        best
    }

    /// Canonical chain of `obj_id`, root first
    pub fn canonical_chain(&self, obj_id: &Id) -> Vec<&Oplog> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut pre = Id::NIL;

        while let Some(next) = self.winner(&(*obj_id, pre)) {
            if !seen.insert(next.id) {
                break;
            }
            out.push(next);
            pre = next.id;
        }
        out
    }

    /// Current canonical head of `obj_id`
    pub fn head(&self, obj_id: &Id) -> Option<&Oplog> {
        self.heads.get(obj_id).and_then(|id| self.logs.get(id))
    }

    /// Recompute the canonical chain of `obj_id` and the `is_newer` flags of
    /// all its logs
    pub fn refresh(&mut self, obj_id: &Id) -> Refresh {
        let canonical: Vec<Id> = self.canonical_chain(obj_id).iter().map(|log| log.id).collect();
        let on_chain: HashSet<Id> = canonical.iter().copied().collect();
        let new_head = canonical.last().copied();

        let mut refresh = Refresh::default();
        if let Some(ids) = self.by_object.get(obj_id) {
            for id in ids {
                if let Some(log) = self.logs.get_mut(id) {
                    let want = on_chain.contains(id);
                    if log.is_newer != want {
                        log.is_newer = want;
                        refresh.flipped.push(*id);
                    }
                }
            }
        }

        refresh.head_changed = self.heads.get(obj_id).copied() != new_head;
        match new_head {
            Some(head) => {
                self.heads.insert(*obj_id, head);
            }
            None => {
                self.heads.remove(obj_id);
            }
        }
        refresh
    }

    /// IDs from `id` back to the root, or `None` if the walk leaves the
    /// index or revisits a log
    pub fn walk_to_root(&self, id: &Id) -> Option<Vec<Id>> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut current = *id;

        loop {
            let log = self.logs.get(&current)?;
            if !seen.insert(current) || out.len() > self.logs.len() {
                return None;
            }
            out.push(current);
            if log.is_root() {
                return Some(out);
            }
            current = log.pre_log_id;
        }
    }

    /// Every object with at least one log
    pub fn objects(&self) -> Vec<Id> {
        self.by_object
            .iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(obj, _)| *obj)
            .collect()
    }

    /// All logs ordered by `(create_ts, id)`
    pub fn sorted_logs(&self) -> Vec<&Oplog> {
        let mut out: Vec<&Oplog> = self.logs.values().collect();
        out.sort_by(|a, b| (a.create_ts, a.id).cmp(&(b.create_ts, b.id)));
        out
    }

    /// Latest creation time seen
    pub fn max_create_ts(&self) -> Timestamp {
        self.logs
            .values()
            .map(|log| log.create_ts)
            .max()
            .unwrap_or(Timestamp::ZERO)
    }
}
