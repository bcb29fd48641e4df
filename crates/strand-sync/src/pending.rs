//! Buffer of oplogs waiting on a missing dependency
//!
//! A log is parked under the one ID it is waiting for: its predecessor or
//! its authorizing master log. Buffering never blocks. The buffer is
//! bounded; when full, the oldest parked log is evicted and will only come
//! back through a later resend.

use std::collections::{HashMap, VecDeque};

use strand_core::{Id, Oplog, Timestamp};

/// A parked log
#[derive(Debug, Clone)]
pub struct PendingLog {
    pub log: Oplog,
    /// ID whose arrival releases this log
    pub missing: Id,
    pub buffered_at: Timestamp,
}

/// Outcome of parking a log
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferDecision {
    Buffered,
    /// Already parked
    Duplicate,
    /// Parked, and the oldest entry was dropped to make room
    Evicted(Id),
}

/// Bounded out-of-order buffer
#[derive(Debug)]
pub struct PendingBuffer {
    entries: HashMap<Id, PendingLog>,
    /// missing dependency -> parked log IDs
    waiting: HashMap<Id, Vec<Id>>,
    /// Parking order, oldest first
    order: VecDeque<Id>,
    capacity: usize,
}

impl PendingBuffer {
    pub fn new(capacity: usize) -> Self {
        PendingBuffer {
            entries: HashMap::new(),
            waiting: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn contains(&self, id: &Id) -> bool {
        self.entries.contains_key(id)
    }

    /// Park `log` until `missing` arrives
    pub fn insert(&mut self, log: Oplog, missing: Id, now: Timestamp) -> BufferDecision {
        if self.entries.contains_key(&log.id) {
            return BufferDecision::Duplicate;
        }

        let evicted = if self.entries.len() >= self.capacity {
            self.evict_oldest()
        } else {
            None
        };

        let id = log.id;
        self.waiting.entry(missing).or_default().push(id);
        self.order.push_back(id);
        self.entries.insert(
            id,
            PendingLog {
                log,
                missing,
                buffered_at: now,
            },
        );

        match evicted {
            Some(old) => BufferDecision::Evicted(old),
            None => BufferDecision::Buffered,
        }
    }

    fn evict_oldest(&mut self) -> Option<Id> {
        while let Some(id) = self.order.pop_front() {
            if let Some(entry) = self.entries.remove(&id) {
                self.unlink(&entry.missing, &id);
                return Some(id);
            }
        }
        None
    }

    fn unlink(&mut self, missing: &Id, id: &Id) {
        if let Some(ids) = self.waiting.get_mut(missing) {
            ids.retain(|other| other != id);
            if ids.is_empty() {
                self.waiting.remove(missing);
            }
        }
    }

    /// Take every log waiting on `arrived`
    pub fn release(&mut self, arrived: &Id) -> Vec<Oplog> {
        let Some(ids) = self.waiting.remove(arrived) else {
            return Vec::new();
        };

        let released: Vec<Oplog> = ids
            .iter()
            .filter_map(|id| self.entries.remove(id))
            .map(|entry| entry.log)
            .collect();
        self.order.retain(|id| self.entries.contains_key(id));
        released
    }

    /// Dependencies currently awaited, for resync requests
    pub fn missing_dependencies(&self) -> Vec<Id> {
        let mut out: Vec<Id> = self.waiting.keys().copied().collect();
        out.sort();
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingLog> {
        self.entries.values()
    }
}
