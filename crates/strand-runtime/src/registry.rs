//! Entity registry and per-entity locks
//!
//! The registry owns every admitted entity together with its protocol
//! manager and sync service. Mutating sequences on one entity are serialized
//! through `EntityRegistry::lock`; different entities proceed in parallel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::OwnedMutexGuard;

use strand_core::{Id, StrandError, StrandResult};
use strand_sync::ProtocolManager;

use crate::{Entity, ServiceHandle};

/// An admitted entity
pub struct EntitySlot {
    entity: RwLock<Box<dyn Entity>>,
    pm: Arc<ProtocolManager>,
    service: Mutex<Option<ServiceHandle>>,
}

impl EntitySlot {
    pub fn new(entity: Box<dyn Entity>, pm: Arc<ProtocolManager>) -> Self {
        EntitySlot {
            entity: RwLock::new(entity),
            pm,
            service: Mutex::new(None),
        }
    }

    #[inline]
    pub fn id(&self) -> Id {
        self.pm.entity_id()
    }

    /// Snapshot of the entity
    pub fn entity(&self) -> Box<dyn Entity> {
        self.entity.read().clone_box()
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut dyn Entity) -> R) -> R {
        let mut entity = self.entity.write();
        f(&mut **entity)
    }

    pub fn replace(&self, entity: Box<dyn Entity>) {
        *self.entity.write() = entity;
    }

    pub fn pm(&self) -> &Arc<ProtocolManager> {
        &self.pm
    }

    pub fn is_started(&self) -> bool {
        self.service.lock().as_ref().map_or(false, |s| s.is_running())
    }

    /// Install a running service, stopping any previous one
    pub fn set_service(&self, handle: ServiceHandle) {
        if let Some(previous) = self.service.lock().replace(handle) {
            previous.stop();
        }
    }

    pub fn stop_service(&self) -> Option<ServiceHandle> {
        let handle = self.service.lock().take();
        if let Some(handle) = &handle {
            handle.stop();
        }
        handle
    }
}

impl std::fmt::Debug for EntitySlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntitySlot")
            .field("entity", &self.entity.read())
            .field("started", &self.is_started())
            .finish()
    }
}

type LockTable = Mutex<HashMap<Id, Arc<tokio::sync::Mutex<()>>>>;

/// Forget the mutex of `entity_id` once nobody holds or awaits it
fn prune(table: &LockTable, entity_id: &Id) {
    let mut table = table.lock();
    if table.get(entity_id).map_or(false, |mutex| Arc::strong_count(mutex) == 1) {
        table.remove(entity_id);
    }
}

/// Exclusive hold on one entity; dropping it unlocks
pub struct EntityGuard {
    entity_id: Id,
    guard: Option<OwnedMutexGuard<()>>,
    table: Arc<LockTable>,
}

impl EntityGuard {
    #[inline]
    pub fn entity_id(&self) -> Id {
        self.entity_id
    }
}

impl Drop for EntityGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        prune(&self.table, &self.entity_id);
    }
}

impl std::fmt::Debug for EntityGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityGuard").field("entity_id", &self.entity_id).finish()
    }
}

/// One async mutex per entity ID, kept only while in use
pub struct EntityLocks {
    table: Arc<LockTable>,
    timeout: Duration,
    closed: AtomicBool,
}

impl EntityLocks {
    pub fn new(timeout: Duration) -> Self {
        EntityLocks {
            table: Arc::new(Mutex::new(HashMap::new())),
            timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// Wait up to the configured timeout for the lock of `entity_id`
    pub async fn lock(&self, entity_id: Id) -> StrandResult<EntityGuard> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StrandError::RegistryClosed);
        }
        let mutex = Arc::clone(self.table.lock().entry(entity_id).or_default());

        let acquired = tokio::time::timeout(self.timeout, mutex.lock_owned()).await;
        let guard = match acquired {
            Ok(guard) => EntityGuard {
                entity_id,
                guard: Some(guard),
                table: Arc::clone(&self.table),
            },
            Err(_) => {
                prune(&self.table, &entity_id);
                return Err(StrandError::LockTimeout(entity_id));
            }
        };
        if self.closed.load(Ordering::Acquire) {
            return Err(StrandError::RegistryClosed);
        }
        Ok(guard)
    }

    /// Entities with a held or awaited lock
    pub fn tracked(&self) -> usize {
        self.table.lock().len()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Owner of all admitted entities
pub struct EntityRegistry {
    slots: RwLock<HashMap<Id, Arc<EntitySlot>>>,
    locks: EntityLocks,
}

impl EntityRegistry {
    pub fn new(lock_timeout: Duration) -> Self {
        EntityRegistry {
            slots: RwLock::new(HashMap::new()),
            locks: EntityLocks::new(lock_timeout),
        }
    }

    pub async fn lock(&self, entity_id: Id) -> StrandResult<EntityGuard> {
        self.locks.lock(entity_id).await
    }

    pub fn get(&self, entity_id: &Id) -> Option<Arc<EntitySlot>> {
        self.slots.read().get(entity_id).cloned()
    }

    pub fn contains(&self, entity_id: &Id) -> bool {
        self.slots.read().contains_key(entity_id)
    }

    pub fn insert(&self, slot: Arc<EntitySlot>) -> StrandResult<()> {
        if self.locks.is_closed() {
            return Err(StrandError::RegistryClosed);
        }
        self.slots.write().insert(slot.id(), slot);
        Ok(())
    }

    pub fn remove(&self, entity_id: &Id) -> Option<Arc<EntitySlot>> {
        let slot = self.slots.write().remove(entity_id);
        if let Some(slot) = &slot {
            slot.stop_service();
        }
        slot
    }

    pub fn ids(&self) -> Vec<Id> {
        let mut ids: Vec<Id> = self.slots.read().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    /// Refuse new locks and stop every sync service
    pub fn close(&self) {
        self.locks.close();
        for slot in self.slots.read().values() {
            slot.stop_service();
        }
        tracing::info!(entities = self.len(), "Entity registry closed");
    }
}
