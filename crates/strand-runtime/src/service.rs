//! Per-entity background sync loop
//!
//! Each started entity runs one task that periodically asks its masters for
//! logs newer than the local cursors, and rotates the op key when the local
//! identity is a master and the current key expired.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use strand_core::{OplogCategory, StrandResult};
use strand_crypto::Identity;
use strand_sync::ProtocolManager;
use strand_transport::PeerMessage;

/// Categories pulled by the sync loop, in dependency order
const SYNCED_CATEGORIES: [OplogCategory; 4] = [
    OplogCategory::Master,
    OplogCategory::Member,
    OplogCategory::OpKey,
    OplogCategory::Content,
];

/// Running sync loop of one entity
pub struct ServiceHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ServiceHandle {
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Signal the loop to stop without waiting for it
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    /// Stop the loop and wait for it to exit
    pub async fn shutdown(self) {
        self.stop();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Sync loop ended abnormally");
        }
    }
}

impl std::fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("running", &self.is_running())
            .finish()
    }
}

/// Settings of one sync loop
#[derive(Clone, Debug)]
pub struct SyncSettings {
    pub interval: Duration,
    pub op_key_ttl: Duration,
}

/// Spawn the sync loop of the entity behind `pm`
pub fn start_sync_service(pm: Arc<ProtocolManager>, local: Option<Arc<Identity>>, settings: SyncSettings) -> ServiceHandle {
    let (stop, mut stopped) = watch::channel(false);
    let entity_id = pm.entity_id();

    let task = tokio::spawn(async move {
        tracing::info!(entity = %entity_id, interval_ms = settings.interval.as_millis() as u64, "Sync service started");
        let mut ticker = tokio::time::interval(settings.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = sync_round(&pm, local.as_deref(), settings.op_key_ttl).await {
                        tracing::warn!(entity = %entity_id, error = %e, "Sync round failed");
                    }
                }
                changed = stopped.changed() => {
                    if changed.is_err() || *stopped.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!(entity = %entity_id, "Sync service stopped");
    });

    ServiceHandle { stop, task }
}

/// One pass of the sync loop
///
/// Delivery failures are logged and skipped; only local persistence errors
/// are returned.
pub async fn sync_round(pm: &ProtocolManager, local: Option<&Identity>, op_key_ttl: Duration) -> StrandResult<()> {
    let entity_id = pm.entity_id();
    let local_id = local.map(|identity| identity.id());

    if let Some(identity) = local {
        let previous = pm.op_key();
        if let Some((key, log)) = pm.rotate_op_key(identity, op_key_ttl)? {
            tracing::info!(entity = %entity_id, key = ?key.hash, "Rotated op key");
            match previous {
                Some(previous) => {
                    let message = pm.seal_logs_with(&previous, OplogCategory::OpKey, &[log])?;
                    if let Err(e) = pm.transport().broadcast(entity_id, message).await {
                        tracing::warn!(entity = %entity_id, error = %e, "Op key broadcast failed");
                    }
                }
                None => tracing::warn!(entity = %entity_id, "No previous op key to hand out the rotated one"),
            }
        }
    }

    for master in pm.master_list(false)? {
        if Some(master.id) == local_id {
            continue;
        }
        for category in SYNCED_CATEGORIES {
            let request = PeerMessage::SyncRequest {
                entity_id,
                category,
                since: pm.sync_cursor(category),
            };
            if let Err(e) = pm.transport().send_to(entity_id, master.id, request).await {
                tracing::warn!(entity = %entity_id, master = ?master.id, error = %e, "Sync request failed");
                break;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::{Id, NodeId, Timestamp};
    use strand_store::MemoryStore;
    use strand_sync::SyncContext;
    use strand_time::Env;
    use strand_transport::NullTransport;

    fn pm() -> Arc<ProtocolManager> {
        let env = Env::deterministic(Timestamp::from_secs(1), 3);
        let creator = Identity::generate(env.random.as_ref(), NodeId::new(1));
        let entity_id = env.new_id(&creator.id());
        let ctx = SyncContext {
            env,
            store: Arc::new(MemoryStore::new()),
            transport: Arc::new(NullTransport),
            local: None,
            max_pending_logs: 16,
        };
        Arc::new(ProtocolManager::open(entity_id, ctx, Vec::new()).unwrap())
    }

    #[tokio::test]
    async fn test_service_stops() {
        let handle = start_sync_service(
            pm(),
            None,
            SyncSettings {
                interval: Duration::from_millis(5),
                op_key_ttl: Duration::from_secs(60),
            },
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handle.is_running());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_round_without_masters() {
        let pm = pm();
        sync_round(&pm, None, Duration::from_secs(60)).await.unwrap();
        assert_ne!(pm.entity_id(), Id::NIL);
    }
}
