//! Multi-node harness
//!
//! Nodes share one `LoopbackNetwork` and one deterministic `Env`. Each node
//! has its own store, optionally wrapped in a `RecordingStore` that logs the
//! status of every durable entity write.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use strand_core::{EntityRecord, EntityStatus, NodeId, Timestamp};
use strand_crypto::Identity;
use strand_runtime::{StrandConfig, StrandNode};
use strand_store::{entity_prefix, Durability, KvStore, MemoryStore, StoreResult};
use strand_time::Env;
use strand_transport::{start_receive_loop, LoopbackNetwork};

// ============================================================================
// RECORDING STORE
// ============================================================================

/// Store wrapper observing durable entity writes
///
/// Every `Important` write under the entity prefix is decoded and its status
/// appended to `statuses`. An optional delay is slept before each such write
/// to widen race windows.
pub struct RecordingStore {
    inner: MemoryStore,
    statuses: Mutex<Vec<EntityStatus>>,
    delay: Option<Duration>,
}

impl RecordingStore {
    pub fn new() -> Self {
        RecordingStore {
            inner: MemoryStore::new(),
            statuses: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        RecordingStore {
            delay: Some(delay),
            ..Self::new()
        }
    }

    pub fn statuses(&self) -> Vec<EntityStatus> {
        self.statuses.lock().clone()
    }
}

impl Default for RecordingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for RecordingStore {
    fn put(&self, key: &[u8], value: &[u8], durability: Durability) -> StoreResult<()> {
        if durability == Durability::Important && key.starts_with(&entity_prefix()) {
            if let Some(delay) = self.delay {
                // Blocking on purpose: store calls are synchronous
                std::thread::sleep(delay);
            }
            match serde_json::from_slice::<EntityRecord>(value) {
                Ok(record) => self.statuses.lock().push(record.meta.status),
                Err(e) => tracing::warn!(error = %e, "Unreadable entity record"),
            }
        }
        self.inner.put(key, value, durability)
    }

    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn delete(&self, key: &[u8]) -> StoreResult<()> {
        self.inner.delete(key)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.inner.scan_prefix(prefix)
    }

    fn flush(&self) -> StoreResult<()> {
        self.inner.flush()
    }
}

// ============================================================================
// TEST CLUSTER
// ============================================================================

/// One node attached to the cluster's network
pub struct TestNode {
    pub node: Arc<StrandNode>,
    pub store: Arc<dyn KvStore>,
    receiver: tokio::task::JoinHandle<()>,
}

impl TestNode {
    pub fn shutdown(&self) {
        self.node.shutdown();
        self.receiver.abort();
    }
}

impl std::ops::Deref for TestNode {
    type Target = StrandNode;

    fn deref(&self) -> &StrandNode {
        &self.node
    }
}

/// Nodes sharing one network and environment
pub struct TestCluster {
    pub network: Arc<LoopbackNetwork>,
    pub env: Env,
    pub config: StrandConfig,
}

impl TestCluster {
    pub fn new(seed: u64) -> Self {
        TestCluster {
            network: LoopbackNetwork::new(),
            env: Env::deterministic(Timestamp::from_secs(1_000_000), seed),
            config: StrandConfig::default()
                .with_sync_interval(Duration::from_millis(20))
                .with_lock_timeout(Duration::from_secs(2)),
        }
    }

    pub fn identity(&self, node_id: u64) -> Arc<Identity> {
        Arc::new(Identity::generate(self.env.random.as_ref(), NodeId::new(node_id)))
    }

    /// Start a node with a fresh identity
    pub fn node(&self, node_id: u64) -> TestNode {
        self.node_with(self.identity(node_id), node_id, Arc::new(MemoryStore::new()))
    }

    /// Start a node for `identity`; several devices may share one identity
    pub fn node_with(&self, identity: Arc<Identity>, node_id: u64, store: Arc<dyn KvStore>) -> TestNode {
        let node_id = NodeId::new(node_id);
        let (transport, rx) = self.network.join(node_id, identity.id());
        let node = StrandNode::new(
            identity,
            node_id,
            self.config.clone(),
            self.env.clone(),
            Arc::clone(&store),
            Arc::new(transport),
        );
        let receiver = start_receive_loop(Arc::clone(&self.network), node_id, rx, node.clone());
        TestNode { node, store, receiver }
    }
}

/// Poll `condition` every 10ms for up to 2s
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

