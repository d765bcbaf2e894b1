//! In-memory registry of live peer-node handles.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::node::{ConnectPolicy, PeerNode};
use crate::storage::NodeRecord;

/// One registered node: the live handle plus a per-node operation lock.
///
/// Connect/restart/remove for the same node serialize on `op_lock`;
/// operations against different nodes never contend.
pub struct NodeEntry {
    pub peer: Arc<PeerNode>,
    pub op_lock: Mutex<()>,
}

impl NodeEntry {
    fn new(record: &NodeRecord, policy: ConnectPolicy) -> Arc<Self> {
        Arc::new(Self {
            peer: Arc::new(PeerNode::from_record(record, policy)),
            op_lock: Mutex::new(()),
        })
    }
}

/// Map of node id to live entry, internally synchronized.
#[derive(Default)]
pub struct NodeRegistry {
    entries: Mutex<HashMap<i64, Arc<NodeEntry>>>,
    policy: ConnectPolicy,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose peers connect under `policy` instead of the default.
    pub fn with_policy(policy: ConnectPolicy) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            policy,
        }
    }

    pub async fn get(&self, id: i64) -> Option<Arc<NodeEntry>> {
        self.entries.lock().await.get(&id).cloned()
    }

    /// Entry for `record`, creating one if missing. An existing entry whose
    /// connection parameters no longer match the record is replaced (the
    /// stale peer is disconnected first), so an admin edit of
    /// address/port/certificate takes effect on the next operation.
    pub async fn get_or_create(&self, record: &NodeRecord) -> Arc<NodeEntry> {
        let (entry, stale) = {
            let mut entries = self.entries.lock().await;
            if let Some(existing) = entries.get(&record.id) {
                if existing.peer.matches_record(record) {
                    return Arc::clone(existing);
                }
            }
            let stale = entries.remove(&record.id);
            let entry = NodeEntry::new(record, self.policy);
            entries.insert(record.id, Arc::clone(&entry));
            (entry, stale)
        };
        if let Some(stale) = stale {
            debug!(node_id = record.id, "Replacing stale node entry");
            stale.peer.disconnect().await;
        }
        entry
    }

    /// Evict an entry. Returns it so the caller can disconnect.
    pub async fn remove(&self, id: i64) -> Option<Arc<NodeEntry>> {
        self.entries.lock().await.remove(&id)
    }

    /// Snapshot of all current entries.
    pub async fn entries(&self) -> Vec<Arc<NodeEntry>> {
        self.entries.lock().await.values().cloned().collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn record(id: i64, port: i64) -> NodeRecord {
        NodeRecord {
            id,
            name: format!("node-{id}"),
            address: "192.0.2.1".into(),
            port,
            api_port: port + 1,
            certificate: String::new(),
            status: "connecting".into(),
            message: None,
            engine_version: None,
            uplink: 0,
            downlink: 0,
            last_status_change: 0,
        }
    }

    #[tokio::test]
    async fn reuses_entry_while_record_unchanged() {
        let registry = NodeRegistry::new();
        let a = registry.get_or_create(&record(1, 62050)).await;
        let b = registry.get_or_create(&record(1, 62050)).await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.entries().await.len(), 1);
    }

    #[tokio::test]
    async fn replaces_entry_when_record_edited() {
        let registry = NodeRegistry::new();
        let a = registry.get_or_create(&record(1, 62050)).await;
        let b = registry.get_or_create(&record(1, 7000)).await;
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(b.peer.matches_record(&record(1, 7000)));
    }

    #[tokio::test]
    async fn remove_evicts() {
        let registry = NodeRegistry::new();
        registry.get_or_create(&record(1, 62050)).await;
        assert!(registry.remove(1).await.is_some());
        assert!(registry.get(1).await.is_none());
        assert!(registry.remove(1).await.is_none());
    }
}
