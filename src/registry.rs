//! Process-wide registry of running forwarders
//!
//! Single source of truth for "is this entry currently serving traffic".
//! Start/stop in the forwarder module are the only writers; the scheduler
//! and orchestrator do read-only lookups.

use std::collections::HashMap;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::debug;

/// Handle to one running forwarder listener
#[derive(Debug)]
pub struct RunningForwarder {
    pub port: u16,
    /// Upstream endpoint the listener relays to, as "host:port"
    pub upstream: String,
    /// Flipping this to true stops the accept loop
    pub shutdown: watch::Sender<bool>,
    /// The accept loop task, awaited on stop
    pub task: JoinHandle<()>,
}

/// Mapping from entry id to its running forwarder
#[derive(Default)]
pub struct FleetRegistry {
    inner: RwLock<HashMap<u64, RunningForwarder>>,
}

impl FleetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a forwarder under an entry id, returning any forwarder
    /// previously registered for the same id.
    pub async fn register(&self, entry_id: u64, forwarder: RunningForwarder) -> Option<RunningForwarder> {
        let mut inner = self.inner.write().await;
        let previous = inner.insert(entry_id, forwarder);
        debug!(entry_id, total = inner.len(), "Forwarder registered");
        previous
    }

    /// Remove and return the forwarder for an entry id, if present
    pub async fn remove(&self, entry_id: u64) -> Option<RunningForwarder> {
        let mut inner = self.inner.write().await;
        let removed = inner.remove(&entry_id);
        if removed.is_some() {
            debug!(entry_id, total = inner.len(), "Forwarder deregistered");
        }
        removed
    }

    pub async fn is_running(&self, entry_id: u64) -> bool {
        self.inner.read().await.contains_key(&entry_id)
    }

    /// Port the entry's forwarder is bound to, if running
    pub async fn port_of(&self, entry_id: u64) -> Option<u16> {
        self.inner.read().await.get(&entry_id).map(|f| f.port)
    }

    /// Upstream endpoint the entry's forwarder relays to, if running
    pub async fn upstream_of(&self, entry_id: u64) -> Option<String> {
        self.inner
            .read()
            .await
            .get(&entry_id)
            .map(|f| f.upstream.clone())
    }

    /// Id of a different entry currently bound to the given port
    pub async fn port_owner(&self, port: u16, excluding: u64) -> Option<u64> {
        self.inner
            .read()
            .await
            .iter()
            .find(|(id, f)| f.port == port && **id != excluding)
            .map(|(id, _)| *id)
    }

    /// Snapshot of (entry id, port) pairs for every running forwarder
    pub async fn list(&self) -> Vec<(u64, u16)> {
        self.inner
            .read()
            .await
            .iter()
            .map(|(id, f)| (*id, f.port))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Remove every forwarder, returning the handles for shutdown
    pub async fn drain(&self) -> Vec<(u64, RunningForwarder)> {
        let mut inner = self.inner.write().await;
        inner.drain().collect()
    }

    /// Drop all registrations without touching the handles. Run at process
    /// startup, before recovery, so entries from a previous incarnation
    /// cannot shadow fresh listeners.
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        let stale = inner.len();
        inner.clear();
        if stale > 0 {
            debug!(stale, "Cleared stale forwarder registrations");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_forwarder(port: u16) -> RunningForwarder {
        let (shutdown, _rx) = watch::channel(false);
        RunningForwarder {
            port,
            upstream: "1.2.3.4:8080".to_string(),
            shutdown,
            task: tokio::spawn(async {}),
        }
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = FleetRegistry::new();
        assert!(!registry.is_running(1).await);

        registry.register(1, dummy_forwarder(9000)).await;
        assert!(registry.is_running(1).await);
        assert_eq!(registry.port_of(1).await, Some(9000));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_register_same_id_returns_previous() {
        let registry = FleetRegistry::new();
        assert!(registry.register(1, dummy_forwarder(9000)).await.is_none());

        let previous = registry.register(1, dummy_forwarder(9001)).await;
        assert_eq!(previous.unwrap().port, 9000);
        assert_eq!(registry.port_of(1).await, Some(9001));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let registry = FleetRegistry::new();
        registry.register(1, dummy_forwarder(9000)).await;

        assert!(registry.remove(1).await.is_some());
        assert!(registry.remove(1).await.is_none());
        assert!(!registry.is_running(1).await);
    }

    #[tokio::test]
    async fn test_port_owner_excludes_self() {
        let registry = FleetRegistry::new();
        registry.register(1, dummy_forwarder(9000)).await;
        registry.register(2, dummy_forwarder(9001)).await;

        assert_eq!(registry.port_owner(9000, 2).await, Some(1));
        assert_eq!(registry.port_owner(9000, 1).await, None);
        assert_eq!(registry.port_owner(9005, 1).await, None);
    }

    #[tokio::test]
    async fn test_clear_and_drain() {
        let registry = FleetRegistry::new();
        registry.register(1, dummy_forwarder(9000)).await;
        registry.register(2, dummy_forwarder(9001)).await;

        let drained = registry.drain().await;
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty().await);

        registry.register(3, dummy_forwarder(9002)).await;
        registry.clear().await;
        assert!(registry.is_empty().await);
    }
}
