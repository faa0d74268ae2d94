//! DeviceRegistry: the gateway's table of connected devices.
//!
//! Maps each [`DeviceId`] to at most one live [`DeviceSession`].  Routers
//! look sessions up here; the connect use case registers them; a session's
//! own worker removes it when the connection dies.
//!
//! # Locking
//!
//! The table sits behind a `std::sync::Mutex` that is only held for map
//! operations, never across an `.await`.  Ordering by id (`BTreeMap`) keeps
//! [`DeviceRegistry::snapshot`] stable for the stats endpoint.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::info;
use uuid::Uuid;

use super::session::{DeviceSession, DeviceStats, SessionConfig};
use crate::{DeviceId, GatewayError};

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    sessions: Mutex<BTreeMap<DeviceId, Arc<DeviceSession>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a session for `stream` and starts its worker.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Conflict`] if `device_id` already has a live
    /// session.  The stream is dropped (closed) in that case.
    pub fn register<S>(
        self: &Arc<Self>,
        device_id: DeviceId,
        stream: S,
        peer: impl Into<String>,
        config: &SessionConfig,
    ) -> Result<Arc<DeviceSession>, GatewayError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut sessions = self.sessions();
        if sessions.contains_key(&device_id) {
            return Err(GatewayError::Conflict(device_id));
        }

        let session = DeviceSession::spawn(
            device_id,
            peer.into(),
            stream,
            config,
            Arc::downgrade(self),
        );
        sessions.insert(device_id, Arc::clone(&session));
        Ok(session)
    }

    /// # Errors
    ///
    /// Returns [`GatewayError::DeviceNotConnected`] for unknown ids.
    pub fn lookup(&self, device_id: DeviceId) -> Result<Arc<DeviceSession>, GatewayError> {
        self.sessions()
            .get(&device_id)
            .cloned()
            .ok_or(GatewayError::DeviceNotConnected(device_id))
    }

    pub fn contains(&self, device_id: DeviceId) -> bool {
        self.sessions().contains_key(&device_id)
    }

    /// Removes the device and closes its connection.  Requests still queued
    /// for it fail with [`GatewayError::ConnectionClosed`].
    ///
    /// Returns `false` if the device was not registered.
    pub fn unregister(&self, device_id: DeviceId) -> bool {
        let removed = self.sessions().remove(&device_id);
        match removed {
            Some(session) => {
                session.stop();
                info!(device_id, "device disconnected");
                true
            }
            None => false,
        }
    }

    /// Called by a session's worker when its connection fails.
    ///
    /// Only removes the entry if it still belongs to `session_id`, so a
    /// worker that ends late never evicts a newer session for the same id.
    pub(crate) fn remove_session(&self, device_id: DeviceId, session_id: Uuid) -> bool {
        let mut sessions = self.sessions();
        match sessions.get(&device_id) {
            Some(current) if current.session_id() == session_id => {
                sessions.remove(&device_id);
                true
            }
            _ => false,
        }
    }

    /// Stats for every connected device, ordered by id.
    pub fn snapshot(&self) -> Vec<DeviceStats> {
        self.sessions().values().map(|s| s.stats()).collect()
    }

    /// Stops every session.  Returns how many were stopped.
    pub fn shutdown_all(&self) -> usize {
        let drained: Vec<_> = std::mem::take(&mut *self.sessions()).into_values().collect();
        for session in &drained {
            session.stop();
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }

    fn sessions(&self) -> MutexGuard<'_, BTreeMap<DeviceId, Arc<DeviceSession>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::DuplexStream;

    fn stream() -> (DuplexStream, DuplexStream) {
        tokio::io::duplex(256)
    }

    fn make_registry() -> Arc<DeviceRegistry> {
        Arc::new(DeviceRegistry::new())
    }

    #[tokio::test]
    async fn test_register_then_lookup_returns_same_session() {
        let registry = make_registry();
        let (gw, _dev) = stream();

        let session = registry
            .register(7, gw, "peer", &SessionConfig::default())
            .unwrap();

        let found = registry.lookup(7).unwrap();
        assert_eq!(found.session_id(), session.session_id());
        assert_eq!(found.peer(), "peer");
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_register_duplicate_id_is_conflict() {
        let registry = make_registry();
        let (a, _a_dev) = stream();
        let (b, _b_dev) = stream();
        registry
            .register(1, a, "a", &SessionConfig::default())
            .unwrap();

        let result = registry.register(1, b, "b", &SessionConfig::default());

        assert!(matches!(result, Err(GatewayError::Conflict(1))));
        assert_eq!(registry.lookup(1).unwrap().peer(), "a");
    }

    #[test]
    fn test_lookup_unknown_is_not_connected() {
        let registry = DeviceRegistry::new();
        assert!(matches!(
            registry.lookup(3),
            Err(GatewayError::DeviceNotConnected(3))
        ));
    }

    #[tokio::test]
    async fn test_unregister_removes_entry_and_reports_presence() {
        let registry = make_registry();
        let (gw, _dev) = stream();
        registry
            .register(2, gw, "p", &SessionConfig::default())
            .unwrap();

        assert!(registry.unregister(2));
        assert!(!registry.unregister(2));
        assert!(!registry.contains(2));
    }

    #[tokio::test]
    async fn test_stale_session_cannot_remove_newer_one() {
        let registry = make_registry();
        let (gw, _dev) = stream();
        let current = registry
            .register(5, gw, "p", &SessionConfig::default())
            .unwrap();

        assert!(!registry.remove_session(5, Uuid::new_v4()));
        assert!(registry.contains(5));
        assert!(registry.remove_session(5, current.session_id()));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_is_ordered_by_device_id() {
        let registry = make_registry();
        let mut keep = Vec::new();
        for id in [9u8, 2, 5] {
            let (gw, dev) = stream();
            keep.push(dev);
            registry
                .register(id, gw, format!("dev-{id}"), &SessionConfig::default())
                .unwrap();
        }

        let ids: Vec<_> = registry.snapshot().iter().map(|s| s.device_id).collect();

        assert_eq!(ids, vec![2, 5, 9]);
    }

    #[tokio::test]
    async fn test_peer_hangup_removes_session_from_registry() {
        // Arrange
        let registry = make_registry();
        let (gw, dev) = stream();
        let session = registry
            .register(4, gw, "p", &SessionConfig::default())
            .unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        session
            .try_enqueue(crate::application::session::PendingRequest {
                request: mbgw_core::RegisterRequest::read_holding_registers(0, 1),
                reply: tx,
            })
            .unwrap();

        // Act: the device side goes away before answering.
        drop(dev);
        let result = tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .expect("worker must answer")
            .unwrap();

        // Assert
        assert!(matches!(result, Err(GatewayError::Io { device_id: 4, .. })));
        assert!(!registry.contains(4));
    }

    #[tokio::test]
    async fn test_shutdown_all_empties_registry() {
        let registry = make_registry();
        let (a, _a) = stream();
        let (b, _b) = stream();
        registry.register(1, a, "a", &SessionConfig::default()).unwrap();
        registry.register(2, b, "b", &SessionConfig::default()).unwrap();

        assert_eq!(registry.shutdown_all(), 2);
        assert!(registry.is_empty());
    }
}
