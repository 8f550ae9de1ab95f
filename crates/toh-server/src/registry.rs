//! Session registry
//!
//! Maps session ids to live [`Adapter`]s. The lock only guards the map;
//! it never serializes I/O on an adapter's socket. Dialing happens before
//! the write lock is taken, so a slow target never blocks other sessions.

use crate::adapter::Adapter;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use toh_proto::DIAL_TIMEOUT;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Failed to dial {target}: {source}")]
    Dial {
        target: String,
        source: std::io::Error,
    },

    #[error("Timed out dialing {target} after {timeout:?}")]
    DialTimeout { target: String, timeout: Duration },
}

/// Process-wide set of live tunnel sessions
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Adapter>>>,
    dial_timeout: Duration,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::with_dial_timeout(DIAL_TIMEOUT)
    }

    pub fn with_dial_timeout(dial_timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            dial_timeout,
        }
    }

    /// Dial `target` and register the connection under `id`.
    ///
    /// Nothing is registered when the dial fails. If `id` is already
    /// registered, the previous adapter is shut down and replaced.
    pub async fn create(&self, id: &str, target: &str) -> Result<Arc<Adapter>, RegistryError> {
        let stream = tokio::time::timeout(self.dial_timeout, TcpStream::connect(target))
            .await
            .map_err(|_| RegistryError::DialTimeout {
                target: target.to_string(),
                timeout: self.dial_timeout,
            })?
            .map_err(|source| RegistryError::Dial {
                target: target.to_string(),
                source,
            })?;

        let adapter = Arc::new(Adapter::new(id, target, stream));
        let previous = self
            .sessions
            .write()
            .await
            .insert(id.to_string(), adapter.clone());

        if let Some(previous) = previous {
            warn!(
                session_id = %id,
                old_target = %previous.target(),
                "Session id reused, closing previous target connection"
            );
            previous.shutdown().await;
        }

        Ok(adapter)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Adapter>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Remove and shut down the session. Absent ids are a no-op.
    ///
    /// Returns whether a session was removed.
    pub async fn delete(&self, id: &str) -> bool {
        let removed = self.sessions.write().await.remove(id);
        match removed {
            Some(adapter) => {
                adapter.shutdown().await;
                debug!(session_id = %id, "Session removed");
                true
            }
            None => false,
        }
    }

    /// Remove `adapter` and shut it down.
    ///
    /// The entry is removed only while it still maps to this very adapter;
    /// a replacement registered under the same id is left alone. Returns
    /// whether the entry was removed.
    pub async fn remove(&self, adapter: &Arc<Adapter>) -> bool {
        let removed = {
            let mut sessions = self.sessions.write().await;
            match sessions.get(adapter.id()) {
                Some(current) if Arc::ptr_eq(current, adapter) => sessions.remove(adapter.id()),
                _ => None,
            }
        };

        adapter.shutdown().await;
        if removed.is_some() {
            debug!(session_id = %adapter.id(), "Session removed");
        }
        removed.is_some()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Shut down every session and empty the registry
    pub async fn shutdown_all(&self) -> usize {
        let drained: Vec<_> = self.sessions.write().await.drain().collect();
        let count = drained.len();
        for (_, adapter) in drained {
            adapter.shutdown().await;
        }
        count
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn target() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (listener, addr)
    }

    async fn closed_port() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        addr
    }

    #[tokio::test]
    async fn test_registry_new_is_empty() {
        let registry = SessionRegistry::new();
        assert!(registry.is_empty().await);
        assert!(registry.get("nonexistent").await.is_none());
    }

    #[tokio::test]
    async fn test_create_get_delete() {
        let registry = SessionRegistry::new();
        let (_listener, addr) = target().await;

        let adapter = registry.create("abcd1234", &addr).await.unwrap();
        assert_eq!(adapter.id(), "abcd1234");
        assert_eq!(adapter.target(), addr);
        assert_eq!(registry.len().await, 1);

        let found = registry.get("abcd1234").await.unwrap();
        assert!(Arc::ptr_eq(&found, &adapter));

        assert!(registry.delete("abcd1234").await);
        assert!(registry.get("abcd1234").await.is_none());
        assert!(adapter.is_closed().await);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let registry = SessionRegistry::new();
        let (_listener, addr) = target().await;
        registry.create("keep", &addr).await.unwrap();

        assert!(!registry.delete("missing").await);
        assert!(!registry.delete("missing").await);
        assert_eq!(registry.len().await, 1);
        assert!(registry.get("keep").await.is_some());
    }

    #[tokio::test]
    async fn test_dial_failure_registers_nothing() {
        let registry = SessionRegistry::new();
        let addr = closed_port().await;

        let result = registry.create("abcd1234", &addr).await;
        assert!(matches!(result, Err(RegistryError::Dial { .. })));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_id_collision_closes_previous() {
        let registry = SessionRegistry::new();
        let (listener, addr) = target().await;

        let first = registry.create("dup", &addr).await.unwrap();
        let (mut first_peer, _) = listener.accept().await.unwrap();

        let second = registry.create("dup", &addr).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len().await, 1);
        assert!(first.is_closed().await);
        assert!(!second.is_closed().await);

        let mut buf = [0u8; 1];
        assert_eq!(first_peer.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remove_keeps_replacement() {
        let registry = SessionRegistry::new();
        let (_listener, addr) = target().await;

        let stale = registry.create("dup", &addr).await.unwrap();
        let current = registry.create("dup", &addr).await.unwrap();

        // The stale adapter no longer owns the id
        assert!(!registry.remove(&stale).await);
        assert!(stale.is_closed().await);
        let found = registry.get("dup").await.unwrap();
        assert!(Arc::ptr_eq(&found, &current));
        assert!(!current.is_closed().await);

        assert!(registry.remove(&current).await);
        assert!(registry.is_empty().await);
        assert!(current.is_closed().await);
    }

    #[tokio::test]
    async fn test_shutdown_all() {
        let registry = SessionRegistry::new();
        let (_listener, addr) = target().await;
        let a = registry.create("a", &addr).await.unwrap();
        let b = registry.create("b", &addr).await.unwrap();

        assert_eq!(registry.shutdown_all().await, 2);
        assert!(registry.is_empty().await);
        assert!(a.is_closed().await);
        assert!(b.is_closed().await);
    }
}
