// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Owning collection of live connections.
//!
//! A connection is inserted when created and removed exactly once, after
//! it reaches Finished (via the finished hook installed here). Shutdown
//! paths can close every member and block until the set drains.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::ConnectionError;

use super::Connection;

/// Registry of live connections with remove-once semantics.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<u64, Arc<Connection>>>,
    cond: Condvar,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Track a connection; installs the finished hook that removes it
    /// exactly once after finalization.
    pub fn insert(self: &Arc<Self>, conn: &Arc<Connection>) {
        let id = conn.id();
        self.connections.lock().insert(id, conn.clone());

        let registry = Arc::downgrade(self);
        conn.set_finished_hook(Box::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry.remove(id);
            }
        }));
    }

    fn remove(&self, id: u64) {
        let mut connections = self.connections.lock();
        connections.remove(&id);
        self.cond.notify_all();
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }

    pub fn get(&self, id: u64) -> Option<Arc<Connection>> {
        self.connections.lock().get(&id).cloned()
    }

    /// Snapshot of the current members.
    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.connections.lock().values().cloned().collect()
    }

    /// Begin graceful shutdown on every member.
    pub fn close_all(&self) {
        for conn in self.all() {
            conn.close_gracefully();
        }
    }

    /// Force-close every member with the same reason.
    pub fn abort_all(&self, error: ConnectionError) {
        for conn in self.all() {
            conn.abort(error.clone());
        }
    }

    /// Block until every member has finished and been removed.
    pub fn wait_until_empty(&self) {
        let mut connections = self.connections.lock();
        while !connections.is_empty() {
            self.cond.wait(&mut connections);
        }
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.len())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::executor::UpcallExecutor;
    use crate::transport::stream::mock::MockStream;
    use crate::transport::stream::StreamTransceiver;
    use crate::transport::Endpoint;

    fn make_connection(executor: &Arc<UpcallExecutor>) -> Arc<Connection> {
        let (a, _b) = MockStream::pair();
        Connection::new(
            Box::new(StreamTransceiver::new(Box::new(a))),
            Endpoint::tcp(),
            true,
            RuntimeConfig::default(),
            executor.clone(),
            None,
        )
    }

    #[test]
    fn test_insert_and_remove_after_finished() {
        let executor = Arc::new(UpcallExecutor::new(1).unwrap());
        let registry = ConnectionRegistry::new();

        let conn = make_connection(&executor);
        registry.insert(&conn);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(conn.id()).is_some());

        // Finalization runs the finished hook exactly once.
        conn.abort(ConnectionError::RuntimeDestroyed);
        conn.wait_until_finished();
        registry.wait_until_empty();
        assert!(registry.is_empty());
        assert!(registry.get(conn.id()).is_none());
    }

    #[test]
    fn test_abort_all_drains_registry() {
        let executor = Arc::new(UpcallExecutor::new(1).unwrap());
        let registry = ConnectionRegistry::new();

        let first = make_connection(&executor);
        let second = make_connection(&executor);
        registry.insert(&first);
        registry.insert(&second);
        assert_eq!(registry.len(), 2);

        registry.abort_all(ConnectionError::RuntimeDestroyed);
        registry.wait_until_empty();

        assert_eq!(first.latched_error(), Some(ConnectionError::RuntimeDestroyed));
        assert_eq!(second.latched_error(), Some(ConnectionError::RuntimeDestroyed));
    }
}
