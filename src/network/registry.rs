// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use super::{ConnectionId, TcpConnection};

/// Open connections of one factory, keyed by id.
///
/// Connections remove themselves when they close or fail, from whatever thread
/// that happens on.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<dyn TcpConnection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, connection: Arc<dyn TcpConnection>) {
        self.connections.insert(connection.id().clone(), connection);
    }

    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<dyn TcpConnection>> {
        self.connections.remove(id).map(|(_, connection)| connection)
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<dyn TcpConnection>> {
        self.connections.get(id).map(|entry| entry.value().clone())
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Closes every registered connection. Each one leaves the map
    /// when its close completes.
    pub fn close_all(&self) {
        // collect first, close() removes from the map
        let connections: Vec<Arc<dyn TcpConnection>> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        debug!(count = connections.len(), "closing all connections");
        for connection in connections {
            connection.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Weak;

    use parking_lot::Mutex;

    use super::*;
    use crate::network::ConnectionState;
    use crate::AppError;

    /// Removes itself on close, and can register a newcomer while closing.
    struct FakeConnection {
        id: ConnectionId,
        closed: AtomicBool,
        registry: Weak<ConnectionRegistry>,
        arrives_during_close: Mutex<Option<Arc<FakeConnection>>>,
    }

    impl FakeConnection {
        fn new(registry: &Arc<ConnectionRegistry>) -> Arc<Self> {
            Arc::new(FakeConnection {
                id: ConnectionId::generate(&"127.0.0.1:5000".parse().unwrap()),
                closed: AtomicBool::new(false),
                registry: Arc::downgrade(registry),
                arrives_during_close: Mutex::new(None),
            })
        }
    }

    impl TcpConnection for FakeConnection {
        fn id(&self) -> &ConnectionId {
            &self.id
        }

        fn remote_addr(&self) -> SocketAddr {
            "127.0.0.1:5000".parse().unwrap()
        }

        fn state(&self) -> ConnectionState {
            if self.closed.load(Ordering::Acquire) {
                ConnectionState::Closed
            } else {
                ConnectionState::Open
            }
        }

        fn failure(&self) -> Option<AppError> {
            None
        }

        fn send(&self, _payload: &[u8]) -> crate::AppResult<()> {
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::Release);
            if let Some(registry) = self.registry.upgrade() {
                registry.remove(&self.id);
                if let Some(newcomer) = self.arrives_during_close.lock().take() {
                    registry.insert(newcomer);
                }
            }
        }
    }

    #[test]
    fn test_close_all_keeps_connections_registered_meanwhile() {
        let registry = Arc::new(ConnectionRegistry::new());
        let first = FakeConnection::new(&registry);
        let second = FakeConnection::new(&registry);
        let newcomer = FakeConnection::new(&registry);
        *first.arrives_during_close.lock() = Some(newcomer.clone());
        registry.insert(first.clone());
        registry.insert(second.clone());
        assert_eq!(registry.len(), 2);

        registry.close_all();

        assert!(first.state().is_closed());
        assert!(second.state().is_closed());
        assert!(!newcomer.state().is_closed());
        assert_eq!(registry.ids(), vec![newcomer.id().clone()]);
        assert!(registry.get(newcomer.id()).is_some());
    }
}
