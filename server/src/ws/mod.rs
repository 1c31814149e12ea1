pub mod broadcast;
pub mod connection;
pub mod dispatch;
pub mod handler;
pub mod protocol;

use dashmap::DashMap;
use std::sync::Arc;

use connection::Connection;

/// Connection registry: the live connection of each user.
/// At most one connection per user id; a newer one replaces the older.
/// Arc<DashMap<UserId, Arc<Connection>>>
pub type ConnectionRegistry = Arc<DashMap<String, Arc<Connection>>>;

/// Create a new empty connection registry.
pub fn new_connection_registry() -> ConnectionRegistry {
    Arc::new(DashMap::new())
}

/// Clone out every registered connection.
///
/// Callers that go on to close or send work on the copy, never while holding
/// a shard lock, since `Connection::close` removes itself from the map.
pub fn snapshot(registry: &ConnectionRegistry) -> Vec<Arc<Connection>> {
    registry
        .iter()
        .map(|entry| Arc::clone(entry.value()))
        .collect()
}
