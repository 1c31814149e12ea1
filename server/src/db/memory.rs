use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::models::{Room, StoredMessage, User, UserLookup};
use super::{Store, StoreError, StoreResult};

#[derive(Debug, Default)]
struct Tables {
    users: HashMap<String, User>,
    /// username -> user id
    usernames: HashMap<String, String>,
    messages: Vec<StoredMessage>,
    rooms: HashMap<String, Room>,
}

/// Non-persistent [`Store`]. Everything is lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_user(&self, user: User) -> StoreResult<User> {
        let mut tables = self.tables.write().await;
        if tables.usernames.contains_key(&user.username) {
            return Err(StoreError::Conflict(format!(
                "username {} already registered",
                user.username
            )));
        }
        tables
            .usernames
            .insert(user.username.clone(), user.id.clone());
        tables.users.insert(user.id.clone(), user.clone());
        Ok(user)
    }

    async fn get_user(&self, lookup: UserLookup) -> StoreResult<User> {
        let tables = self.tables.read().await;
        let id = match &lookup {
            UserLookup::Id(id) => Some(id),
            UserLookup::Name(name) => tables.usernames.get(name),
        };
        id.and_then(|id| tables.users.get(id))
            .cloned()
            .ok_or_else(|| match lookup {
                UserLookup::Id(key) | UserLookup::Name(key) => {
                    StoreError::NotFound(format!("user {}", key))
                }
            })
    }

    async fn insert_message(&self, message: StoredMessage) -> StoreResult<StoredMessage> {
        self.tables.write().await.messages.push(message.clone());
        Ok(message)
    }

    async fn messages_between(
        &self,
        from: i64,
        to: i64,
        limit: usize,
    ) -> StoreResult<Vec<StoredMessage>> {
        let tables = self.tables.read().await;
        let mut window: Vec<StoredMessage> = tables
            .messages
            .iter()
            .filter(|m| m.timestamp >= from && m.timestamp <= to)
            .cloned()
            .collect();
        window.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        window.truncate(limit);
        Ok(window)
    }

    async fn insert_room(&self, room: Room) -> StoreResult<Room> {
        self.tables
            .write()
            .await
            .rooms
            .insert(room.id.clone(), room.clone());
        Ok(room)
    }

    async fn get_room(&self, room_id: &str) -> StoreResult<Room> {
        self.tables
            .read()
            .await
            .rooms
            .get(room_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("room {}", room_id)))
    }

    async fn clear(&self) -> StoreResult<()> {
        *self.tables.write().await = Tables::default();
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
