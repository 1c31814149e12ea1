/// Store record types.
/// These correspond 1:1 to the SQLite schema defined in migrations.rs.
use chrono::Utc;
use uuid::Uuid;

/// Registered user. The password is only kept as a PBKDF2 key plus salt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub username: String,
    pub password_hash: Vec<u8>,
    pub salt: Vec<u8>,
    pub kdf_iterations: u32,
    pub created_at: i64,
}

impl User {
    pub fn new(
        username: String,
        password_hash: Vec<u8>,
        salt: Vec<u8>,
        kdf_iterations: u32,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            username,
            password_hash,
            salt,
            kdf_iterations,
            created_at: now_millis(),
        }
    }
}

/// How a user record is looked up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserLookup {
    Id(String),
    Name(String),
}

/// Chat message as persisted. `timestamp` is Unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: String,
    pub author_id: String,
    pub author_name: String,
    pub content: String,
    pub timestamp: i64,
}

impl StoredMessage {
    pub fn new(author_id: &str, author_name: &str, content: String) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            author_id: author_id.to_string(),
            author_name: author_name.to_string(),
            content,
            timestamp: now_millis(),
        }
    }
}

/// Named room owned by the user who created it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    pub created_at: i64,
}

impl Room {
    pub fn new(name: String, owner_id: &str) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            name,
            owner_id: owner_id.to_string(),
            created_at: now_millis(),
        }
    }
}

/// Current time as Unix milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
