use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{Connection, ErrorCode, OptionalExtension};

use super::migrations;
use super::models::{Room, StoredMessage, User, UserLookup};
use super::{Store, StoreError, StoreResult};

/// Type alias for the shared database connection.
/// rusqlite is synchronous, so the connection sits behind Arc<Mutex> and
/// every query runs on tokio::task::spawn_blocking.
pub type DbPool = Arc<Mutex<Connection>>;

/// Initialize the SQLite database: create data directory if needed,
/// open (or create) the database file, enable WAL mode, and run migrations.
pub fn init_db(data_dir: &str) -> Result<DbPool, Box<dyn std::error::Error + Send + Sync>> {
    std::fs::create_dir_all(data_dir)?;

    let db_path = Path::new(data_dir).join("relay.db");
    let mut conn = Connection::open(&db_path)?;

    // WAL for concurrent readers
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    migrations::migrations().to_latest(&mut conn)?;

    tracing::info!("Database initialized at {}", db_path.display());

    Ok(Arc::new(Mutex::new(conn)))
}

/// [`Store`] backed by a single SQLite connection.
#[derive(Clone)]
pub struct SqliteStore {
    db: DbPool,
}

impl SqliteStore {
    pub fn open(data_dir: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self {
            db: init_db(data_dir)?,
        })
    }

    /// Private in-memory database, migrated to the latest schema.
    pub fn open_in_memory() -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let mut conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::migrations().to_latest(&mut conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn run<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|e| StoreError::Backend(format!("DB lock: {}", e)))?;
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("Task join: {}", e)))?
    }
}

fn backend(err: rusqlite::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _) if failure.code == ErrorCode::ConstraintViolation
    )
}

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        password_hash: row.get(2)?,
        salt: row.get(3)?,
        kdf_iterations: row.get(4)?,
        created_at: row.get(5)?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_user(&self, user: User) -> StoreResult<User> {
        self.run(move |conn| {
            let result = conn.execute(
                "INSERT INTO users (id, username, password_hash, salt, kdf_iterations, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    user.id,
                    user.username,
                    user.password_hash,
                    user.salt,
                    user.kdf_iterations,
                    user.created_at
                ],
            );
            match result {
                Ok(_) => Ok(user),
                Err(e) if is_constraint_violation(&e) => Err(StoreError::Conflict(format!(
                    "username {} already registered",
                    user.username
                ))),
                Err(e) => Err(backend(e)),
            }
        })
        .await
    }

    async fn get_user(&self, lookup: UserLookup) -> StoreResult<User> {
        self.run(move |conn| {
            let (sql, key) = match &lookup {
                UserLookup::Id(id) => (
                    "SELECT id, username, password_hash, salt, kdf_iterations, created_at
                     FROM users WHERE id = ?1",
                    id,
                ),
                UserLookup::Name(name) => (
                    "SELECT id, username, password_hash, salt, kdf_iterations, created_at
                     FROM users WHERE username = ?1",
                    name,
                ),
            };
            conn.query_row(sql, [key], user_from_row)
                .optional()
                .map_err(backend)?
                .ok_or_else(|| StoreError::NotFound(format!("user {}", key)))
        })
        .await
    }

    async fn insert_message(&self, message: StoredMessage) -> StoreResult<StoredMessage> {
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO messages (id, author_id, author_name, content, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    message.id,
                    message.author_id,
                    message.author_name,
                    message.content,
                    message.timestamp
                ],
            )
            .map_err(backend)?;
            Ok(message)
        })
        .await
    }

    async fn messages_between(
        &self,
        from: i64,
        to: i64,
        limit: usize,
    ) -> StoreResult<Vec<StoredMessage>> {
        self.run(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, author_id, author_name, content, timestamp FROM messages
                     WHERE timestamp >= ?1 AND timestamp <= ?2
                     ORDER BY timestamp ASC, id ASC
                     LIMIT ?3",
                )
                .map_err(backend)?;
            let rows = stmt
                .query_map(rusqlite::params![from, to, limit as i64], |row| {
                    Ok(StoredMessage {
                        id: row.get(0)?,
                        author_id: row.get(1)?,
                        author_name: row.get(2)?,
                        content: row.get(3)?,
                        timestamp: row.get(4)?,
                    })
                })
                .map_err(backend)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(backend)
        })
        .await
    }

    async fn insert_room(&self, room: Room) -> StoreResult<Room> {
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO rooms (id, name, owner_id, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![room.id, room.name, room.owner_id, room.created_at],
            )
            .map_err(backend)?;
            Ok(room)
        })
        .await
    }

    async fn get_room(&self, room_id: &str) -> StoreResult<Room> {
        let room_id = room_id.to_string();
        self.run(move |conn| {
            conn.query_row(
                "SELECT id, name, owner_id, created_at FROM rooms WHERE id = ?1",
                [&room_id],
                |row| {
                    Ok(Room {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        owner_id: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(backend)?
            .ok_or_else(|| StoreError::NotFound(format!("room {}", room_id)))
        })
        .await
    }

    async fn clear(&self) -> StoreResult<()> {
        self.run(|conn| {
            conn.execute_batch("DELETE FROM rooms; DELETE FROM messages; DELETE FROM users;")
                .map_err(backend)
        })
        .await
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}
