//! # Persistence Module
//!
//! Durable message log and chat catalog, both kept in one SQLite database.
//!
//! Every outbound message is recorded as `pending` before it is handed to the
//! transport, and every inbound message is recorded before any handler sees it.
//! A failed write fails the operation for that message instead of being skipped.
//!
//! ```text
//! persistence/
//! ├── sqlite_store.rs        - messages table, queryable by topic, sender and time range
//! ├── catalog.rs             - topics, users and subscriptions (desired topic snapshot)
//! └── persistence_worker.rs  - MessageLogger: bounded blocking pool in front of the store
//! ```

pub mod catalog;
pub mod persistence_worker;
pub mod sqlite_store;

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::error::PersistenceError;
use crate::mqtt::message_manager::{MessageId, RelayMessage};

pub use catalog::{ChatCatalog, ChatDirectory};
pub use persistence_worker::MessageLogger;
pub use sqlite_store::SqliteMessageStore;

/// Row id of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogId(pub i64);

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
    Acknowledged,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Acknowledged => "acknowledged",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(DeliveryStatus::Pending),
            "sent" => Some(DeliveryStatus::Sent),
            "failed" => Some(DeliveryStatus::Failed),
            "acknowledged" => Some(DeliveryStatus::Acknowledged),
            _ => None,
        }
    }

    /// pending -> sent -> acknowledged, with failed reachable before acknowledgement.
    pub fn can_transition_to(&self, next: DeliveryStatus) -> bool {
        use DeliveryStatus::*;
        matches!(
            (self, next),
            (Pending, Sent) | (Pending, Failed) | (Sent, Acknowledged) | (Sent, Failed)
        )
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted message together with its current delivery status.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub log_id: LogId,
    pub message: RelayMessage,
    pub status: DeliveryStatus,
    pub updated_at: DateTime<Utc>,
}

/// Storage seam for the message log. Calls block; the [`MessageLogger`] runs
/// them on the blocking pool.
pub trait MessageStore: Send + Sync {
    fn insert(&self, message: &RelayMessage, status: DeliveryStatus)
        -> Result<LogId, PersistenceError>;

    /// Applies a validated transition; updating to the current status is a no-op.
    fn update_status(&self, log_id: LogId, status: DeliveryStatus)
        -> Result<(), PersistenceError>;

    fn get(&self, log_id: LogId) -> Result<Option<LogEntry>, PersistenceError>;

    fn find_by_message_id(&self, id: &MessageId) -> Result<Option<LogEntry>, PersistenceError>;

    fn by_topic(&self, topic: &str, limit: usize) -> Result<Vec<LogEntry>, PersistenceError>;

    /// Oldest first, like [`MessageStore::by_topic`].
    fn by_sender(&self, sender: &str, limit: usize) -> Result<Vec<LogEntry>, PersistenceError>;

    fn between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LogEntry>, PersistenceError>;
}

/// One SQLite connection shared by the message store and the chat catalog.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    PersistenceError::Database(format!(
                        "failed to create {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self, PersistenceError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, PersistenceError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        sqlite_store::init_schema(&conn)?;
        catalog::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn messages(&self) -> SqliteMessageStore {
        SqliteMessageStore::from_shared(self.conn.clone())
    }

    pub fn catalog(&self) -> ChatCatalog {
        ChatCatalog::from_shared(self.conn.clone())
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("conn", &"rusqlite::Connection")
            .finish()
    }
}

pub(crate) fn lock_conn(
    conn: &Mutex<Connection>,
) -> Result<std::sync::MutexGuard<'_, Connection>, PersistenceError> {
    conn.lock()
        .map_err(|_| PersistenceError::Database("connection mutex poisoned".into()))
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>, PersistenceError> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| PersistenceError::Corrupt(format!("timestamp {ms} out of range")))
}
