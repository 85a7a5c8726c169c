//! Chat catalog: known topics, users and user subscriptions.
//!
//! The active topics form the desired subscription snapshot applied on start,
//! and the active users are the fan-out set for broadcast notifications.

use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection};
use tracing::debug;

use super::{lock_conn, now_millis};
use crate::error::PersistenceError;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS topics (
        name          TEXT    PRIMARY KEY,
        is_group      INTEGER NOT NULL DEFAULT 0,
        is_active     INTEGER NOT NULL DEFAULT 1,
        created_at_ms INTEGER NOT NULL,
        updated_at_ms INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS users (
        user_id       TEXT    PRIMARY KEY,
        is_active     INTEGER NOT NULL DEFAULT 1,
        created_at_ms INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS subscriptions (
        user_id          TEXT    NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
        topic            TEXT    NOT NULL REFERENCES topics(name) ON DELETE CASCADE,
        subscribed_at_ms INTEGER NOT NULL,
        UNIQUE(user_id, topic)
    );
";

pub(crate) fn init_schema(conn: &Connection) -> Result<(), PersistenceError> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

/// Catalog operations the relay needs at runtime.
pub trait ChatDirectory: Send + Sync {
    fn active_users(&self) -> Result<Vec<String>, PersistenceError>;
    fn active_topics(&self) -> Result<Vec<String>, PersistenceError>;

    /// Adds an unknown topic as an active non-group topic. Known topics are
    /// left untouched. Returns true when the topic was added.
    fn ensure_topic(&self, name: &str) -> Result<bool, PersistenceError>;
}

#[derive(Debug, Clone)]
pub struct ChatCatalog {
    conn: Arc<Mutex<Connection>>,
}

impl ChatCatalog {
    pub fn in_memory() -> Result<Self, PersistenceError> {
        Ok(super::Database::in_memory()?.catalog())
    }

    pub(crate) fn from_shared(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    pub fn upsert_topic(&self, name: &str, is_group: bool) -> Result<(), PersistenceError> {
        let conn = lock_conn(&self.conn)?;
        let now = now_millis();
        conn.execute(
            "INSERT INTO topics (name, is_group, is_active, created_at_ms, updated_at_ms)
             VALUES (?1, ?2, 1, ?3, ?3)
             ON CONFLICT(name) DO UPDATE SET is_group = excluded.is_group,
                                             updated_at_ms = excluded.updated_at_ms",
            params![name, is_group, now],
        )?;
        debug!("Catalog topic '{}' (group: {})", name, is_group);
        Ok(())
    }

    /// Returns false when the topic is unknown.
    pub fn set_topic_active(&self, name: &str, active: bool) -> Result<bool, PersistenceError> {
        let conn = lock_conn(&self.conn)?;
        let changed = conn.execute(
            "UPDATE topics SET is_active = ?1, updated_at_ms = ?2 WHERE name = ?3",
            params![active, now_millis(), name],
        )?;
        Ok(changed > 0)
    }

    pub fn upsert_user(&self, user_id: &str) -> Result<(), PersistenceError> {
        let conn = lock_conn(&self.conn)?;
        conn.execute(
            "INSERT INTO users (user_id, is_active, created_at_ms) VALUES (?1, 1, ?2)
             ON CONFLICT(user_id) DO NOTHING",
            params![user_id, now_millis()],
        )?;
        Ok(())
    }

    pub fn set_user_active(&self, user_id: &str, active: bool) -> Result<bool, PersistenceError> {
        let conn = lock_conn(&self.conn)?;
        let changed = conn.execute(
            "UPDATE users SET is_active = ?1 WHERE user_id = ?2",
            params![active, user_id],
        )?;
        Ok(changed > 0)
    }

    /// A user subscribes to a topic at most once; returns whether a row was added.
    /// Both the user and the topic must already exist.
    pub fn add_subscription(&self, user_id: &str, topic: &str) -> Result<bool, PersistenceError> {
        let conn = lock_conn(&self.conn)?;
        let added = conn.execute(
            "INSERT OR IGNORE INTO subscriptions (user_id, topic, subscribed_at_ms)
             VALUES (?1, ?2, ?3)",
            params![user_id, topic, now_millis()],
        )?;
        Ok(added > 0)
    }

    pub fn remove_subscription(&self, user_id: &str, topic: &str) -> Result<bool, PersistenceError> {
        let conn = lock_conn(&self.conn)?;
        let removed = conn.execute(
            "DELETE FROM subscriptions WHERE user_id = ?1 AND topic = ?2",
            params![user_id, topic],
        )?;
        Ok(removed > 0)
    }

    pub fn user_subscriptions(&self, user_id: &str) -> Result<Vec<String>, PersistenceError> {
        self.strings(
            "SELECT topic FROM subscriptions WHERE user_id = ?1 ORDER BY topic",
            user_id,
        )
    }

    pub fn topic_subscribers(&self, topic: &str) -> Result<Vec<String>, PersistenceError> {
        self.strings(
            "SELECT s.user_id FROM subscriptions s
             JOIN users u ON u.user_id = s.user_id
             WHERE s.topic = ?1 AND u.is_active = 1
             ORDER BY s.user_id",
            topic,
        )
    }

    fn strings(&self, sql: &str, arg: &str) -> Result<Vec<String>, PersistenceError> {
        let conn = lock_conn(&self.conn)?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params![arg], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn all_strings(&self, sql: &str) -> Result<Vec<String>, PersistenceError> {
        let conn = lock_conn(&self.conn)?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl ChatDirectory for ChatCatalog {
    fn active_users(&self) -> Result<Vec<String>, PersistenceError> {
        self.all_strings("SELECT user_id FROM users WHERE is_active = 1 ORDER BY user_id")
    }

    fn active_topics(&self) -> Result<Vec<String>, PersistenceError> {
        self.all_strings("SELECT name FROM topics WHERE is_active = 1 ORDER BY name")
    }

    fn ensure_topic(&self, name: &str) -> Result<bool, PersistenceError> {
        let conn = lock_conn(&self.conn)?;
        let now = now_millis();
        let inserted = conn.execute(
            "INSERT INTO topics (name, is_group, is_active, created_at_ms, updated_at_ms)
             VALUES (?1, 0, 1, ?2, ?2)
             ON CONFLICT(name) DO NOTHING",
            params![name, now],
        )?;
        if inserted > 0 {
            debug!("Catalog learned topic '{}'", name);
        }
        Ok(inserted > 0)
    }
}
