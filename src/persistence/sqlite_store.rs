//! SQLite backed message log.
//!
//! # Schema
//!
//! The `messages` table has columns: `log_id`, `message_id`, `direction`,
//! `topic`, `payload`, `sender`, `receiver`, `qos`, `status`, `created_at_ms`,
//! `updated_at_ms`. Topic, sender and creation time are indexed for history
//! queries.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use tracing::debug;

use super::{from_millis, lock_conn, now_millis, DeliveryStatus, LogEntry, LogId, MessageStore};
use crate::auth::Identity;
use crate::error::PersistenceError;
use crate::mqtt::message_manager::{qos_from_level, qos_level, Direction, MessageId, RelayMessage};
use crate::mqtt::topic::Topic;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS messages (
        log_id        INTEGER PRIMARY KEY AUTOINCREMENT,
        message_id    TEXT    NOT NULL UNIQUE,
        direction     TEXT    NOT NULL,
        topic         TEXT    NOT NULL,
        payload       BLOB    NOT NULL,
        sender        TEXT,
        receiver      TEXT,
        qos           INTEGER NOT NULL,
        status        TEXT    NOT NULL,
        created_at_ms INTEGER NOT NULL,
        updated_at_ms INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_messages_topic ON messages(topic);
    CREATE INDEX IF NOT EXISTS idx_messages_created ON messages(created_at_ms);
    CREATE INDEX IF NOT EXISTS idx_messages_sender ON messages(sender);
";

const SELECT_COLUMNS: &str = "SELECT log_id, message_id, direction, topic, payload, sender,
                                     receiver, qos, status, created_at_ms, updated_at_ms
                              FROM messages";

pub(crate) fn init_schema(conn: &Connection) -> Result<(), PersistenceError> {
    // Logs written before receivers were tracked lack the column.
    let has_receiver = conn
        .prepare("SELECT 1 FROM pragma_table_info('messages') WHERE name = 'receiver'")?
        .exists([])?;
    let table_exists = conn
        .prepare("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'messages'")?
        .exists([])?;
    if table_exists && !has_receiver {
        conn.execute("ALTER TABLE messages ADD COLUMN receiver TEXT", [])?;
        debug!("Added receiver column to the message log");
    }
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct SqliteMessageStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMessageStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, PersistenceError> {
        Ok(super::Database::open(path)?.messages())
    }

    pub fn in_memory() -> Result<Self, PersistenceError> {
        Ok(super::Database::in_memory()?.messages())
    }

    pub(crate) fn from_shared(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn query(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<LogEntry>, PersistenceError> {
        let conn = lock_conn(&self.conn)?;
        let mut stmt = conn.prepare(sql)?;
        let raw = stmt
            .query_map(params, RawRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(RawRow::into_entry).collect()
    }
}

/// Column values as stored, decoded into domain types outside the row callback.
struct RawRow {
    log_id: i64,
    message_id: String,
    direction: String,
    topic: String,
    payload: Vec<u8>,
    sender: Option<String>,
    receiver: Option<String>,
    qos: u8,
    status: String,
    created_at_ms: i64,
    updated_at_ms: i64,
}

impl RawRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            log_id: row.get(0)?,
            message_id: row.get(1)?,
            direction: row.get(2)?,
            topic: row.get(3)?,
            payload: row.get(4)?,
            sender: row.get(5)?,
            receiver: row.get(6)?,
            qos: row.get(7)?,
            status: row.get(8)?,
            created_at_ms: row.get(9)?,
            updated_at_ms: row.get(10)?,
        })
    }

    fn into_entry(self) -> Result<LogEntry, PersistenceError> {
        let id = MessageId::parse(&self.message_id)
            .ok_or_else(|| PersistenceError::Corrupt(format!("message id '{}'", self.message_id)))?;
        let direction = Direction::parse(&self.direction)
            .ok_or_else(|| PersistenceError::Corrupt(format!("direction '{}'", self.direction)))?;
        let topic = Topic::parse(self.topic, usize::MAX)
            .map_err(|e| PersistenceError::Corrupt(e.to_string()))?;
        let qos = qos_from_level(self.qos)
            .ok_or_else(|| PersistenceError::Corrupt(format!("qos {}", self.qos)))?;
        let status = DeliveryStatus::parse(&self.status)
            .ok_or_else(|| PersistenceError::Corrupt(format!("status '{}'", self.status)))?;

        let message = RelayMessage::restore(
            id,
            topic,
            self.payload,
            self.sender.map(Identity::new),
            self.receiver,
            qos,
            direction,
            from_millis(self.created_at_ms)?,
        );
        Ok(LogEntry {
            log_id: LogId(self.log_id),
            message,
            status,
            updated_at: from_millis(self.updated_at_ms)?,
        })
    }
}

impl MessageStore for SqliteMessageStore {
    fn insert(
        &self,
        message: &RelayMessage,
        status: DeliveryStatus,
    ) -> Result<LogId, PersistenceError> {
        let conn = lock_conn(&self.conn)?;
        let inserted = conn.execute(
            "INSERT INTO messages (message_id, direction, topic, payload, sender, receiver, qos,
                                   status, created_at_ms, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                message.id().to_string(),
                message.direction().as_str(),
                message.topic().as_str(),
                message.payload(),
                message.sender().map(|s| s.subject().to_string()),
                message.receiver(),
                qos_level(message.qos()),
                status.as_str(),
                message.created_at().timestamp_millis(),
                now_millis(),
            ],
        );
        match inserted {
            Ok(_) => {
                let log_id = LogId(conn.last_insert_rowid());
                debug!("Logged {} as {} ({})", message.id(), log_id, status);
                Ok(log_id)
            }
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(PersistenceError::Duplicate(message.id().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn update_status(
        &self,
        log_id: LogId,
        status: DeliveryStatus,
    ) -> Result<(), PersistenceError> {
        let mut conn = lock_conn(&self.conn)?;
        let tx = conn.transaction()?;

        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM messages WHERE log_id = ?1",
                params![log_id.0],
                |row| row.get(0),
            )
            .optional()?;
        let current = current.ok_or(PersistenceError::UnknownLog(log_id.0))?;
        let current = DeliveryStatus::parse(&current)
            .ok_or_else(|| PersistenceError::Corrupt(format!("status '{current}'")))?;

        if current == status {
            return Ok(());
        }
        if !current.can_transition_to(status) {
            return Err(PersistenceError::InvalidTransition {
                from: current.to_string(),
                to: status.to_string(),
            });
        }

        tx.execute(
            "UPDATE messages SET status = ?1, updated_at_ms = ?2 WHERE log_id = ?3",
            params![status.as_str(), now_millis(), log_id.0],
        )?;
        tx.commit()?;
        debug!("Log {} moved {} -> {}", log_id, current, status);
        Ok(())
    }

    fn get(&self, log_id: LogId) -> Result<Option<LogEntry>, PersistenceError> {
        let sql = format!("{SELECT_COLUMNS} WHERE log_id = ?1");
        Ok(self.query(&sql, params![log_id.0])?.into_iter().next())
    }

    fn find_by_message_id(&self, id: &MessageId) -> Result<Option<LogEntry>, PersistenceError> {
        let sql = format!("{SELECT_COLUMNS} WHERE message_id = ?1");
        Ok(self.query(&sql, params![id.to_string()])?.into_iter().next())
    }

    fn by_topic(&self, topic: &str, limit: usize) -> Result<Vec<LogEntry>, PersistenceError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let sql = format!("{SELECT_COLUMNS} WHERE topic = ?1 ORDER BY created_at_ms, log_id LIMIT ?2");
        self.query(&sql, params![topic, limit])
    }

    fn by_sender(&self, sender: &str, limit: usize) -> Result<Vec<LogEntry>, PersistenceError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let sql =
            format!("{SELECT_COLUMNS} WHERE sender = ?1 ORDER BY created_at_ms, log_id LIMIT ?2");
        self.query(&sql, params![sender, limit])
    }

    fn between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LogEntry>, PersistenceError> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE created_at_ms >= ?1 AND created_at_ms <= ?2
             ORDER BY created_at_ms, log_id"
        );
        self.query(&sql, params![from.timestamp_millis(), to.timestamp_millis()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::QoS;

    fn outbound(topic: &str, payload: &str) -> RelayMessage {
        RelayMessage::outbound(
            Topic::new(topic).unwrap(),
            payload.as_bytes().to_vec(),
            QoS::AtLeastOnce,
            Some(Identity::new("relay")),
        )
    }

    #[test]
    fn inserted_message_reads_back_unchanged() {
        let store = SqliteMessageStore::in_memory().unwrap();
        let message = outbound("chat/general", "hello");
        let log_id = store.insert(&message, DeliveryStatus::Pending).unwrap();

        let entry = store.get(log_id).unwrap().unwrap();
        assert_eq!(entry.status, DeliveryStatus::Pending);
        assert_eq!(entry.message.id(), message.id());
        assert_eq!(entry.message.payload(), b"hello");
        assert_eq!(entry.message.sender().map(|s| s.subject()), Some("relay"));
        assert_eq!(
            entry.message.created_at().timestamp_millis(),
            message.created_at().timestamp_millis()
        );

        let by_id = store.find_by_message_id(&message.id()).unwrap().unwrap();
        assert_eq!(by_id.log_id, log_id);
    }

    #[test]
    fn duplicate_message_id_is_rejected() {
        let store = SqliteMessageStore::in_memory().unwrap();
        let message = outbound("chat/general", "hello");
        store.insert(&message, DeliveryStatus::Pending).unwrap();
        assert_eq!(
            store.insert(&message, DeliveryStatus::Pending),
            Err(PersistenceError::Duplicate(message.id().to_string()))
        );
    }

    #[test]
    fn status_follows_the_delivery_lifecycle() {
        let store = SqliteMessageStore::in_memory().unwrap();
        let log_id = store
            .insert(&outbound("chat/general", "x"), DeliveryStatus::Pending)
            .unwrap();

        assert!(matches!(
            store.update_status(log_id, DeliveryStatus::Acknowledged),
            Err(PersistenceError::InvalidTransition { .. })
        ));
        store.update_status(log_id, DeliveryStatus::Sent).unwrap();
        store.update_status(log_id, DeliveryStatus::Sent).unwrap();
        store.update_status(log_id, DeliveryStatus::Acknowledged).unwrap();
        assert!(matches!(
            store.update_status(log_id, DeliveryStatus::Failed),
            Err(PersistenceError::InvalidTransition { .. })
        ));
        assert_eq!(
            store.get(log_id).unwrap().unwrap().status,
            DeliveryStatus::Acknowledged
        );
    }

    #[test]
    fn updating_an_unknown_log_fails() {
        let store = SqliteMessageStore::in_memory().unwrap();
        assert_eq!(
            store.update_status(LogId(42), DeliveryStatus::Sent),
            Err(PersistenceError::UnknownLog(42))
        );
    }

    #[test]
    fn history_is_filtered_by_topic_and_time() {
        let store = SqliteMessageStore::in_memory().unwrap();
        let start = Utc::now() - chrono::Duration::seconds(1);
        for i in 0..5 {
            store
                .insert(&outbound("chat/general", &i.to_string()), DeliveryStatus::Pending)
                .unwrap();
        }
        store
            .insert(&outbound("chat/other", "skip"), DeliveryStatus::Pending)
            .unwrap();

        let general = store.by_topic("chat/general", 3).unwrap();
        let payloads: Vec<_> = general.iter().map(|e| e.message.payload_text().to_string()).collect();
        assert_eq!(payloads, vec!["0", "1", "2"]);

        let all = store
            .between(start, Utc::now() + chrono::Duration::seconds(1))
            .unwrap();
        assert_eq!(all.len(), 6);
        assert!(store
            .between(start - chrono::Duration::hours(2), start - chrono::Duration::hours(1))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn chat_parties_are_stored_and_queryable_by_sender() {
        let store = SqliteMessageStore::in_memory().unwrap();
        let inbound = |payload: &str, sender: &str, receiver: Option<&str>| {
            RelayMessage::inbound(
                Topic::new("chat/general").unwrap(),
                payload.as_bytes().to_vec(),
                QoS::AtLeastOnce,
            )
            .with_parties(Some(Identity::new(sender)), receiver.map(str::to_string))
        };
        store
            .insert(&inbound("a", "7", Some("8")), DeliveryStatus::Acknowledged)
            .unwrap();
        store
            .insert(&inbound("b", "9", None), DeliveryStatus::Acknowledged)
            .unwrap();
        store
            .insert(&inbound("c", "7", None), DeliveryStatus::Acknowledged)
            .unwrap();

        let from_seven = store.by_sender("7", 10).unwrap();
        let rows: Vec<_> = from_seven
            .iter()
            .map(|e| (e.message.payload_text().to_string(), e.message.receiver().map(str::to_string)))
            .collect();
        assert_eq!(
            rows,
            vec![("a".to_string(), Some("8".to_string())), ("c".to_string(), None)]
        );
        assert_eq!(store.by_sender("7", 1).unwrap().len(), 1);
        assert!(store.by_sender("nobody", 10).unwrap().is_empty());
    }

    #[test]
    fn log_without_a_receiver_column_is_upgraded() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE messages (
                log_id INTEGER PRIMARY KEY AUTOINCREMENT, message_id TEXT NOT NULL UNIQUE,
                direction TEXT NOT NULL, topic TEXT NOT NULL, payload BLOB NOT NULL,
                sender TEXT, qos INTEGER NOT NULL, status TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL, updated_at_ms INTEGER NOT NULL
            );",
        )
        .unwrap();
        init_schema(&conn).unwrap();

        let store = SqliteMessageStore::from_shared(Arc::new(Mutex::new(conn)));
        let message = outbound("chat/general", "after upgrade");
        let log_id = store.insert(&message, DeliveryStatus::Pending).unwrap();
        assert_eq!(store.get(log_id).unwrap().unwrap().message.receiver(), None);
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.db");
        let message = outbound("chat/general", "durable");
        {
            let store = SqliteMessageStore::open(&path).unwrap();
            store.insert(&message, DeliveryStatus::Pending).unwrap();
        }
        let store = SqliteMessageStore::open(&path).unwrap();
        assert!(store.find_by_message_id(&message.id()).unwrap().is_some());
    }
}
