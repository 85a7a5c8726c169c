use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tracing::error;

use super::{DeliveryStatus, LogEntry, LogId, MessageStore};
use crate::error::PersistenceError;
use crate::mqtt::message_manager::{MessageId, RelayMessage};

/// Async front of a [`MessageStore`].
///
/// Store calls block on SQLite, so each one runs on the blocking pool. A
/// semaphore caps how many run at once; callers beyond that wait for a permit.
#[derive(Clone)]
pub struct MessageLogger {
    store: Arc<dyn MessageStore>,
    permits: Arc<Semaphore>,
    workers: usize,
}

impl MessageLogger {
    pub fn new(store: Arc<dyn MessageStore>, workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            store,
            permits: Arc::new(Semaphore::new(workers)),
            workers,
        }
    }

    async fn run<T, F>(&self, op: F) -> Result<T, PersistenceError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn MessageStore) -> Result<T, PersistenceError> + Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| PersistenceError::WorkerUnavailable(e.to_string()))?;
        let store = self.store.clone();

        let joined = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            op(store.as_ref())
        })
        .await;

        match joined {
            Ok(result) => result,
            Err(e) => {
                error!("Persistence task failed: {}", e);
                Err(PersistenceError::WorkerUnavailable(e.to_string()))
            }
        }
    }

    /// Writes a new entry; resolves once the row is durable.
    pub async fn record(
        &self,
        message: &RelayMessage,
        status: DeliveryStatus,
    ) -> Result<LogId, PersistenceError> {
        let message = message.clone();
        self.run(move |store| store.insert(&message, status)).await
    }

    pub async fn update_status(
        &self,
        log_id: LogId,
        status: DeliveryStatus,
    ) -> Result<(), PersistenceError> {
        self.run(move |store| store.update_status(log_id, status)).await
    }

    pub async fn entry(&self, log_id: LogId) -> Result<Option<LogEntry>, PersistenceError> {
        self.run(move |store| store.get(log_id)).await
    }

    pub async fn by_message_id(
        &self,
        id: MessageId,
    ) -> Result<Option<LogEntry>, PersistenceError> {
        self.run(move |store| store.find_by_message_id(&id)).await
    }

    pub async fn history_by_topic(
        &self,
        topic: &str,
        limit: usize,
    ) -> Result<Vec<LogEntry>, PersistenceError> {
        let topic = topic.to_string();
        self.run(move |store| store.by_topic(&topic, limit)).await
    }

    pub async fn history_by_sender(
        &self,
        sender: &str,
        limit: usize,
    ) -> Result<Vec<LogEntry>, PersistenceError> {
        let sender = sender.to_string();
        self.run(move |store| store.by_sender(&sender, limit)).await
    }

    pub async fn history_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LogEntry>, PersistenceError> {
        self.run(move |store| store.between(from, to)).await
    }
}

impl std::fmt::Debug for MessageLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageLogger")
            .field("workers", &self.workers)
            .field("available", &self.permits.available_permits())
            .finish()
    }
}
