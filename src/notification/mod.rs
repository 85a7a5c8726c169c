//! # Notification Router
//!
//! Turns "notify user X" / "notify everyone" into publishes on the fixed
//! notification topics:
//!
//! ```text
//! notify/<user_id>     direct notification
//! notify/broadcast     broadcast copy for listeners that do not track users
//! ```
//!
//! A broadcast fans out to every active user's topic. Each resolved topic gets
//! its own result, so one failed target never hides the others.

pub mod chat;

use std::future::Future;
use std::sync::Arc;

use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{PersistenceError, PublishError, ValidationError};
use crate::mqtt::message_manager::MessageId;
use crate::mqtt::mqtt_handler::ConnectionManager;
use crate::mqtt::topic::TOPIC_DELIMITER;
use crate::persistence::ChatDirectory;

pub use chat::{ChatEnvelope, ChatNotifier};

pub const BROADCAST_SEGMENT: &str = "broadcast";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub prefix: String,
    /// Also publish broadcasts on `<prefix>/broadcast`
    pub broadcast_copy: bool,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            prefix: "notify".to_string(),
            broadcast_copy: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyTarget {
    User(String),
    Broadcast,
}

/// Publish side the router needs; implemented by the connection manager.
pub trait Publisher: Send + Sync {
    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
    ) -> impl Future<Output = Result<MessageId, PublishError>> + Send;
}

impl Publisher for ConnectionManager {
    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
    ) -> impl Future<Output = Result<MessageId, PublishError>> + Send {
        let topic = topic.to_string();
        async move { ConnectionManager::publish(self, &topic, payload, qos, None).await }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TopicResult {
    pub topic: String,
    pub result: Result<MessageId, PublishError>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotifyReport {
    pub results: Vec<TopicResult>,
    /// Set when the active-user list could not be read for a broadcast
    pub directory_error: Option<PersistenceError>,
}

impl NotifyReport {
    pub fn all_ok(&self) -> bool {
        self.directory_error.is_none() && self.results.iter().all(|r| r.result.is_ok())
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &TopicResult> {
        self.results.iter().filter(|r| r.result.is_ok())
    }

    pub fn failed(&self) -> impl Iterator<Item = &TopicResult> {
        self.results.iter().filter(|r| r.result.is_err())
    }

    pub fn result_for(&self, topic: &str) -> Option<&Result<MessageId, PublishError>> {
        self.results
            .iter()
            .find(|r| r.topic == topic)
            .map(|r| &r.result)
    }
}

pub struct NotificationRouter<P> {
    publisher: P,
    directory: Arc<dyn ChatDirectory>,
    prefix: String,
    broadcast_copy: bool,
    qos: QoS,
}

impl<P: Publisher> NotificationRouter<P> {
    pub fn new(
        publisher: P,
        directory: Arc<dyn ChatDirectory>,
        config: &NotifyConfig,
        qos: QoS,
    ) -> Self {
        Self {
            publisher,
            directory,
            prefix: config.prefix.trim_end_matches(TOPIC_DELIMITER).to_string(),
            broadcast_copy: config.broadcast_copy,
            qos,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    pub fn directory(&self) -> &Arc<dyn ChatDirectory> {
        &self.directory
    }

    pub fn topic_for_user(&self, user_id: &str) -> Result<String, ValidationError> {
        let invalid = user_id.is_empty()
            || user_id == BROADCAST_SEGMENT
            || user_id
                .chars()
                .any(|c| c == TOPIC_DELIMITER || c == '+' || c == '#' || c == '\0');
        if invalid {
            return Err(ValidationError::InvalidUserId(user_id.to_string()));
        }
        Ok(format!("{}{}{}", self.prefix, TOPIC_DELIMITER, user_id))
    }

    pub fn broadcast_topic(&self) -> String {
        format!("{}{}{}", self.prefix, TOPIC_DELIMITER, BROADCAST_SEGMENT)
    }

    async fn send(&self, topic: String, payload: &[u8]) -> TopicResult {
        let result = self.publisher.publish(&topic, payload.to_vec(), self.qos).await;
        match &result {
            Ok(id) => debug!("Notification {} queued on {}", id, topic),
            Err(e) => warn!("Notification on {} failed: {}", topic, e),
        }
        TopicResult { topic, result }
    }

    async fn active_users(&self) -> Result<Vec<String>, PersistenceError> {
        let directory = self.directory.clone();
        tokio::task::spawn_blocking(move || directory.active_users())
            .await
            .map_err(|e| PersistenceError::WorkerUnavailable(e.to_string()))?
    }

    pub async fn notify(&self, payload: &[u8], target: &NotifyTarget) -> NotifyReport {
        let mut report = NotifyReport::default();
        match target {
            NotifyTarget::User(user_id) => match self.topic_for_user(user_id) {
                Ok(topic) => report.results.push(self.send(topic, payload).await),
                Err(e) => report.results.push(TopicResult {
                    topic: format!("{}{}{}", self.prefix, TOPIC_DELIMITER, user_id),
                    result: Err(e.into()),
                }),
            },
            NotifyTarget::Broadcast => {
                match self.active_users().await {
                    Ok(users) => {
                        for user_id in users {
                            let result = match self.topic_for_user(&user_id) {
                                Ok(topic) => self.send(topic, payload).await,
                                Err(e) => TopicResult {
                                    topic: format!("{}{}{}", self.prefix, TOPIC_DELIMITER, user_id),
                                    result: Err(e.into()),
                                },
                            };
                            report.results.push(result);
                        }
                    }
                    Err(e) => {
                        warn!("Broadcast could not list active users: {}", e);
                        report.directory_error = Some(e);
                    }
                }
                if self.broadcast_copy {
                    let topic = self.broadcast_topic();
                    report.results.push(self.send(topic, payload).await);
                }
                info!(
                    "Broadcast reached {} of {} topics",
                    report.succeeded().count(),
                    report.results.len()
                );
            }
        }
        report
    }
}
