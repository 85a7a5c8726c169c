//! Chat relay: inbound chat envelopes become notifications for the receiver.
//!
//! ```json
//! {"sender": 7, "receiver": 8, "message": "hi"}
//! ```
//!
//! A missing or null `receiver` broadcasts the notification. The sender and
//! receiver are copied onto the logged message, and a chat topic the catalog
//! does not know yet is added to it.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{NotificationRouter, NotifyTarget, Publisher};
use crate::auth::Identity;
use crate::mqtt::message_manager::{InboundAnnotator, InboundHandler, RelayMessage};
use crate::persistence::ChatDirectory;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChatEnvelope {
    pub sender: Value,
    #[serde(default)]
    pub receiver: Option<Value>,
    pub message: String,
}

fn user_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl ChatEnvelope {
    pub fn parse(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    pub fn sender_id(&self) -> Option<String> {
        user_id(&self.sender)
    }

    pub fn receiver_id(&self) -> Option<String> {
        self.receiver.as_ref().and_then(user_id)
    }

    pub fn target(&self) -> NotifyTarget {
        match self.receiver_id() {
            Some(receiver) => NotifyTarget::User(receiver),
            None => NotifyTarget::Broadcast,
        }
    }

    pub fn notice(&self, sender: &str) -> String {
        format!("New message from {}: {}", sender, self.message)
    }
}

#[derive(Debug)]
struct ChatNotice {
    topic: String,
    text: String,
    target: NotifyTarget,
}

/// Inbound handler feeding a background notification task.
#[derive(Clone)]
pub struct ChatNotifier {
    tx: mpsc::Sender<ChatNotice>,
    skip_prefix: String,
}

impl ChatNotifier {
    pub fn spawn<P>(router: Arc<NotificationRouter<P>>, capacity: usize) -> (Self, JoinHandle<()>)
    where
        P: Publisher + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<ChatNotice>(capacity.max(1));
        let skip_prefix = router.prefix().to_string();
        let directory = router.directory().clone();
        let worker = tokio::spawn(async move {
            while let Some(notice) = rx.recv().await {
                remember_topic(&directory, &notice.topic).await;
                let report = router.notify(notice.text.as_bytes(), &notice.target).await;
                if report.all_ok() {
                    debug!("Chat notification delivered to {} topics", report.results.len());
                } else {
                    warn!(
                        "Chat notification failed on {} of {} topics",
                        report.failed().count(),
                        report.results.len()
                    );
                }
            }
            info!("Chat notifier stopped");
        });
        (Self { tx, skip_prefix }, worker)
    }

    fn enqueue(&self, notice: ChatNotice) {
        let notice = match self.tx.try_send(notice) {
            Ok(()) => return,
            Err(TrySendError::Closed(notice)) => {
                warn!("Chat notifier is gone, notice for {} dropped", notice.topic);
                return;
            }
            Err(TrySendError::Full(notice)) => notice,
        };
        // Queue full: wait for room off the dispatch path.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime to queue the notice for {}, dropped", notice.topic);
            return;
        };
        debug!("Chat notifier queue full, deferring notice for {}", notice.topic);
        let tx = self.tx.clone();
        runtime.spawn(async move {
            if let Err(e) = tx.send(notice).await {
                warn!("Chat notifier is gone, notice for {} dropped", e.0.topic);
            }
        });
    }
}

async fn remember_topic(directory: &Arc<dyn ChatDirectory>, topic: &str) {
    let directory = directory.clone();
    let name = topic.to_string();
    match tokio::task::spawn_blocking(move || directory.ensure_topic(&name)).await {
        Ok(Ok(true)) => info!("Added chat topic {} to the catalog", topic),
        Ok(Ok(false)) => {}
        Ok(Err(e)) => warn!("Could not add chat topic {} to the catalog: {}", topic, e),
        Err(e) => warn!("Catalog update for {} did not run: {}", topic, e),
    }
}

impl InboundAnnotator for ChatNotifier {
    fn annotate(&self, message: RelayMessage) -> RelayMessage {
        if message.topic().is_under(&self.skip_prefix) {
            return message;
        }
        match ChatEnvelope::parse(message.payload()) {
            Ok(envelope) => {
                let sender = envelope.sender_id().map(Identity::new);
                message.with_parties(sender, envelope.receiver_id())
            }
            Err(_) => message,
        }
    }
}

impl InboundHandler for ChatNotifier {
    fn on_message(&self, message: &RelayMessage) {
        if message.topic().is_under(&self.skip_prefix) {
            return;
        }
        let envelope = match ChatEnvelope::parse(message.payload()) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    "Failed to decode chat payload on {}: {} ({})",
                    message.topic(),
                    e,
                    message.payload_text()
                );
                return;
            }
        };
        let Some(sender) = envelope.sender_id() else {
            warn!("Chat message on {} has no usable sender", message.topic());
            return;
        };

        self.enqueue(ChatNotice {
            topic: message.topic().to_string(),
            text: envelope.notice(&sender),
            target: envelope.target(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PersistenceError, PublishError};
    use crate::mqtt::message_manager::MessageId;
    use crate::mqtt::topic::Topic;
    use crate::notification::NotifyConfig;
    use rumqttc::QoS;
    use std::future::Future;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct SlowPublisher {
        sent: Mutex<Vec<(String, String)>>,
    }

    impl Publisher for SlowPublisher {
        fn publish(
            &self,
            topic: &str,
            payload: Vec<u8>,
            _qos: QoS,
        ) -> impl Future<Output = Result<MessageId, PublishError>> + Send {
            let topic = topic.to_string();
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                let text = String::from_utf8_lossy(&payload).to_string();
                self.sent.lock().unwrap().push((topic, text));
                Ok(MessageId::new())
            }
        }
    }

    #[derive(Default)]
    struct Topics {
        known: Mutex<Vec<String>>,
    }

    impl ChatDirectory for Topics {
        fn active_users(&self) -> Result<Vec<String>, PersistenceError> {
            Ok(Vec::new())
        }
        fn active_topics(&self) -> Result<Vec<String>, PersistenceError> {
            Ok(self.known.lock().unwrap().clone())
        }
        fn ensure_topic(&self, name: &str) -> Result<bool, PersistenceError> {
            let mut known = self.known.lock().unwrap();
            if known.iter().any(|t| t == name) {
                return Ok(false);
            }
            known.push(name.to_string());
            Ok(true)
        }
    }

    fn spawn_notifier(
        capacity: usize,
    ) -> (ChatNotifier, Arc<NotificationRouter<SlowPublisher>>, Arc<Topics>) {
        let topics = Arc::new(Topics::default());
        let router = Arc::new(NotificationRouter::new(
            SlowPublisher::default(),
            topics.clone(),
            &NotifyConfig::default(),
            QoS::AtLeastOnce,
        ));
        let (notifier, _worker) = ChatNotifier::spawn(router.clone(), capacity);
        (notifier, router, topics)
    }

    fn chat(topic: &str, payload: &str) -> RelayMessage {
        RelayMessage::inbound(
            Topic::new(topic).unwrap(),
            payload.as_bytes().to_vec(),
            QoS::AtLeastOnce,
        )
    }

    #[test]
    fn envelope_with_numeric_ids() {
        let envelope = ChatEnvelope::parse(br#"{"sender": 7, "receiver": 8, "message": "hi"}"#)
            .unwrap();
        assert_eq!(envelope.sender_id().as_deref(), Some("7"));
        assert_eq!(envelope.receiver_id().as_deref(), Some("8"));
        assert_eq!(envelope.target(), NotifyTarget::User("8".into()));
        assert_eq!(envelope.notice("7"), "New message from 7: hi");
    }

    #[test]
    fn missing_receiver_broadcasts() {
        let envelope =
            ChatEnvelope::parse(br#"{"sender": "alice", "receiver": null, "message": "hi"}"#)
                .unwrap();
        assert_eq!(envelope.target(), NotifyTarget::Broadcast);

        let envelope = ChatEnvelope::parse(br#"{"sender": "alice", "message": "hi"}"#).unwrap();
        assert_eq!(envelope.target(), NotifyTarget::Broadcast);
    }

    #[test]
    fn non_json_payload_is_an_error() {
        assert!(ChatEnvelope::parse(b"Hello, MQTT!").is_err());
    }

    #[tokio::test]
    async fn chat_parties_are_attached_to_the_message() {
        let (notifier, _, _) = spawn_notifier(4);

        let annotated =
            notifier.annotate(chat("chat/general", r#"{"sender": 7, "receiver": 8, "message": "hi"}"#));
        assert_eq!(annotated.sender().map(|s| s.subject()), Some("7"));
        assert_eq!(annotated.receiver(), Some("8"));

        let plain = notifier.annotate(chat("chat/general", "Hello, MQTT!"));
        assert!(plain.sender().is_none());
        assert!(plain.receiver().is_none());

        let own = notifier.annotate(chat("notify/8", r#"{"sender": 7, "message": "hi"}"#));
        assert!(own.sender().is_none());
    }

    #[tokio::test]
    async fn unknown_chat_topics_are_added_to_the_catalog() {
        let (notifier, router, topics) = spawn_notifier(4);
        notifier.on_message(&chat("chat/room", r#"{"sender": 7, "receiver": 8, "message": "a"}"#));
        notifier.on_message(&chat("chat/room", r#"{"sender": 8, "receiver": 7, "message": "b"}"#));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while router.publisher().sent.lock().unwrap().len() < 2 {
            assert!(tokio::time::Instant::now() < deadline, "notifications not sent");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*topics.known.lock().unwrap(), vec!["chat/room".to_string()]);
    }

    #[tokio::test]
    async fn a_full_queue_defers_notices_instead_of_dropping_them() {
        let (notifier, router, _) = spawn_notifier(1);
        for i in 0..6 {
            let payload = format!(r#"{{"sender": 7, "receiver": 8, "message": "m{i}"}}"#);
            notifier.on_message(&chat("chat/general", &payload));
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while router.publisher().sent.lock().unwrap().len() < 6 {
            assert!(tokio::time::Instant::now() < deadline, "notices were dropped");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let mut texts: Vec<String> = router
            .publisher()
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|(topic, text)| {
                assert_eq!(topic, "notify/8");
                text.clone()
            })
            .collect();
        texts.sort();
        let expected: Vec<String> = (0..6).map(|i| format!("New message from 7: m{i}")).collect();
        assert_eq!(texts, expected);
    }
}
