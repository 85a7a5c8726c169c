//! Relay messages and inbound dispatch.
//!
//! Inbound publishes are spread over a fixed set of partition workers keyed by
//! topic. Each worker records a message in the log before handing it to the
//! registered handlers, so a message is never observed by application code
//! before it is durable, and per-topic order is kept because one topic always
//! lands on the same worker. An optional annotator fills in payload-derived
//! metadata such as the chat sender before the message is recorded.

use std::borrow::Cow;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use rumqttc::QoS;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::topic::{Topic, TopicFilter};
use crate::auth::Identity;
use crate::persistence::{DeliveryStatus, MessageLogger};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        MessageId(Uuid::new_v4())
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Uuid::parse_str(raw).ok().map(MessageId)
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "inbound" => Some(Direction::Inbound),
            "outbound" => Some(Direction::Outbound),
            _ => None,
        }
    }
}

pub fn qos_level(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}

pub fn qos_from_level(level: u8) -> Option<QoS> {
    match level {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

/// A message flowing through the relay in either direction.
///
/// Immutable once created; its delivery status lives in the message log.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayMessage {
    id: MessageId,
    topic: Topic,
    payload: Vec<u8>,
    sender: Option<Identity>,
    /// Addressed user, when the payload names one
    receiver: Option<String>,
    qos: QoS,
    direction: Direction,
    created_at: DateTime<Utc>,
}

impl RelayMessage {
    pub fn outbound(topic: Topic, payload: Vec<u8>, qos: QoS, sender: Option<Identity>) -> Self {
        Self {
            id: MessageId::new(),
            topic,
            payload,
            sender,
            receiver: None,
            qos,
            direction: Direction::Outbound,
            created_at: Utc::now(),
        }
    }

    pub fn inbound(topic: Topic, payload: Vec<u8>, qos: QoS) -> Self {
        Self {
            id: MessageId::new(),
            topic,
            payload,
            sender: None,
            receiver: None,
            qos,
            direction: Direction::Inbound,
            created_at: Utc::now(),
        }
    }

    /// Rebuilds a message from stored fields.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        id: MessageId,
        topic: Topic,
        payload: Vec<u8>,
        sender: Option<Identity>,
        receiver: Option<String>,
        qos: QoS,
        direction: Direction,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            topic,
            payload,
            sender,
            receiver,
            qos,
            direction,
            created_at,
        }
    }

    pub fn with_parties(mut self, sender: Option<Identity>, receiver: Option<String>) -> Self {
        self.sender = sender;
        self.receiver = receiver;
        self
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    pub fn sender(&self) -> Option<&Identity> {
        self.sender.as_ref()
    }

    pub fn receiver(&self) -> Option<&str> {
        self.receiver.as_deref()
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn render(&self) -> String {
        format!("{}: {}\n{}", self.created_at, self.topic, self.payload_text())
    }
}

impl fmt::Display for RelayMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = self.payload_text();
        let preview: String = text.chars().take(32).collect();
        write!(f, "{} {} [{}] {}", self.created_at, self.id, self.topic, preview)
    }
}

/// Application callback for inbound messages.
pub trait InboundHandler: Send + Sync {
    fn on_message(&self, message: &RelayMessage);
}

impl<F> InboundHandler for F
where
    F: Fn(&RelayMessage) + Send + Sync,
{
    fn on_message(&self, message: &RelayMessage) {
        self(message)
    }
}

/// Fills in message metadata decoded from the payload before it is logged.
pub trait InboundAnnotator: Send + Sync {
    fn annotate(&self, message: RelayMessage) -> RelayMessage;
}

/// Registered handlers with the filter each one listens on.
#[derive(Clone, Default)]
pub struct HandlerSet {
    handlers: Arc<RwLock<Vec<(TopicFilter, Arc<dyn InboundHandler>)>>>,
    annotator: Arc<RwLock<Option<Arc<dyn InboundAnnotator>>>>,
}

impl HandlerSet {
    /// Replaces any annotator set before.
    pub fn set_annotator(&self, annotator: Arc<dyn InboundAnnotator>) {
        match self.annotator.write() {
            Ok(mut guard) => *guard = Some(annotator),
            Err(poisoned) => *poisoned.into_inner() = Some(annotator),
        }
    }

    pub fn annotate(&self, message: RelayMessage) -> RelayMessage {
        let annotator = match self.annotator.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        match annotator {
            Some(annotator) => annotator.annotate(message),
            None => message,
        }
    }

    pub fn register(&self, filter: TopicFilter, handler: Arc<dyn InboundHandler>) {
        match self.handlers.write() {
            Ok(mut guard) => guard.push((filter, handler)),
            Err(poisoned) => poisoned.into_inner().push((filter, handler)),
        }
    }

    /// Invokes every matching handler; returns how many ran.
    pub fn dispatch(&self, message: &RelayMessage) -> usize {
        let matching: Vec<Arc<dyn InboundHandler>> = {
            let guard = match self.handlers.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard
                .iter()
                .filter(|(filter, _)| filter.matches(message.topic()))
                .map(|(_, handler)| handler.clone())
                .collect()
        };
        for handler in &matching {
            handler.on_message(message);
        }
        matching.len()
    }

    pub fn len(&self) -> usize {
        self.handlers.read().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Partitioned write-before-dispatch pipeline for inbound messages.
pub struct InboundDispatcher {
    partitions: Vec<mpsc::Sender<RelayMessage>>,
    workers: Vec<JoinHandle<()>>,
}

impl InboundDispatcher {
    pub fn spawn(
        partitions: usize,
        capacity: usize,
        logger: MessageLogger,
        handlers: HandlerSet,
    ) -> Self {
        let partitions = partitions.max(1);
        let mut senders = Vec::with_capacity(partitions);
        let mut workers = Vec::with_capacity(partitions);

        for index in 0..partitions {
            let (tx, mut rx) = mpsc::channel::<RelayMessage>(capacity.max(1));
            let logger = logger.clone();
            let handlers = handlers.clone();
            workers.push(tokio::spawn(async move {
                while let Some(message) = rx.recv().await {
                    let message = handlers.annotate(message);
                    match logger.record(&message, DeliveryStatus::Acknowledged).await {
                        Ok(log_id) => {
                            let ran = handlers.dispatch(&message);
                            debug!(
                                "Partition {} dispatched {} (log {}) to {} handlers",
                                index,
                                message.id(),
                                log_id,
                                ran
                            );
                        }
                        Err(e) => {
                            error!(
                                "Dropping inbound message on {}: log unavailable: {}",
                                message.topic(),
                                e
                            );
                        }
                    }
                }
                debug!("Inbound partition {} stopped", index);
            }));
            senders.push(tx);
        }

        Self {
            partitions: senders,
            workers,
        }
    }

    pub fn partition_for(&self, topic: &Topic) -> usize {
        let mut hasher = DefaultHasher::new();
        topic.as_str().hash(&mut hasher);
        (hasher.finish() % self.partitions.len() as u64) as usize
    }

    /// Queues a message on its topic's partition, waiting if the partition is full.
    pub async fn deliver(&self, message: RelayMessage) {
        let index = self.partition_for(message.topic());
        if let Err(e) = self.partitions[index].send(message).await {
            warn!("Inbound partition {} is gone, message dropped: {}", index, e.0);
        }
    }

    /// Stops accepting messages and waits for queued ones to finish.
    pub async fn close(self) {
        drop(self.partitions);
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!("Inbound worker ended abnormally: {}", e);
            }
        }
    }
}
