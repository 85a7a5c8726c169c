//! Relay lifecycle with statum: `Configured -> Running -> Stopped`.
//!
//! `Relay<Running>` carries the framework-facing surface (publish, subscribe,
//! notify, history). The broker connection behind it is owned by the
//! connection manager and torn down by `shutdown`.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rumqttc::QoS;
use statum::{machine, state};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::{CredentialProvider, CredentialVerifier};
use crate::config::RelayConfig;
use crate::error::{PersistenceError, PublishError, RelayError, SubscribeError, ValidationError};
use crate::mqtt::message_manager::{HandlerSet, InboundHandler, MessageId};
use crate::mqtt::mqtt_handler::{Ack, ConnectionManager, ConnectionState, MqttStatus, ShutdownReport};
use crate::mqtt::topic::TopicFilter;
use crate::mqtt::transport::{connect_parts, BrokerEvents, BrokerLink};
use crate::notification::{ChatNotifier, NotificationRouter, NotifyReport, NotifyTarget};
use crate::persistence::{ChatDirectory, Database, LogEntry, MessageLogger, MessageStore};
use crate::registry::{desired_set, ReconcileReport, TopicRegistry};

#[state]
#[derive(Debug, Clone)]
pub enum RelayState {
    Configured, // Components assembled, nothing spawned
    Running,    // Kernel and workers live
    Stopped,    // Connection released; history stays readable
}

#[machine]
pub struct Relay<S: RelayState> {
    config: RelayConfig,
    manager: ConnectionManager,
    registry: Arc<TopicRegistry<ConnectionManager>>,
    router: Arc<NotificationRouter<ConnectionManager>>,
    directory: Arc<dyn ChatDirectory>,
    handlers: HandlerSet,
    provider: Arc<dyn CredentialProvider>,
    verifier: Arc<dyn CredentialVerifier>,
    events: Option<Box<dyn BrokerEvents>>,
    chat_worker: Option<JoinHandle<()>>,
}

impl<S: RelayState> Relay<S> {
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    fn logger(&self) -> &MessageLogger {
        self.manager.logger()
    }

    /// Oldest first.
    pub async fn history_by_topic(
        &self,
        topic: &str,
        limit: usize,
    ) -> Result<Vec<LogEntry>, PersistenceError> {
        self.logger().history_by_topic(topic, limit).await
    }

    /// Messages whose sender is `sender`, oldest first.
    pub async fn history_by_sender(
        &self,
        sender: &str,
        limit: usize,
    ) -> Result<Vec<LogEntry>, PersistenceError> {
        self.logger().history_by_sender(sender, limit).await
    }

    pub async fn history_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LogEntry>, PersistenceError> {
        self.logger().history_between(from, to).await
    }

    pub async fn entry(&self, id: MessageId) -> Result<Option<LogEntry>, PersistenceError> {
        self.logger().by_message_id(id).await
    }
}

impl Relay<Configured> {
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        config: RelayConfig,
        store: Arc<dyn MessageStore>,
        directory: Arc<dyn ChatDirectory>,
        provider: Arc<dyn CredentialProvider>,
        verifier: Arc<dyn CredentialVerifier>,
        link: Arc<dyn BrokerLink>,
        events: Box<dyn BrokerEvents>,
    ) -> Result<Self, RelayError> {
        config.validate()?;
        info!(
            "Configuring relay for {}:{} (tls: {})",
            config.broker.broker_host, config.broker.broker_port, config.broker.use_tls
        );

        let logger = MessageLogger::new(store, config.gateway.persistence_workers);
        let manager = ConnectionManager::new(
            link,
            logger,
            config.broker.limits(),
            config.manager_settings(),
        );
        let registry = Arc::new(TopicRegistry::new(
            manager.clone(),
            config.backoff.clone(),
            config.gateway.reconcile_max_attempts,
        ));
        let router = Arc::new(NotificationRouter::new(
            manager.clone(),
            directory.clone(),
            &config.notify,
            config.default_qos(),
        ));

        Ok(Self::new(
            config,
            manager,
            registry,
            router,
            directory,
            HandlerSet::default(),
            provider,
            verifier,
            Some(events),
            None, // chat_worker
        ))
    }

    /// SQLite store at `storage.db_path`, rumqttc transport, credentials from `[auth]`.
    pub fn from_config(config: RelayConfig) -> Result<Self, RelayError> {
        config.validate()?;
        let database = Database::open(&config.storage.db_path)?;
        info!("Message log at {}", config.storage.db_path.display());
        let (link, events) = connect_parts(&config.broker);
        let provider = config.auth.provider();
        let verifier = Arc::new(config.auth.verifier());
        Self::create(
            config,
            Arc::new(database.messages()),
            Arc::new(database.catalog()),
            provider,
            verifier,
            Arc::new(link),
            Box::new(events),
        )
    }

    pub fn register_handler(
        &self,
        filter: &str,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<(), ValidationError> {
        let filter = TopicFilter::parse(filter, self.config.broker.max_topic_len)?;
        debug!("Registered inbound handler for {}", filter);
        self.handlers.register(filter, handler);
        Ok(())
    }

    pub async fn start(mut self) -> Result<Relay<Running>, RelayError> {
        let events = self
            .events
            .take()
            .ok_or_else(|| RelayError::Config("broker transport already consumed".into()))?;

        if self.config.gateway.subscribe_active_topics_on_start {
            let directory = self.directory.clone();
            let topics = tokio::task::spawn_blocking(move || directory.active_topics())
                .await
                .map_err(|e| PersistenceError::WorkerUnavailable(e.to_string()))??;
            let report = self.registry.reconcile(desired_set(topics)).await;
            info!(
                "Queued {} active topics for subscription",
                report.actions.len()
            );
        }

        let (notifier, worker) =
            ChatNotifier::spawn(self.router.clone(), self.config.gateway.inbound_capacity);
        let notifier = Arc::new(notifier);
        self.handlers.set_annotator(notifier.clone());
        self.handlers.register(TopicFilter::new("#")?, notifier);
        self.chat_worker = Some(worker);

        self.manager.spawn_kernel(
            events,
            self.provider.clone(),
            self.verifier.clone(),
            self.handlers.clone(),
        );
        info!("Relay started");
        Ok(self.transition())
    }
}

impl Relay<Running> {
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
    ) -> Result<MessageId, PublishError> {
        self.publish_with_qos(topic, payload, self.config.default_qos())
            .await
    }

    pub async fn publish_with_qos(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        qos: QoS,
    ) -> Result<MessageId, PublishError> {
        self.manager.publish(topic, payload.into(), qos, None).await
    }

    pub async fn subscribe(&self, topic: &str) -> Result<Ack, SubscribeError> {
        self.manager.subscribe(topic).await
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<Ack, SubscribeError> {
        self.manager.unsubscribe(topic).await
    }

    pub async fn live_subscriptions(&self) -> BTreeSet<TopicFilter> {
        self.manager.live_subscriptions().await
    }

    pub async fn notify(&self, payload: impl AsRef<[u8]>, target: NotifyTarget) -> NotifyReport {
        self.router.notify(payload.as_ref(), &target).await
    }

    pub async fn reconcile(&self, desired: BTreeSet<TopicFilter>) -> ReconcileReport {
        self.registry.reconcile(desired).await
    }

    /// Reconciles against the catalog's active topics.
    pub async fn reconcile_from_catalog(&self) -> Result<ReconcileReport, PersistenceError> {
        let directory = self.directory.clone();
        let topics = tokio::task::spawn_blocking(move || directory.active_topics())
            .await
            .map_err(|e| PersistenceError::WorkerUnavailable(e.to_string()))??;
        Ok(self.registry.reconcile(desired_set(topics)).await)
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.manager.state_changes()
    }

    pub fn status(&self) -> MqttStatus {
        self.manager.status()
    }

    pub async fn shutdown(mut self) -> (Relay<Stopped>, ShutdownReport) {
        let report = self.manager.shutdown(self.config.shutdown_grace()).await;
        if let Some(worker) = self.chat_worker.take() {
            worker.abort();
            if let Err(e) = worker.await {
                if !e.is_cancelled() {
                    warn!("Chat notifier ended abnormally: {}", e);
                }
            }
        }
        info!(
            "Relay stopped ({} drained, {} cancelled)",
            report.drained,
            report.cancelled.len()
        );
        (self.transition(), report)
    }
}

impl Relay<Stopped> {
    pub fn final_state(&self) -> ConnectionState {
        self.manager.state()
    }
}
