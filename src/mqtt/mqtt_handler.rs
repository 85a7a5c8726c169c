//! Connection manager: the single owner of the broker connection.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Reconnecting -> Connecting ...
//!                     |                            ^
//!                     +----------------------------+
//! any state -> Disconnected (shutdown)      Connecting -> Failed (credential rejected)
//! ```
//!
//! Publishing while not connected buffers the message in a bounded reconnect
//! buffer that is flushed, in order, after the next `Connected`. Callers only
//! see an error for a transport problem when that buffer is full
//! (`PublishError::BufferExhausted`).

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use rumqttc::QoS;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use super::config::{BackoffConfig, PublishLimits};
use super::message_manager::{HandlerSet, InboundDispatcher, MessageId, RelayMessage};
use super::topic::{Topic, TopicFilter};
use super::transport::{BrokerEvents, BrokerLink, LinkEvent};
use crate::auth::{CredentialProvider, CredentialVerifier, Identity, AUDIT_TARGET};
use crate::error::{AuthError, PublishError, SubscribeError, TransportError, ValidationError};
use crate::persistence::{DeliveryStatus, LogId, MessageLogger};

const MAX_ERROR_MESSAGES: usize = 32;

#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Waiting out the backoff delay before the next attempt
    Reconnecting(Duration),
    /// Credential rejected; no further attempts until shutdown
    Failed(String),
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting(_) => "reconnecting",
            ConnectionState::Failed(_) => "failed",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Reconnecting(delay) => write!(f, "reconnecting in {delay:?}"),
            ConnectionState::Failed(reason) => write!(f, "failed: {reason}"),
            other => f.write_str(other.as_str()),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct MqttStatus {
    pub connection_state: ConnectionState,
    pub error_messages: Vec<String>,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<DateTime<Local>>,
}

impl MqttStatus {
    fn push_error(&mut self, message: String) {
        if self.error_messages.len() >= MAX_ERROR_MESSAGES {
            self.error_messages.remove(0);
        }
        self.error_messages.push(message);
    }
}

/// Result of a subscribe or unsubscribe call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Subscribed,
    Unsubscribed,
    /// Already in the subscription set; nothing was sent
    AlreadySubscribed,
    NotSubscribed,
    /// Recorded while disconnected; applied on the next connect
    Deferred,
}

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub buffer_capacity: usize,
    pub ack_timeout: Duration,
    pub inbound_partitions: usize,
    pub inbound_capacity: usize,
    pub subscribe_qos: QoS,
    pub backoff: BackoffConfig,
    /// Overrides the identity subject as MQTT username when non-empty
    pub username: String,
    /// Overrides the bearer token as MQTT password when non-empty
    pub password: String,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            buffer_capacity: 1_000,
            ack_timeout: Duration::from_secs(10),
            inbound_partitions: 4,
            inbound_capacity: 256,
            subscribe_qos: QoS::AtLeastOnce,
            backoff: BackoffConfig::default(),
            username: String::new(),
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShutdownReport {
    /// Buffered messages that went out during the grace period
    pub drained: usize,
    /// Messages still buffered when the grace period ran out (logged as failed)
    pub cancelled: Vec<MessageId>,
    pub final_state: ConnectionState,
}

#[derive(Debug, Clone)]
struct PendingPublish {
    log_id: LogId,
    message: RelayMessage,
}

#[derive(Debug, Default)]
struct Outbox {
    queue: VecDeque<PendingPublish>,
    /// Set by shutdown; nothing is queued afterwards
    sealed: bool,
    cancelled: Vec<MessageId>,
}

#[derive(Debug)]
struct AckEntry {
    log_id: LogId,
    qos: QoS,
    pkid: Option<u16>,
    sent: bool,
    acked: bool,
    since: Instant,
}

/// Matches broker acknowledgements to logged messages.
///
/// Publishes are pushed in the order they are handed to the client, which is
/// the order the client assigns packet ids. An ack can arrive before the
/// `sent` status is written; whichever side comes second writes `acknowledged`.
#[derive(Debug, Default)]
struct AckTracker {
    queued: VecDeque<MessageId>,
    by_pkid: HashMap<u16, MessageId>,
    entries: HashMap<MessageId, AckEntry>,
    /// Packet ids from a lost session that the client may replay
    stale: HashSet<u16>,
    /// Publishes of a lost session that never got a packet id. The client
    /// replays them first on the next connection under fresh ids.
    replays: usize,
}

impl AckTracker {
    fn push(&mut self, id: MessageId, log_id: LogId, qos: QoS) {
        self.queued.push_back(id);
        self.entries.insert(
            id,
            AckEntry {
                log_id,
                qos,
                pkid: None,
                sent: false,
                acked: false,
                since: Instant::now(),
            },
        );
    }

    fn cancel(&mut self, id: MessageId) {
        self.queued.retain(|queued| *queued != id);
        if let Some(entry) = self.entries.remove(&id) {
            if let Some(pkid) = entry.pkid {
                self.by_pkid.remove(&pkid);
            }
        }
    }

    fn on_outgoing(&mut self, pkid: u16) {
        if pkid != 0 && self.stale.remove(&pkid) {
            return;
        }
        if self.replays > 0 {
            self.replays -= 1;
            return;
        }
        let Some(id) = self.queued.pop_front() else {
            return;
        };
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        if entry.qos == QoS::AtMostOnce {
            self.entries.remove(&id);
        } else {
            entry.pkid = Some(pkid);
            self.by_pkid.insert(pkid, id);
        }
    }

    /// Returns the log to mark acknowledged once `sent` has been written.
    fn on_ack(&mut self, pkid: u16) -> Option<LogId> {
        let id = self.by_pkid.remove(&pkid)?;
        let entry = self.entries.get_mut(&id)?;
        if entry.sent {
            self.entries.remove(&id).map(|e| e.log_id)
        } else {
            entry.acked = true;
            None
        }
    }

    /// Returns the log to mark acknowledged if the ack already arrived.
    fn mark_sent(&mut self, id: MessageId) -> Option<LogId> {
        let entry = self.entries.get_mut(&id)?;
        if entry.acked {
            self.entries.remove(&id).map(|e| e.log_id)
        } else {
            entry.sent = true;
            None
        }
    }

    /// Connection lost: acks for earlier publishes will not arrive on the new session.
    fn reset(&mut self) {
        self.stale.extend(self.by_pkid.drain().map(|(pkid, _)| pkid));
        self.replays += self.queued.len();
        self.queued.clear();
        self.entries.clear();
    }

    fn expire(&mut self, timeout: Duration) -> Vec<MessageId> {
        let expired: Vec<MessageId> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.sent && entry.since.elapsed() > timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.cancel(*id);
        }
        expired
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

struct PublishDrain {
    inflight: AtomicUsize,
    notify: Notify,
}

impl PublishDrain {
    fn new() -> Self {
        Self {
            inflight: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    fn enter(self: &Arc<Self>) -> PublishGuard {
        self.inflight.fetch_add(1, Ordering::AcqRel);
        PublishGuard {
            drain: self.clone(),
        }
    }

    fn is_idle(&self) -> bool {
        self.inflight.load(Ordering::Acquire) == 0
    }
}

struct PublishGuard {
    drain: Arc<PublishDrain>,
}

impl Drop for PublishGuard {
    fn drop(&mut self) {
        if self.drain.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drain.notify.notify_waiters();
        }
    }
}

struct Shared {
    link: Arc<dyn BrokerLink>,
    logger: MessageLogger,
    limits: PublishLimits,
    settings: ManagerSettings,
    state: watch::Sender<ConnectionState>,
    status: Mutex<MqttStatus>,
    subscriptions: tokio::sync::Mutex<BTreeSet<TopicFilter>>,
    outbox: Mutex<Outbox>,
    send_lock: tokio::sync::Mutex<()>,
    acks: Mutex<AckTracker>,
    drain: Arc<PublishDrain>,
    closing: AtomicBool,
    flushing: AtomicBool,
    cancel: CancellationToken,
    kernel: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Handle to the process-wide broker connection. Clones share one connection.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(
        link: Arc<dyn BrokerLink>,
        logger: MessageLogger,
        limits: PublishLimits,
        settings: ManagerSettings,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                link,
                logger,
                limits,
                settings,
                state,
                status: Mutex::new(MqttStatus::default()),
                subscriptions: tokio::sync::Mutex::new(BTreeSet::new()),
                outbox: Mutex::new(Outbox::default()),
                send_lock: tokio::sync::Mutex::new(()),
                acks: Mutex::new(AckTracker::default()),
                drain: Arc::new(PublishDrain::new()),
                closing: AtomicBool::new(false),
                flushing: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                kernel: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state.borrow().is_connected()
    }

    pub fn status(&self) -> MqttStatus {
        let mut status = lock(&self.shared.status).clone();
        status.connection_state = self.state();
        status
    }

    pub fn buffered(&self) -> usize {
        lock(&self.shared.outbox).queue.len()
    }

    pub fn limits(&self) -> PublishLimits {
        self.shared.limits
    }

    pub fn logger(&self) -> &MessageLogger {
        &self.shared.logger
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.shared.state.send_replace(next.clone());
        if previous != next {
            info!("Broker connection: {} -> {}", previous, next);
        }
    }

    fn note_error(&self, message: String) {
        lock(&self.shared.status).push_error(message);
    }

    fn touch(&self, update: impl FnOnce(&mut MqttStatus)) {
        let mut status = lock(&self.shared.status);
        update(&mut status);
        status.last_activity = Some(Local::now());
    }

    /// Validates, logs as `pending`, then hands the message to the transport or
    /// the reconnect buffer. Returns once one of the two holds the message.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        sender: Option<Identity>,
    ) -> Result<MessageId, PublishError> {
        if self.shared.closing.load(Ordering::Acquire) {
            return Err(PublishError::ShuttingDown);
        }
        let limits = self.shared.limits;
        let topic = Topic::parse(topic, limits.max_topic_len)?;
        if payload.len() > limits.max_payload_bytes {
            return Err(ValidationError::PayloadTooLarge {
                len: payload.len(),
                max: limits.max_payload_bytes,
            }
            .into());
        }

        let _guard = self.shared.drain.enter();
        let message = RelayMessage::outbound(topic, payload, qos, sender);
        let id = message.id();
        let log_id = self
            .shared
            .logger
            .record(&message, DeliveryStatus::Pending)
            .await?;
        let pending = PendingPublish { log_id, message };

        let direct = self.is_connected() && lock(&self.shared.outbox).queue.is_empty();
        if direct {
            match self.transmit(&pending).await {
                Ok(()) => {
                    self.after_transmit(&pending).await;
                    return Ok(id);
                }
                Err(e) => {
                    warn!("Publish {} not written to transport ({}), buffering", id, e);
                    self.note_error(e.to_string());
                }
            }
        }

        self.enqueue(pending).await?;
        Ok(id)
    }

    async fn transmit(&self, pending: &PendingPublish) -> Result<(), TransportError> {
        let message = &pending.message;
        let _order = self.shared.send_lock.lock().await;
        lock(&self.shared.acks).push(message.id(), pending.log_id, message.qos());
        let written = self
            .shared
            .link
            .publish(
                message.topic().to_string(),
                message.qos(),
                message.payload().to_vec(),
            )
            .await;
        if written.is_err() {
            lock(&self.shared.acks).cancel(message.id());
        }
        written
    }

    async fn after_transmit(&self, pending: &PendingPublish) {
        let id = pending.message.id();
        let logger = &self.shared.logger;
        if let Err(e) = logger.update_status(pending.log_id, DeliveryStatus::Sent).await {
            error!("Publish {} went out but could not be marked sent: {}", id, e);
            return;
        }
        self.touch(|status| status.messages_sent += 1);
        debug!("Publish {} on {} sent", id, pending.message.topic());

        let early_ack = lock(&self.shared.acks).mark_sent(id);
        if let Some(log_id) = early_ack {
            if let Err(e) = logger
                .update_status(log_id, DeliveryStatus::Acknowledged)
                .await
            {
                error!("Failed to mark {} acknowledged: {}", id, e);
            }
        }
    }

    async fn enqueue(&self, pending: PendingPublish) -> Result<(), PublishError> {
        let capacity = self.shared.settings.buffer_capacity;
        let rejected = {
            let mut outbox = lock(&self.shared.outbox);
            if outbox.sealed {
                outbox.cancelled.push(pending.message.id());
                Some(PublishError::Cancelled)
            } else if outbox.queue.len() >= capacity {
                Some(PublishError::BufferExhausted { capacity })
            } else {
                debug!(
                    "Buffered {} ({} of {})",
                    pending.message.id(),
                    outbox.queue.len() + 1,
                    capacity
                );
                outbox.queue.push_back(pending.clone());
                None
            }
        };

        if let Some(err) = rejected {
            warn!("Publish {} rejected: {}", pending.message.id(), err);
            self.mark_failed(pending.log_id).await;
            return Err(err);
        }
        if self.is_connected() {
            self.kick_flush();
        }
        Ok(())
    }

    async fn mark_failed(&self, log_id: LogId) {
        if let Err(e) = self
            .shared
            .logger
            .update_status(log_id, DeliveryStatus::Failed)
            .await
        {
            error!("Failed to mark log {} failed: {}", log_id, e);
        }
    }

    fn kick_flush(&self) {
        if self.shared.flushing.swap(true, Ordering::AcqRel) {
            return;
        }
        let manager = self.clone();
        tokio::spawn(async move { manager.flush().await });
    }

    /// Sends buffered messages in order while the connection holds.
    async fn flush(&self) {
        let _guard = self.shared.drain.enter();
        let mut flushed = 0usize;
        while self.is_connected() {
            let next = lock(&self.shared.outbox).queue.pop_front();
            let Some(pending) = next else {
                break;
            };
            match self.transmit(&pending).await {
                Ok(()) => {
                    self.after_transmit(&pending).await;
                    flushed += 1;
                }
                Err(e) => {
                    warn!("Flush of {} interrupted: {}", pending.message.id(), e);
                    let sealed = {
                        let mut outbox = lock(&self.shared.outbox);
                        if outbox.sealed {
                            outbox.cancelled.push(pending.message.id());
                            true
                        } else {
                            outbox.queue.push_front(pending.clone());
                            false
                        }
                    };
                    if sealed {
                        self.mark_failed(pending.log_id).await;
                    }
                    break;
                }
            }
        }
        if flushed > 0 {
            info!("Flushed {} buffered messages", flushed);
        }
        self.shared.flushing.store(false, Ordering::Release);

        let more = !lock(&self.shared.outbox).queue.is_empty();
        if more && self.is_connected() {
            self.kick_flush();
        }
    }

    /// Idempotent: a pattern already in the set is not sent again.
    pub async fn subscribe(&self, filter: &str) -> Result<Ack, SubscribeError> {
        if self.shared.closing.load(Ordering::Acquire) {
            return Err(SubscribeError::ShuttingDown);
        }
        let filter = TopicFilter::parse(filter, self.shared.limits.max_topic_len)?;
        let mut subscriptions = self.shared.subscriptions.lock().await;
        if subscriptions.contains(&filter) {
            return Ok(Ack::AlreadySubscribed);
        }
        if !self.is_connected() {
            debug!("Subscription to {} deferred until connected", filter);
            subscriptions.insert(filter);
            return Ok(Ack::Deferred);
        }
        self.shared
            .link
            .subscribe(filter.to_string(), self.shared.settings.subscribe_qos)
            .await?;
        info!("Subscribed to {}", filter);
        subscriptions.insert(filter);
        Ok(Ack::Subscribed)
    }

    pub async fn unsubscribe(&self, filter: &str) -> Result<Ack, SubscribeError> {
        if self.shared.closing.load(Ordering::Acquire) {
            return Err(SubscribeError::ShuttingDown);
        }
        let filter = TopicFilter::parse(filter, self.shared.limits.max_topic_len)?;
        let mut subscriptions = self.shared.subscriptions.lock().await;
        if !subscriptions.contains(&filter) {
            return Ok(Ack::NotSubscribed);
        }
        if !self.is_connected() {
            subscriptions.remove(&filter);
            return Ok(Ack::Deferred);
        }
        self.shared.link.unsubscribe(filter.to_string()).await?;
        info!("Unsubscribed from {}", filter);
        subscriptions.remove(&filter);
        Ok(Ack::Unsubscribed)
    }

    pub async fn live_subscriptions(&self) -> BTreeSet<TopicFilter> {
        self.shared.subscriptions.lock().await.clone()
    }

    /// Clean sessions drop broker-side subscriptions, so the full set is sent again.
    async fn resubscribe_all(&self) {
        let subscriptions = self.shared.subscriptions.lock().await;
        for filter in subscriptions.iter() {
            if let Err(e) = self
                .shared
                .link
                .subscribe(filter.to_string(), self.shared.settings.subscribe_qos)
                .await
            {
                warn!("Resubscribe to {} failed: {}", filter, e);
                self.note_error(e.to_string());
            }
        }
        if !subscriptions.is_empty() {
            info!("Restored {} subscriptions", subscriptions.len());
        }
    }

    /// Starts the connection kernel. Calling it twice has no effect.
    pub fn spawn_kernel(
        &self,
        events: Box<dyn BrokerEvents>,
        provider: Arc<dyn CredentialProvider>,
        verifier: Arc<dyn CredentialVerifier>,
        handlers: HandlerSet,
    ) {
        let mut kernel = lock(&self.shared.kernel);
        if kernel.is_some() {
            warn!("Connection kernel already running");
            return;
        }
        let settings = &self.shared.settings;
        let dispatcher = InboundDispatcher::spawn(
            settings.inbound_partitions,
            settings.inbound_capacity,
            self.shared.logger.clone(),
            handlers,
        );
        let manager = self.clone();
        *kernel = Some(tokio::spawn(async move {
            manager.run_kernel(events, provider, verifier, dispatcher).await
        }));
    }

    fn credentials(
        &self,
        provider: &dyn CredentialProvider,
        verifier: &dyn CredentialVerifier,
    ) -> Result<(Identity, String, String), AuthError> {
        let token = provider.next_token()?;
        let identity = verifier.verify(&token)?;
        let settings = &self.shared.settings;
        let username = if settings.username.is_empty() {
            identity.subject().to_string()
        } else {
            settings.username.clone()
        };
        let password = if settings.password.is_empty() {
            token
        } else {
            settings.password.clone()
        };
        Ok((identity, username, password))
    }

    async fn park_failed(&self, reason: String) {
        error!("Broker connection stopped: {}", reason);
        self.note_error(reason.clone());
        self.set_state(ConnectionState::Failed(reason));
        self.shared.cancel.cancelled().await;
    }

    async fn run_kernel(
        self,
        mut events: Box<dyn BrokerEvents>,
        provider: Arc<dyn CredentialProvider>,
        verifier: Arc<dyn CredentialVerifier>,
        dispatcher: InboundDispatcher,
    ) {
        let cancel = self.shared.cancel.clone();
        let ack_timeout = self.shared.settings.ack_timeout;
        let mut backoff = Backoff::from_config(&self.shared.settings.backoff);
        let mut sweep = tokio::time::interval((ack_timeout / 2).max(Duration::from_millis(50)));

        'session: loop {
            let identity = match self.credentials(provider.as_ref(), verifier.as_ref()) {
                Ok((identity, username, password)) => {
                    events.set_credentials(&username, &password);
                    identity
                }
                Err(e) => {
                    self.park_failed(e.to_string()).await;
                    break 'session;
                }
            };
            self.set_state(ConnectionState::Connecting);
            debug!("Connecting to broker as {}", identity);

            let failure = loop {
                tokio::select! {
                    _ = cancel.cancelled() => break 'session,
                    _ = sweep.tick() => {
                        let expired = lock(&self.shared.acks).expire(ack_timeout);
                        for id in expired {
                            warn!("No acknowledgement for {} within {:?}", id, ack_timeout);
                        }
                    }
                    polled = events.poll() => match polled {
                        Ok(LinkEvent::Connected) => {
                            self.set_state(ConnectionState::Connected);
                            backoff.reset();
                            let manager = self.clone();
                            tokio::spawn(async move {
                                manager.resubscribe_all().await;
                                manager.kick_flush();
                            });
                        }
                        Ok(LinkEvent::Inbound { topic, payload, qos }) => {
                            match Topic::parse(topic, usize::MAX) {
                                Ok(topic) => {
                                    self.touch(|status| status.messages_received += 1);
                                    dispatcher.deliver(RelayMessage::inbound(topic, payload, qos)).await;
                                }
                                Err(e) => warn!("Ignoring inbound publish: {}", e),
                            }
                        }
                        Ok(LinkEvent::PublishQueued { pkid }) => {
                            lock(&self.shared.acks).on_outgoing(pkid);
                        }
                        Ok(LinkEvent::Acknowledged { pkid }) => {
                            let acked = lock(&self.shared.acks).on_ack(pkid);
                            if let Some(log_id) = acked {
                                let logger = self.shared.logger.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = logger.update_status(log_id, DeliveryStatus::Acknowledged).await {
                                        error!("Failed to mark log {} acknowledged: {}", log_id, e);
                                    }
                                });
                            }
                        }
                        Ok(LinkEvent::Disconnected(reason)) => {
                            info!("Broker closed the session: {}", reason);
                            break TransportError::Closed;
                        }
                        Ok(LinkEvent::Other) => {}
                        Err(e) => break e,
                    }
                }
            };

            let lost = lock(&self.shared.acks).len();
            lock(&self.shared.acks).reset();
            if lost > 0 {
                debug!("{} publishes lost their acknowledgement tracking", lost);
            }

            if failure.is_auth_refusal() {
                warn!(target: AUDIT_TARGET, "Broker refused credential of {}: {}", identity, failure);
                if !provider.is_renewable() {
                    self.park_failed(AuthError::Rejected(failure.to_string()).to_string())
                        .await;
                    break 'session;
                }
            }

            let delay = backoff.next_delay();
            warn!(
                "Broker connection attempt {} failed: {}; retrying in {:?}",
                backoff.attempt(),
                failure,
                delay
            );
            self.note_error(failure.to_string());
            self.set_state(ConnectionState::Reconnecting(delay));

            tokio::select! {
                _ = cancel.cancelled() => break 'session,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        drop(events);
        dispatcher.close().await;
        debug!("Connection kernel stopped");
    }

    async fn wait_until(&self, deadline: tokio::time::Instant, done: impl Fn(&Self) -> bool) -> bool {
        loop {
            let notified = self.shared.drain.notify.notified();
            if done(self) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            let tick = deadline.min(tokio::time::Instant::now() + Duration::from_millis(20));
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(tick) => {}
            }
        }
    }

    /// Drains the reconnect buffer for up to `grace`, cancels what is left,
    /// then disconnects and stops the kernel.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        self.shared.closing.store(true, Ordering::Release);
        let buffered = self.buffered();
        info!(
            "Shutting down broker connection ({} buffered, grace {:?})",
            buffered, grace
        );

        let deadline = tokio::time::Instant::now() + grace;
        let idle = self
            .wait_until(deadline, |m| m.buffered() == 0 && m.shared.drain.is_idle())
            .await;
        if !idle {
            warn!("Shutdown grace period elapsed with work outstanding");
        }

        let remaining: Vec<PendingPublish> = {
            let mut outbox = lock(&self.shared.outbox);
            outbox.sealed = true;
            let remaining: Vec<_> = outbox.queue.drain(..).collect();
            outbox
                .cancelled
                .extend(remaining.iter().map(|p| p.message.id()));
            remaining
        };
        for pending in &remaining {
            self.mark_failed(pending.log_id).await;
        }
        let drained = buffered.saturating_sub(remaining.len());

        if let Err(e) = self.shared.link.disconnect().await {
            debug!("Disconnect request not delivered: {}", e);
        }
        self.shared.cancel.cancel();
        let kernel = lock(&self.shared.kernel).take();
        if let Some(handle) = kernel {
            if let Err(e) = handle.await {
                warn!("Connection kernel ended abnormally: {}", e);
            }
        }

        // Publishes still inside the manager resolve quickly once the kernel is gone.
        let settle = tokio::time::Instant::now() + grace.max(Duration::from_millis(100));
        if !self.wait_until(settle, |m| m.shared.drain.is_idle()).await {
            warn!("Publishes still in flight after shutdown");
        }

        self.set_state(ConnectionState::Disconnected);
        let cancelled = std::mem::take(&mut lock(&self.shared.outbox).cancelled);
        if !cancelled.is_empty() {
            warn!("Cancelled {} buffered publishes", cancelled.len());
        }
        ShutdownReport {
            drained,
            cancelled,
            final_state: self.state(),
        }
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("buffered", &self.buffered())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> MessageId {
        MessageId::new()
    }

    #[test]
    fn ack_after_sent_marks_acknowledged() {
        let mut tracker = AckTracker::default();
        let msg = id();
        tracker.push(msg, LogId(1), QoS::AtLeastOnce);
        tracker.on_outgoing(5);
        assert_eq!(tracker.mark_sent(msg), None);
        assert_eq!(tracker.on_ack(5), Some(LogId(1)));
        assert_eq!(tracker.len(), 0);
    }

    #[test]
    fn ack_before_sent_is_held_for_the_sender() {
        let mut tracker = AckTracker::default();
        let msg = id();
        tracker.push(msg, LogId(1), QoS::AtLeastOnce);
        tracker.on_outgoing(5);
        assert_eq!(tracker.on_ack(5), None);
        assert_eq!(tracker.mark_sent(msg), Some(LogId(1)));
    }

    #[test]
    fn packet_ids_follow_push_order() {
        let mut tracker = AckTracker::default();
        let (a, b) = (id(), id());
        tracker.push(a, LogId(1), QoS::AtLeastOnce);
        tracker.push(b, LogId(2), QoS::AtLeastOnce);
        tracker.on_outgoing(1);
        tracker.on_outgoing(2);
        tracker.mark_sent(a);
        tracker.mark_sent(b);
        assert_eq!(tracker.on_ack(2), Some(LogId(2)));
        assert_eq!(tracker.on_ack(1), Some(LogId(1)));
    }

    #[test]
    fn qos0_publishes_are_not_tracked() {
        let mut tracker = AckTracker::default();
        let msg = id();
        tracker.push(msg, LogId(1), QoS::AtMostOnce);
        tracker.on_outgoing(0);
        assert_eq!(tracker.mark_sent(msg), None);
        assert_eq!(tracker.len(), 0);
    }

    #[test]
    fn replayed_packets_from_a_lost_session_are_skipped() {
        let mut tracker = AckTracker::default();
        let old = id();
        tracker.push(old, LogId(1), QoS::AtLeastOnce);
        tracker.on_outgoing(9);
        tracker.reset();

        let fresh = id();
        tracker.push(fresh, LogId(2), QoS::AtLeastOnce);
        tracker.on_outgoing(9);
        tracker.on_outgoing(10);
        tracker.mark_sent(fresh);
        assert_eq!(tracker.on_ack(10), Some(LogId(2)));
    }

    #[test]
    fn requests_replayed_under_new_ids_do_not_shift_later_acks() {
        let mut tracker = AckTracker::default();
        let old = id();
        tracker.push(old, LogId(1), QoS::AtLeastOnce);
        tracker.mark_sent(old);
        tracker.reset();

        let fresh = id();
        tracker.push(fresh, LogId(2), QoS::AtLeastOnce);
        tracker.mark_sent(fresh);
        tracker.on_outgoing(1);
        assert_eq!(tracker.on_ack(1), None);

        tracker.on_outgoing(2);
        assert_eq!(tracker.on_ack(2), Some(LogId(2)));
    }

    #[test]
    fn replay_allowance_also_covers_qos0_requests() {
        let mut tracker = AckTracker::default();
        tracker.push(id(), LogId(1), QoS::AtMostOnce);
        tracker.push(id(), LogId(2), QoS::AtLeastOnce);
        tracker.reset();

        let fresh = id();
        tracker.push(fresh, LogId(3), QoS::AtLeastOnce);
        tracker.on_outgoing(0);
        tracker.on_outgoing(4);
        tracker.on_outgoing(5);
        tracker.mark_sent(fresh);
        assert_eq!(tracker.on_ack(4), None);
        assert_eq!(tracker.on_ack(5), Some(LogId(3)));
    }

    #[test]
    fn unacknowledged_sends_expire() {
        let mut tracker = AckTracker::default();
        let msg = id();
        tracker.push(msg, LogId(1), QoS::AtLeastOnce);
        tracker.on_outgoing(3);
        tracker.mark_sent(msg);
        assert!(tracker.expire(Duration::from_secs(60)).is_empty());
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(tracker.expire(Duration::ZERO), vec![msg]);
        assert_eq!(tracker.on_ack(3), None);
    }

    #[test]
    fn state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(
            ConnectionState::Failed("expired".into()).to_string(),
            "failed: expired"
        );
        assert!(ConnectionState::Reconnecting(Duration::from_secs(1))
            .to_string()
            .starts_with("reconnecting"));
    }

    #[test]
    fn status_keeps_a_bounded_error_history() {
        let mut status = MqttStatus::default();
        for i in 0..(MAX_ERROR_MESSAGES + 5) {
            status.push_error(i.to_string());
        }
        assert_eq!(status.error_messages.len(), MAX_ERROR_MESSAGES);
        assert_eq!(status.error_messages[0], "5");
    }
}
