//! # Topic Registry
//!
//! Keeps the live subscription set of the connection equal to a desired
//! snapshot (normally the active topics of the chat catalog).
//!
//! Only one reconciliation runs at a time. Calls that arrive while one is
//! running coalesce: the newest desired set is applied once, and every caller
//! whose request it superseded gets that run's report.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::error::SubscribeError;
use crate::mqtt::backoff::Backoff;
use crate::mqtt::config::BackoffConfig;
use crate::mqtt::mqtt_handler::{Ack, ConnectionManager};
use crate::mqtt::topic::TopicFilter;

/// The subscription operations reconciliation needs from a connection.
pub trait SubscriptionControl: Send + Sync {
    fn subscribe(
        &self,
        filter: &TopicFilter,
    ) -> impl Future<Output = Result<Ack, SubscribeError>> + Send;

    fn unsubscribe(
        &self,
        filter: &TopicFilter,
    ) -> impl Future<Output = Result<Ack, SubscribeError>> + Send;

    fn live(&self) -> impl Future<Output = BTreeSet<TopicFilter>> + Send;
}

impl SubscriptionControl for ConnectionManager {
    fn subscribe(
        &self,
        filter: &TopicFilter,
    ) -> impl Future<Output = Result<Ack, SubscribeError>> + Send {
        let filter = filter.to_string();
        async move { ConnectionManager::subscribe(self, &filter).await }
    }

    fn unsubscribe(
        &self,
        filter: &TopicFilter,
    ) -> impl Future<Output = Result<Ack, SubscribeError>> + Send {
        let filter = filter.to_string();
        async move { ConnectionManager::unsubscribe(self, &filter).await }
    }

    fn live(&self) -> impl Future<Output = BTreeSet<TopicFilter>> + Send {
        self.live_subscriptions()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    Subscribed,
    Unsubscribed,
    Unchanged,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    /// Which request this run applied; later requests have higher numbers
    pub generation: u64,
    pub actions: Vec<(TopicFilter, ReconcileAction)>,
    /// Topics that still failed after the retry budget
    pub failures: Vec<(TopicFilter, SubscribeError)>,
}

impl ReconcileReport {
    pub fn is_converged(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn action_for(&self, filter: &TopicFilter) -> Option<ReconcileAction> {
        self.actions
            .iter()
            .find(|(f, _)| f == filter)
            .map(|(_, action)| *action)
    }
}

/// Parses catalog topic names, skipping the ones that are not valid filters.
pub fn desired_set<I, S>(topics: I) -> BTreeSet<TopicFilter>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    topics
        .into_iter()
        .filter_map(|raw| match TopicFilter::new(raw.as_ref()) {
            Ok(filter) => Some(filter),
            Err(e) => {
                warn!("Skipping catalog topic '{}': {}", raw.as_ref(), e);
                None
            }
        })
        .collect()
}

pub struct TopicRegistry<C> {
    control: C,
    retry: BackoffConfig,
    max_attempts: u32,
    generation: AtomicU64,
    pending: Mutex<Option<(u64, BTreeSet<TopicFilter>)>>,
    last: tokio::sync::Mutex<Option<ReconcileReport>>,
}

impl<C: SubscriptionControl> TopicRegistry<C> {
    pub fn new(control: C, retry: BackoffConfig, max_attempts: u32) -> Self {
        Self {
            control,
            retry,
            max_attempts: max_attempts.max(1),
            generation: AtomicU64::new(0),
            pending: Mutex::new(None),
            last: tokio::sync::Mutex::new(None),
        }
    }

    pub fn control(&self) -> &C {
        &self.control
    }

    pub async fn reconcile(&self, desired: BTreeSet<TopicFilter>) -> ReconcileReport {
        let generation = self.submit(desired);

        let mut last = self.last.lock().await;
        if let Some(report) = last.as_ref() {
            if report.generation >= generation {
                debug!(
                    "Reconcile request {} superseded by {}",
                    generation, report.generation
                );
                return report.clone();
            }
        }

        let Some((latest, desired)) = self.take_pending() else {
            return last.clone().unwrap_or_default();
        };
        let report = self.apply(latest, desired).await;
        *last = Some(report.clone());
        report
    }

    fn pending(&self) -> MutexGuard<'_, Option<(u64, BTreeSet<TopicFilter>)>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Numbers the request and stores it as the one to apply next. Both happen
    /// under the pending lock, so the stored set is always the newest one.
    fn submit(&self, desired: BTreeSet<TopicFilter>) -> u64 {
        let mut pending = self.pending();
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        *pending = Some((generation, desired));
        generation
    }

    fn take_pending(&self) -> Option<(u64, BTreeSet<TopicFilter>)> {
        self.pending().take()
    }

    async fn apply(&self, generation: u64, desired: BTreeSet<TopicFilter>) -> ReconcileReport {
        let live = self.control.live().await;
        let mut report = ReconcileReport {
            generation,
            ..Default::default()
        };

        for filter in live.difference(&desired) {
            match self
                .with_retry(filter, || self.control.unsubscribe(filter))
                .await
            {
                Ok(_) => report
                    .actions
                    .push((filter.clone(), ReconcileAction::Unsubscribed)),
                Err(e) => report.failures.push((filter.clone(), e)),
            }
        }

        for filter in &desired {
            if live.contains(filter) {
                report
                    .actions
                    .push((filter.clone(), ReconcileAction::Unchanged));
                continue;
            }
            match self
                .with_retry(filter, || self.control.subscribe(filter))
                .await
            {
                Ok(_) => report
                    .actions
                    .push((filter.clone(), ReconcileAction::Subscribed)),
                Err(e) => report.failures.push((filter.clone(), e)),
            }
        }

        info!(
            "Reconciled {} topics (request {}, {} failures)",
            desired.len(),
            generation,
            report.failures.len()
        );
        report
    }

    async fn with_retry<F, Fut>(&self, filter: &TopicFilter, op: F) -> Result<Ack, SubscribeError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Ack, SubscribeError>>,
    {
        let mut backoff = Backoff::from_config(&self.retry);
        loop {
            match op().await {
                Ok(ack) => return Ok(ack),
                Err(e @ (SubscribeError::Validation(_) | SubscribeError::ShuttingDown)) => {
                    return Err(e)
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    if backoff.attempt() >= self.max_attempts {
                        warn!(
                            "Giving up on {} after {} attempts: {}",
                            filter,
                            backoff.attempt(),
                            e
                        );
                        return Err(e);
                    }
                    warn!(
                        "Subscription change for {} failed ({}), retrying in {:?}",
                        filter, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
