//! The durable outbox for one event stream.
//!
//! An [`Outbox`] sits between producers, the [`DurableStore`] and one sync
//! endpoint. It is purely reactive: it persists what it is given and
//! flushes when asked. Timers and lifecycle wiring belong to the
//! [`crate::SyncManager`].
//!
//! ## Delivery rules
//!
//! * Only ids the server lists in `accepted_ids` are deleted. Anything else
//!   in the batch stays queued, even on a 200.
//! * Any transport error or non-success status leaves the whole batch queued.
//! * Batches go oldest-enqueued-first, capped at `max_batch_size`.
//! * At most one flush per outbox runs at a time (in-process boolean lock).

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use xpsync_shared::{Event, EventId, Stream, SubjectId, ValidationError};
use xpsync_store::{DurableStore, PutOutcome, StoreError};

use crate::auth::CredentialProvider;
use crate::category::CategorySpec;
use crate::config::SyncConfig;
use crate::events::{Notifier, SyncNotification};
use crate::transport::SyncTransport;

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("Event rejected: {0}")]
    Rejected(#[from] ValidationError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Tunables for one outbox.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    pub max_batch_size: usize,
    pub follow_up_delay: Duration,
    /// Spawn a flush after every successful `enqueue`.
    pub opportunistic_flush: bool,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for OutboxConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            max_batch_size: config.max_batch_size.max(1),
            follow_up_delay: config.follow_up_delay,
            opportunistic_flush: true,
        }
    }
}

/// Result of one `flush_outbox` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FlushOutcome {
    /// Nothing queued; no request was made.
    Empty,
    /// Another flush of this outbox is in progress.
    AlreadyFlushing,
    /// No credential available; events stay queued.
    NoSession,
    /// The server answered. `remaining` counts what is still queued.
    Sent {
        sent: usize,
        accepted: usize,
        remaining: usize,
    },
    /// Storage, transport or status failure; events stay queued.
    Failed { reason: String },
}

impl FlushOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Result of the teardown path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BeaconOutcome {
    Empty,
    /// Nobody is signed in; nothing may leave without an owner check.
    NoSession,
    /// Handed off for delivery and removed from the store.
    Queued { count: usize },
    /// The delivery primitive refused the batch; events stay queued.
    Refused { count: usize },
}

/// Diagnostic snapshot of an outbox.
#[derive(Debug, Clone, Serialize)]
pub struct OutboxStatus {
    pub stream: Stream,
    pub pending: usize,
    pub events: Vec<Event>,
    pub flushing: bool,
    pub last_outcome: Option<FlushOutcome>,
}

/// Releases the flush lock on drop.
struct FlushGuard<'a>(&'a AtomicBool);

impl<'a> FlushGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Outbox {
    spec: CategorySpec,
    store: Arc<DurableStore>,
    transport: Arc<dyn SyncTransport>,
    auth: Arc<dyn CredentialProvider>,
    notifier: Notifier,
    config: OutboxConfig,
    flushing: AtomicBool,
    last_outcome: Mutex<Option<FlushOutcome>>,
}

impl Outbox {
    pub fn new(
        spec: CategorySpec,
        store: Arc<DurableStore>,
        transport: Arc<dyn SyncTransport>,
        auth: Arc<dyn CredentialProvider>,
        notifier: Notifier,
        config: OutboxConfig,
    ) -> Self {
        Self {
            spec,
            store,
            transport,
            auth,
            notifier,
            config,
            flushing: AtomicBool::new(false),
            last_outcome: Mutex::new(None),
        }
    }

    pub fn stream(&self) -> Stream {
        self.spec.stream
    }

    pub fn spec(&self) -> &CategorySpec {
        &self.spec
    }

    fn namespace(&self) -> &'static str {
        self.spec.namespace()
    }

    /// Persist `event` and kick off a background flush.
    ///
    /// The id must already be set by the producer. Returns once the event is
    /// durable; the caller never waits on the network.
    pub async fn enqueue(self: &Arc<Self>, mut event: Event) -> Result<PutOutcome, OutboxError> {
        self.spec.admit(&event)?;

        event.enqueued_at = Some(Utc::now());
        let outcome = self.store.put(self.namespace(), &event).await?;

        debug!(
            stream = %self.stream(),
            id = %event.id,
            category = %event.category,
            ?outcome,
            "event enqueued"
        );

        if self.config.opportunistic_flush {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.flush_outbox().await;
            });
        }

        Ok(outcome)
    }

    /// Deliver up to one batch of pending events.
    pub async fn flush_outbox(self: &Arc<Self>) -> FlushOutcome {
        let stream = self.stream();

        let mut pending = match self.store.get_all(self.namespace()).await {
            Ok(events) => events,
            Err(e) => {
                warn!(stream = %stream, error = %e, "could not read pending events");
                return self.record(FlushOutcome::Failed {
                    reason: e.to_string(),
                });
            }
        };
        if pending.is_empty() {
            return FlushOutcome::Empty;
        }

        let Some(_guard) = FlushGuard::acquire(&self.flushing) else {
            debug!(stream = %stream, "flush already in progress");
            return FlushOutcome::AlreadyFlushing;
        };

        let Some(token) = self.auth.access_token().await else {
            debug!(stream = %stream, pending = pending.len(), "no session, deferring flush");
            return self.record(FlushOutcome::NoSession);
        };

        // Ownership can't be checked without a principal, so nothing goes out.
        let Some(subject) = self.auth.current_subject() else {
            debug!(stream = %stream, "credential without a subject, deferring flush");
            return self.record(FlushOutcome::NoSession);
        };

        // Events owned by someone else are left for the hygiene pass.
        let before = pending.len();
        pending.retain(|e| e.subject_id == subject);
        let foreign = before - pending.len();
        if foreign > 0 {
            warn!(stream = %stream, foreign, "holding back events of another principal");
        }
        if pending.is_empty() {
            return self.record(FlushOutcome::Empty);
        }

        pending.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        let total = pending.len();
        let batch: Vec<Event> = pending
            .into_iter()
            .take(self.config.max_batch_size)
            .collect();
        let sent = batch.len();

        self.notifier.emit(SyncNotification::Started {
            stream,
            count: sent,
        });

        let response = match self
            .transport
            .send_batch(&self.spec.endpoint, &token, &batch)
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                warn!(stream = %stream, batch = sent, error = %e, "sync failed, events stay queued");
                self.notifier.emit(SyncNotification::Failed {
                    stream,
                    reason: e.to_string(),
                });
                return self.record(FlushOutcome::Failed {
                    reason: e.to_string(),
                });
            }
        };

        // Only ids that were actually in this batch count as acknowledged.
        let in_batch: HashSet<&EventId> = batch.iter().map(|e| &e.id).collect();
        let mut seen = HashSet::new();
        let acked: Vec<EventId> = response
            .accepted_ids
            .iter()
            .filter(|id| in_batch.contains(id) && seen.insert(*id))
            .cloned()
            .collect();

        if let Err(e) = self.store.delete_many(self.namespace(), &acked).await {
            // The server has applied them; a resend is a no-op there.
            warn!(stream = %stream, error = %e, "acknowledged events could not be deleted");
        }

        if acked.len() < sent {
            warn!(
                stream = %stream,
                sent,
                accepted = acked.len(),
                "partial acceptance, unacknowledged events stay queued"
            );
        } else {
            info!(stream = %stream, accepted = acked.len(), "batch acknowledged");
        }

        let accepted = acked.len();
        self.notifier.emit(SyncNotification::Succeeded {
            stream,
            accepted_ids: acked,
            total_xp: response.total_xp,
            totals: response.totals,
        });

        // Only chain another batch when this one moved the queue forward;
        // otherwise the timer owns the retry.
        if total > sent && accepted > 0 {
            self.schedule_follow_up();
        }

        self.record(FlushOutcome::Sent {
            sent,
            accepted,
            remaining: total - accepted,
        })
    }

    fn schedule_follow_up(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let delay = self.config.follow_up_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.flush_outbox().await;
        });
    }

    /// Teardown-safe delivery of everything readable without awaiting.
    ///
    /// Deletion is optimistic: once the delivery primitive has taken the
    /// batch the events are removed, since no acknowledgement can arrive.
    pub fn send_beacon_now(&self) -> BeaconOutcome {
        let stream = self.stream();
        let Some(subject) = self.auth.current_subject() else {
            debug!(stream = %stream, "no session, teardown delivery skipped");
            return BeaconOutcome::NoSession;
        };

        let mut events = self.store.get_all_sync(self.namespace());
        events.retain(|e| e.subject_id == subject);
        if events.is_empty() {
            return BeaconOutcome::Empty;
        }
        events.sort_by(|a, b| a.order_key().cmp(&b.order_key()));

        let count = events.len();
        if !self.transport.send_beacon(&self.spec.endpoint, &events) {
            warn!(stream = %stream, count, "teardown delivery refused, events stay queued");
            return BeaconOutcome::Refused { count };
        }

        let ids: Vec<EventId> = events.into_iter().map(|e| e.id).collect();
        let removed = self.store.delete_many_sync(self.namespace(), &ids);
        info!(stream = %stream, count, removed, "events handed to teardown delivery");

        BeaconOutcome::Queued { count }
    }

    /// Drop every pending event of this stream without sending it.
    pub async fn clear_all(&self) -> Result<usize, OutboxError> {
        let removed = self.store.clear(self.namespace()).await?;
        info!(stream = %self.stream(), removed, "outbox cleared");
        Ok(removed)
    }

    pub async fn pending_count(&self) -> Result<usize, OutboxError> {
        Ok(self.store.count(self.namespace()).await?)
    }

    pub async fn pending_events(&self) -> Result<Vec<Event>, OutboxError> {
        let mut events = self.store.get_all(self.namespace()).await?;
        events.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        Ok(events)
    }

    /// Pending events whose owner is not `subject`.
    pub async fn subject_mismatches(&self, subject: &SubjectId) -> Result<Vec<Event>, OutboxError> {
        Ok(self
            .pending_events()
            .await?
            .into_iter()
            .filter(|e| &e.subject_id != subject)
            .collect())
    }

    pub async fn purge_ids(&self, ids: &[EventId]) -> Result<usize, OutboxError> {
        Ok(self.store.delete_many(self.namespace(), ids).await?)
    }

    pub async fn get_status(&self) -> Result<OutboxStatus, OutboxError> {
        let events = self.pending_events().await?;
        Ok(OutboxStatus {
            stream: self.stream(),
            pending: events.len(),
            events,
            flushing: self.flushing.load(Ordering::Acquire),
            last_outcome: self.last_outcome(),
        })
    }

    pub fn last_outcome(&self) -> Option<FlushOutcome> {
        match self.last_outcome.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn record(&self, outcome: FlushOutcome) -> FlushOutcome {
        match self.last_outcome.lock() {
            Ok(mut guard) => *guard = Some(outcome.clone()),
            Err(poisoned) => *poisoned.into_inner() = Some(outcome.clone()),
        }
        outcome
    }
}
