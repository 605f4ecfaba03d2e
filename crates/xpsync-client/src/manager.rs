//! Process-wide flush scheduler.
//!
//! The [`SyncManager`] owns the periodic flush timer and every lifecycle
//! subscription. It knows nothing about categories: it only calls
//! `flush_outbox()` and `send_beacon_now()` on the outboxes it was built
//! with.
//!
//! ## States
//!
//! ```text
//! Idle -> Flushing -> Idle
//! ```
//!
//! `Verifying` is reserved for server reconciliation and never entered.
//! Flushes are always triggered by time or by an event, never by a state
//! change.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use xpsync_shared::Stream;

use crate::config::SyncConfig;
use crate::events::{Notifier, SyncNotification};
use crate::lifecycle::LifecycleEvent;
use crate::outbox::{BeaconOutcome, FlushOutcome, Outbox};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Flushing,
    Verifying,
}

/// What a call to [`SyncManager::flush`] did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "outboxes", rename_all = "snake_case")]
pub enum FlushReport {
    /// Nothing queued anywhere.
    Idle,
    /// Marked offline by the host.
    Offline,
    /// Too soon after the last successful pass.
    Throttled,
    /// Another pass is running.
    InProgress,
    Completed(Vec<(Stream, FlushOutcome)>),
}

#[derive(Debug, Clone, Copy)]
struct Timing {
    flush_interval: Duration,
    min_flush_interval: Duration,
}

pub struct SyncManager {
    outboxes: Vec<Arc<Outbox>>,
    timing: Timing,
    notifier: Notifier,
    state: Mutex<SyncState>,
    last_flush: Mutex<Option<Instant>>,
    online: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SyncManager {
    pub fn new(outboxes: Vec<Arc<Outbox>>, config: &SyncConfig, notifier: Notifier) -> Self {
        Self {
            outboxes,
            timing: Timing {
                flush_interval: config.flush_interval,
                min_flush_interval: config.min_flush_interval,
            },
            notifier,
            state: Mutex::new(SyncState::Idle),
            last_flush: Mutex::new(None),
            online: AtomicBool::new(true),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn outboxes(&self) -> &[Arc<Outbox>] {
        &self.outboxes
    }

    pub fn state(&self) -> SyncState {
        *lock(&self.state)
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncNotification> {
        self.notifier.subscribe()
    }

    /// Start the periodic timer and, when given, the lifecycle listener.
    /// A second call is ignored.
    pub fn initialize(self: &Arc<Self>, lifecycle: Option<mpsc::Receiver<LifecycleEvent>>) {
        let mut tasks = lock(&self.tasks);
        if !tasks.is_empty() {
            warn!("sync manager already initialized");
            return;
        }

        let period = self.timing.flush_interval;
        let weak = Arc::downgrade(self);
        tasks.push(tokio::spawn(run_timer(weak, period)));

        if let Some(rx) = lifecycle {
            let weak = Arc::downgrade(self);
            tasks.push(tokio::spawn(run_lifecycle(weak, rx)));
        }

        info!(
            outboxes = self.outboxes.len(),
            interval_secs = period.as_secs(),
            "sync manager initialized"
        );
    }

    async fn total_pending(&self) -> usize {
        let counts = join_all(self.outboxes.iter().map(|o| o.pending_count())).await;
        counts
            .into_iter()
            .map(|c| match c {
                Ok(n) => n,
                // unknown: let the outbox itself hit and report the error
                Err(_) => 1,
            })
            .sum()
    }

    /// Throttled flush of every outbox.
    pub async fn flush(&self) -> FlushReport {
        if self.total_pending().await == 0 {
            return FlushReport::Idle;
        }

        if !self.is_online() {
            trace!("offline, flush skipped");
            return FlushReport::Offline;
        }

        {
            let mut state = lock(&self.state);
            if *state == SyncState::Flushing {
                return FlushReport::InProgress;
            }
            let last = *lock(&self.last_flush);
            if let Some(at) = last {
                if at.elapsed() < self.timing.min_flush_interval {
                    trace!("flush throttled");
                    return FlushReport::Throttled;
                }
            }
            *state = SyncState::Flushing;
        }

        let outcomes = join_all(self.outboxes.iter().map(|o| async move {
            (o.stream(), o.flush_outbox().await)
        }))
        .await;

        let failed = outcomes.iter().any(|(_, o)| o.is_failure());
        if !failed {
            *lock(&self.last_flush) = Some(Instant::now());
        }
        *lock(&self.state) = SyncState::Idle;

        debug!(?outcomes, "flush pass finished");
        FlushReport::Completed(outcomes)
    }

    /// Reset the throttle and flush now.
    pub async fn force_flush(&self) -> FlushReport {
        *lock(&self.last_flush) = None;
        self.flush().await
    }

    /// Hand everything pending to teardown-safe delivery, once per outbox.
    pub fn send_beacons(&self) -> Vec<(Stream, BeaconOutcome)> {
        self.outboxes
            .iter()
            .map(|o| (o.stream(), o.send_beacon_now()))
            .collect()
    }

    pub async fn handle_lifecycle(&self, event: LifecycleEvent) {
        debug!(?event, "lifecycle event");
        if event.is_teardown() {
            let outcomes = self.send_beacons();
            debug!(?outcomes, "teardown delivery attempted");
            return;
        }
        match event {
            LifecycleEvent::Hidden | LifecycleEvent::Unload => {}
            LifecycleEvent::Visible => {
                self.flush().await;
            }
            LifecycleEvent::Online => {
                self.online.store(true, Ordering::Release);
                info!("network back online, flushing");
                self.force_flush().await;
            }
            LifecycleEvent::Offline => {
                self.online.store(false, Ordering::Release);
                info!("network offline, periodic flushes paused");
            }
        }
    }

    /// Stop background tasks and make one last forced flush. Run before an
    /// intentional logout.
    pub async fn cleanup(&self) -> FlushReport {
        let tasks: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        info!(stopped = tasks.len(), "sync manager stopping");
        self.force_flush().await
    }
}

async fn run_timer(manager: Weak<SyncManager>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick fires immediately
    interval.tick().await;

    loop {
        interval.tick().await;
        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.flush().await;
    }
}

async fn run_lifecycle(manager: Weak<SyncManager>, mut rx: mpsc::Receiver<LifecycleEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.handle_lifecycle(event).await;
    }
    debug!("lifecycle listener ended");
}

#[cfg(test)]
mod tests {
    use xpsync_shared::Event;

    use super::*;
    use crate::category::CategorySpec;
    use crate::testing::{self, eventually, MockTransport, Reply};

    struct Fixture {
        _dir: tempfile::TempDir,
        transport: Arc<MockTransport>,
        manager: Arc<SyncManager>,
    }

    fn fixture(reply: Reply, config: SyncConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = testing::open_store(dir.path());
        let transport = MockTransport::new(reply);
        let auth = testing::signed_in("u1");
        let outboxes = vec![
            testing::outbox(
                CategorySpec::xp(),
                store.clone(),
                transport.clone(),
                auth.clone(),
                testing::quiet_config(),
            ),
            testing::outbox(
                CategorySpec::quest(),
                store,
                transport.clone(),
                auth,
                testing::quiet_config(),
            ),
        ];
        let manager = Arc::new(SyncManager::new(outboxes, &config, Notifier::new()));
        Fixture {
            _dir: dir,
            transport,
            manager,
        }
    }

    async fn seed(manager: &SyncManager) {
        manager.outboxes()[0]
            .enqueue(Event::xp("u1", "typing", 3).with_id("x1"))
            .await
            .unwrap();
        manager.outboxes()[1]
            .enqueue(Event::quest_progress("u1", "q1", 1).with_id("q1"))
            .await
            .unwrap();
    }

    fn calls_for(transport: &MockTransport, endpoint: &str) -> usize {
        transport
            .batch_calls()
            .iter()
            .filter(|c| c.endpoint == endpoint)
            .count()
    }

    #[tokio::test]
    async fn idle_when_nothing_is_queued() {
        let f = fixture(Reply::AcceptAll { total_xp: None }, SyncConfig::default());
        assert_eq!(f.manager.flush().await, FlushReport::Idle);
        assert!(f.transport.calls().is_empty());
    }

    #[tokio::test]
    async fn second_flush_within_interval_is_throttled() {
        // nothing accepted, so events stay queued for the second call
        let f = fixture(Reply::Accept(Vec::new()), SyncConfig::default());
        seed(&f.manager).await;

        assert!(matches!(f.manager.flush().await, FlushReport::Completed(_)));
        assert_eq!(f.manager.flush().await, FlushReport::Throttled);

        assert_eq!(calls_for(&f.transport, "/api/xp/sync"), 1);
        assert_eq!(calls_for(&f.transport, "/api/quests/sync"), 1);
        assert_eq!(f.manager.state(), SyncState::Idle);
    }

    #[tokio::test]
    async fn force_flush_bypasses_the_throttle() {
        let f = fixture(Reply::Accept(Vec::new()), SyncConfig::default());
        seed(&f.manager).await;

        f.manager.flush().await;
        assert!(matches!(f.manager.force_flush().await, FlushReport::Completed(_)));
        assert_eq!(calls_for(&f.transport, "/api/xp/sync"), 2);
    }

    #[tokio::test]
    async fn failed_pass_does_not_arm_the_throttle() {
        let f = fixture(Reply::Status(502), SyncConfig::default());
        seed(&f.manager).await;

        f.manager.flush().await;
        assert!(matches!(f.manager.flush().await, FlushReport::Completed(_)));
        assert_eq!(calls_for(&f.transport, "/api/xp/sync"), 2);
    }

    #[tokio::test]
    async fn offline_pauses_until_online() {
        let f = fixture(Reply::AcceptAll { total_xp: None }, SyncConfig::default());
        seed(&f.manager).await;

        f.manager.handle_lifecycle(LifecycleEvent::Offline).await;
        assert_eq!(f.manager.flush().await, FlushReport::Offline);
        assert!(f.transport.calls().is_empty());

        f.manager.handle_lifecycle(LifecycleEvent::Online).await;
        assert_eq!(f.transport.batch_calls().len(), 2);
        assert_eq!(f.manager.flush().await, FlushReport::Idle);
    }

    #[tokio::test]
    async fn hidden_triggers_one_beacon_per_outbox() {
        let f = fixture(Reply::AcceptAll { total_xp: None }, SyncConfig::default());
        seed(&f.manager).await;

        let (tx, rx) = mpsc::channel(8);
        f.manager.initialize(Some(rx));
        tx.send(LifecycleEvent::Hidden).await.unwrap();

        let t = f.transport.clone();
        assert!(eventually(|| {
            let t = t.clone();
            async move { t.beacon_calls().len() == 2 }
        })
        .await);

        let endpoints: Vec<String> = f.transport.beacon_calls().into_iter().map(|c| c.endpoint).collect();
        assert!(endpoints.contains(&"/api/xp/sync".to_string()));
        assert!(endpoints.contains(&"/api/quests/sync".to_string()));
        for outbox in f.manager.outboxes() {
            assert_eq!(outbox.pending_count().await.unwrap(), 0);
        }

        // a second teardown signal finds nothing to send
        tx.send(LifecycleEvent::Unload).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.transport.beacon_calls().len(), 2);

        f.manager.cleanup().await;
    }

    #[tokio::test]
    async fn periodic_timer_flushes() {
        let config = SyncConfig {
            flush_interval: Duration::from_millis(30),
            min_flush_interval: Duration::ZERO,
            ..SyncConfig::default()
        };
        let f = fixture(Reply::AcceptAll { total_xp: None }, config);
        seed(&f.manager).await;

        f.manager.initialize(None);
        f.manager.initialize(None);

        let t = f.transport.clone();
        assert!(eventually(|| {
            let t = t.clone();
            async move { t.batch_calls().len() == 2 }
        })
        .await);

        f.manager.cleanup().await;
        assert!(lock(&f.manager.tasks).is_empty());
    }

    #[tokio::test]
    async fn cleanup_performs_a_final_forced_flush() {
        let f = fixture(Reply::AcceptAll { total_xp: None }, SyncConfig::default());
        seed(&f.manager).await;
        f.manager.initialize(None);

        let report = f.manager.cleanup().await;
        match report {
            FlushReport::Completed(outcomes) => {
                assert_eq!(outcomes.len(), 2);
                assert!(outcomes
                    .iter()
                    .all(|(_, o)| matches!(o, FlushOutcome::Sent { accepted: 1, .. })));
            }
            other => panic!("unexpected report: {other:?}"),
        }
    }
}
