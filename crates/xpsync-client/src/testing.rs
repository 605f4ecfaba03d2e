//! Fakes shared by the unit tests of this crate.

use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use xpsync_shared::{Event, EventId};
use xpsync_store::DurableStore;

use crate::auth::{CredentialProvider, StaticCredentials};
use crate::category::CategorySpec;
use crate::events::Notifier;
use crate::outbox::{Outbox, OutboxConfig};
use crate::transport::{SyncResponse, SyncTransport, TransportError};

/// How the fake server answers the next batch.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Apply and acknowledge every id in the batch.
    AcceptAll { total_xp: Option<u64> },
    /// Apply and acknowledge only these ids.
    Accept(Vec<EventId>),
    /// Apply everything, then lose the response on the way back.
    LostAfterApply,
    /// Reject with this HTTP status.
    Status(u16),
}

#[derive(Debug, Clone)]
pub struct Call {
    pub endpoint: String,
    pub token: Option<String>,
    pub ids: Vec<EventId>,
    pub beacon: bool,
}

/// Scripted, call-recording [`SyncTransport`].
///
/// Replies are consumed from the script in order; once it is empty the
/// default reply is used. Replays of an already-applied id are counted as
/// duplicates rather than applied twice.
pub struct MockTransport {
    calls: Mutex<Vec<Call>>,
    script: Mutex<VecDeque<Reply>>,
    default_reply: Mutex<Reply>,
    applied: Mutex<Vec<EventId>>,
    duplicates: Mutex<usize>,
    beacon_ok: AtomicBool,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl MockTransport {
    pub fn new(default_reply: Reply) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
            default_reply: Mutex::new(default_reply),
            applied: Mutex::new(Vec::new()),
            duplicates: Mutex::new(0),
            beacon_ok: AtomicBool::new(true),
            gate: Mutex::new(None),
        })
    }

    pub fn accepting() -> Arc<Self> {
        Self::new(Reply::AcceptAll { total_xp: None })
    }

    pub fn push_reply(&self, reply: Reply) {
        self.script.lock().unwrap().push_back(reply);
    }

    pub fn set_beacon_ok(&self, ok: bool) {
        self.beacon_ok.store(ok, Ordering::SeqCst);
    }

    /// Hold every `send_batch` until a permit is added to the returned gate.
    pub fn close_gate(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn batch_calls(&self) -> Vec<Call> {
        self.calls().into_iter().filter(|c| !c.beacon).collect()
    }

    pub fn beacon_calls(&self) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.beacon).collect()
    }

    /// Ids the fake server has applied, each exactly once.
    pub fn applied(&self) -> Vec<EventId> {
        self.applied.lock().unwrap().clone()
    }

    pub fn duplicates(&self) -> usize {
        *self.duplicates.lock().unwrap()
    }

    fn apply(&self, ids: &[EventId]) {
        let mut applied = self.applied.lock().unwrap();
        let known: HashSet<EventId> = applied.iter().cloned().collect();
        for id in ids {
            if known.contains(id) {
                *self.duplicates.lock().unwrap() += 1;
            } else {
                applied.push(id.clone());
            }
        }
    }
}

#[async_trait]
impl SyncTransport for MockTransport {
    async fn send_batch(
        &self,
        endpoint: &str,
        token: &str,
        events: &[Event],
    ) -> Result<SyncResponse, TransportError> {
        let ids: Vec<EventId> = events.iter().map(|e| e.id.clone()).collect();
        self.calls.lock().unwrap().push(Call {
            endpoint: endpoint.to_string(),
            token: Some(token.to_string()),
            ids: ids.clone(),
            beacon: false,
        });

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await.expect("gate closed");
        }

        let reply = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default_reply.lock().unwrap().clone());

        match reply {
            Reply::AcceptAll { total_xp } => {
                self.apply(&ids);
                Ok(SyncResponse {
                    accepted_ids: ids,
                    total_xp,
                    totals: Default::default(),
                })
            }
            Reply::Accept(subset) => {
                self.apply(&subset);
                Ok(SyncResponse {
                    accepted_ids: subset,
                    ..Default::default()
                })
            }
            Reply::LostAfterApply => {
                self.apply(&ids);
                Err(TransportError::Aborted("connection reset".into()))
            }
            Reply::Status(status) => Err(TransportError::Status {
                status,
                body: String::new(),
            }),
        }
    }

    fn send_beacon(&self, endpoint: &str, events: &[Event]) -> bool {
        self.calls.lock().unwrap().push(Call {
            endpoint: endpoint.to_string(),
            token: None,
            ids: events.iter().map(|e| e.id.clone()).collect(),
            beacon: true,
        });
        self.beacon_ok.load(Ordering::SeqCst)
    }
}

/// Outbox config for tests: no background flush, tiny follow-up delay.
pub fn quiet_config() -> OutboxConfig {
    OutboxConfig {
        max_batch_size: 50,
        follow_up_delay: Duration::from_millis(10),
        opportunistic_flush: false,
    }
}

pub fn signed_in(subject: &str) -> Arc<StaticCredentials> {
    Arc::new(StaticCredentials::signed_in(subject, format!("token-{subject}")))
}

pub fn outbox(
    spec: CategorySpec,
    store: Arc<DurableStore>,
    transport: Arc<MockTransport>,
    auth: Arc<dyn CredentialProvider>,
    config: OutboxConfig,
) -> Arc<Outbox> {
    Arc::new(Outbox::new(
        spec,
        store,
        transport,
        auth,
        Notifier::new(),
        config,
    ))
}

pub fn open_store(dir: &Path) -> Arc<DurableStore> {
    Arc::new(DurableStore::open(dir).unwrap())
}

/// Poll `check` until it holds or a few seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
