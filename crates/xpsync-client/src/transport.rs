//! Delivery of event batches to the sync endpoints.
//!
//! [`SyncTransport`] has two paths: the normal authenticated request, whose
//! response names the accepted ids, and the teardown beacon, which only
//! reports whether the batch could be handed off for delivery.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use xpsync_shared::event::WireEvent;
use xpsync_shared::{Event, EventId};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Server responded {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid response body: {0}")]
    Decode(String),

    #[error("Request task aborted: {0}")]
    Aborted(String),
}

/// What the server says about a batch.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct SyncResponse {
    /// Authoritative list of applied ids; anything missing stays queued.
    #[serde(default)]
    pub accepted_ids: Vec<EventId>,
    #[serde(default)]
    pub total_xp: Option<u64>,
    /// Any other aggregate the endpoint chose to return.
    #[serde(flatten)]
    pub totals: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct SyncBody<'a> {
    events: Vec<WireEvent<'a>>,
}

fn body_for(events: &[Event]) -> SyncBody<'_> {
    SyncBody {
        events: events.iter().map(Event::wire).collect(),
    }
}

#[async_trait]
pub trait SyncTransport: Send + Sync + 'static {
    /// POST `{ "events": [...] }` to `endpoint` with a bearer credential.
    async fn send_batch(
        &self,
        endpoint: &str,
        token: &str,
        events: &[Event],
    ) -> Result<SyncResponse, TransportError>;

    /// Teardown-safe delivery. Must not block; returns `true` when the batch
    /// was queued for sending.
    fn send_beacon(&self, endpoint: &str, events: &[Event]) -> bool;
}

/// `reqwest` implementation talking to a real API.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, timeout: Option<Duration>) -> Result<Self, TransportError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            client: builder.build()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn send_batch(
        &self,
        endpoint: &str,
        token: &str,
        events: &[Event],
    ) -> Result<SyncResponse, TransportError> {
        let payload = serde_json::to_vec(&body_for(events))
            .map_err(|e| TransportError::Decode(e.to_string()))?;
        let request = self
            .client
            .post(self.url(endpoint))
            .bearer_auth(token)
            .header(CONTENT_TYPE, "application/json")
            .body(payload);

        // Run the request on its own task so it completes even if the caller
        // stops waiting (e.g. the flush future is dropped during shutdown).
        let handle = tokio::spawn(async move {
            let resp = request.send().await?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(TransportError::Status {
                    status: status.as_u16(),
                    body,
                });
            }
            resp.json::<SyncResponse>()
                .await
                .map_err(|e| TransportError::Decode(e.to_string()))
        });

        handle
            .await
            .map_err(|e| TransportError::Aborted(e.to_string()))?
    }

    fn send_beacon(&self, endpoint: &str, events: &[Event]) -> bool {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(endpoint, "no runtime available for beacon delivery");
            return false;
        };
        let payload = match serde_json::to_vec(&body_for(events)) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(endpoint, error = %e, "beacon body could not be encoded");
                return false;
            }
        };

        let request = self
            .client
            .post(self.url(endpoint))
            .header(CONTENT_TYPE, "application/json")
            .body(payload);
        let endpoint = endpoint.to_string();
        let count = events.len();

        runtime.spawn(async move {
            match request.send().await {
                Ok(resp) => {
                    tracing::debug!(endpoint = %endpoint, count, status = %resp.status(), "beacon delivered")
                }
                Err(e) => tracing::warn!(endpoint = %endpoint, count, error = %e, "beacon delivery failed"),
            }
        });
        true
    }
}
