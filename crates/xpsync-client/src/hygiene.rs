//! Startup and logout housekeeping.
//!
//! Events that belong to another principal must never be sent under the
//! current session. On startup they are purged, loudly.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use xpsync_shared::{EventId, Stream};

use crate::auth::CredentialProvider;
use crate::outbox::{Outbox, OutboxError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HygieneReport {
    /// Purged event count per stream.
    pub purged: Vec<(Stream, usize)>,
    /// No signed-in subject, so ownership could not be checked.
    pub skipped: bool,
}

impl HygieneReport {
    pub fn total(&self) -> usize {
        self.purged.iter().map(|(_, n)| n).sum()
    }
}

/// Remove every pending event whose subject differs from the signed-in one.
pub async fn purge_foreign_events(
    outboxes: &[Arc<Outbox>],
    auth: &dyn CredentialProvider,
) -> Result<HygieneReport, OutboxError> {
    let Some(subject) = auth.current_subject() else {
        info!("no signed-in subject, ownership check skipped");
        return Ok(HygieneReport {
            purged: Vec::new(),
            skipped: true,
        });
    };

    let mut report = HygieneReport::default();
    for outbox in outboxes {
        let foreign = outbox.subject_mismatches(&subject).await?;
        if foreign.is_empty() {
            report.purged.push((outbox.stream(), 0));
            continue;
        }
        for event in &foreign {
            warn!(
                stream = %outbox.stream(),
                id = %event.id,
                owner = %event.subject_id,
                current = %subject,
                "purging event owned by another principal"
            );
        }
        let ids: Vec<EventId> = foreign.into_iter().map(|e| e.id).collect();
        let removed = outbox.purge_ids(&ids).await?;
        report.purged.push((outbox.stream(), removed));
    }

    if report.total() > 0 {
        warn!(purged = report.total(), "foreign events purged");
    }
    Ok(report)
}

/// Drop everything queued in every outbox, sent or not. Used on logout.
pub async fn clear_everything(outboxes: &[Arc<Outbox>]) -> Result<usize, OutboxError> {
    let mut removed = 0;
    for outbox in outboxes {
        removed += outbox.clear_all().await?;
    }
    info!(removed, "all outboxes cleared");
    Ok(removed)
}
