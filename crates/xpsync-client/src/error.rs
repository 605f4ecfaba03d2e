use thiserror::Error;

use xpsync_store::StoreError;

use crate::outbox::OutboxError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Storage unavailable: {0}")]
    Store(#[from] StoreError),

    #[error("Transport setup failed: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Outbox(#[from] OutboxError),
}
