use thiserror::Error;

use crate::types::{Category, Stream};

/// Reasons an event is refused before it ever reaches the store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Event id must not be empty")]
    EmptyId,

    #[error("Subject id must not be empty")]
    EmptySubject,

    #[error("Payload does not match category {0}")]
    PayloadMismatch(Category),

    #[error("Category {category} does not belong to the {stream} stream")]
    WrongStream { category: Category, stream: Stream },

    #[error("XP source tag must not be empty")]
    EmptySourceTag,

    #[error("Quest id must not be empty")]
    EmptyQuestId,

    #[error("Quest progress delta must not be zero")]
    ZeroProgress,
}
