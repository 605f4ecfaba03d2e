//! Per-stream parameters for the generic [`crate::Outbox`].

use xpsync_shared::constants::{QUEST_SYNC_PATH, XP_SYNC_PATH};
use xpsync_shared::{Event, Payload, Stream, ValidationError};

/// Stream-specific payload rules, run after the structural checks.
pub type PayloadValidator = fn(&Event) -> Result<(), ValidationError>;

/// Everything that distinguishes one outbox from another.
#[derive(Debug, Clone)]
pub struct CategorySpec {
    pub stream: Stream,
    /// Path of the sync endpoint, relative to the API base URL.
    pub endpoint: String,
    pub validator: PayloadValidator,
}

impl CategorySpec {
    pub fn xp() -> Self {
        Self {
            stream: Stream::Xp,
            endpoint: XP_SYNC_PATH.to_string(),
            validator: validate_xp,
        }
    }

    pub fn quest() -> Self {
        Self {
            stream: Stream::Quest,
            endpoint: QUEST_SYNC_PATH.to_string(),
            validator: validate_quest,
        }
    }

    pub fn for_stream(stream: Stream) -> Self {
        match stream {
            Stream::Xp => Self::xp(),
            Stream::Quest => Self::quest(),
        }
    }

    pub fn namespace(&self) -> &'static str {
        self.stream.namespace()
    }

    /// Full admission check for an event entering this outbox.
    pub fn admit(&self, event: &Event) -> Result<(), ValidationError> {
        if !self.stream.owns(event.category) {
            return Err(ValidationError::WrongStream {
                category: event.category,
                stream: self.stream,
            });
        }
        event.validate()?;
        (self.validator)(event)
    }
}

fn validate_xp(event: &Event) -> Result<(), ValidationError> {
    match &event.payload {
        Payload::Xp { kind, .. } if kind.trim().is_empty() => Err(ValidationError::EmptySourceTag),
        Payload::Xp { .. } => Ok(()),
        _ => Err(ValidationError::PayloadMismatch(event.category)),
    }
}

fn validate_quest(event: &Event) -> Result<(), ValidationError> {
    match &event.payload {
        Payload::QuestProgress { quest_id, delta } => {
            if quest_id.trim().is_empty() {
                Err(ValidationError::EmptyQuestId)
            } else if *delta == 0 {
                Err(ValidationError::ZeroProgress)
            } else {
                Ok(())
            }
        }
        Payload::QuestCompletion { quest_id, .. } if quest_id.trim().is_empty() => {
            Err(ValidationError::EmptyQuestId)
        }
        Payload::QuestCompletion { .. } => Ok(()),
        Payload::Xp { .. } => Err(ValidationError::PayloadMismatch(event.category)),
    }
}
