//! The event model.
//!
//! An [`Event`] is one immutable fact to synchronize. Producers build it with
//! one of the category constructors, which assign a fresh [`EventId`]; the id
//! never changes afterwards and is the only thing the server deduplicates on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::types::{Category, EventId, Stream, SubjectId};

/// Category-specific data carried by an event.
///
/// Untagged on the wire. Each shape has a required field the others lack,
/// so the first matching variant is the right one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Payload {
    Xp {
        /// Which activity produced the grant (e.g. "typing", "flashcards").
        kind: String,
        delta: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        word_list_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        assignment_id: Option<String>,
    },
    QuestCompletion {
        quest_id: String,
        xp_awarded: u32,
    },
    QuestProgress {
        quest_id: String,
        delta: i64,
    },
}

impl Payload {
    /// The category this payload shape belongs to.
    pub fn category(&self) -> Category {
        match self {
            Self::Xp { .. } => Category::Xp,
            Self::QuestProgress { .. } => Category::QuestProgress,
            Self::QuestCompletion { .. } => Category::QuestCompletion,
        }
    }
}

/// A single fact to deliver to the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: EventId,
    pub subject_id: SubjectId,
    pub category: Category,
    pub payload: Payload,
    pub created_at: DateTime<Utc>,
    /// Stamped by the outbox on persistence; orders flush batches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Event {
    fn build(subject_id: SubjectId, payload: Payload) -> Self {
        Self {
            id: EventId::new(),
            subject_id,
            category: payload.category(),
            payload,
            created_at: Utc::now(),
            enqueued_at: None,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn xp(subject_id: impl Into<SubjectId>, kind: impl Into<String>, delta: u32) -> Self {
        Self::build(
            subject_id.into(),
            Payload::Xp {
                kind: kind.into(),
                delta,
                word_list_id: None,
                assignment_id: None,
            },
        )
    }

    pub fn quest_progress(
        subject_id: impl Into<SubjectId>,
        quest_id: impl Into<String>,
        delta: i64,
    ) -> Self {
        Self::build(
            subject_id.into(),
            Payload::QuestProgress {
                quest_id: quest_id.into(),
                delta,
            },
        )
    }

    pub fn quest_completion(
        subject_id: impl Into<SubjectId>,
        quest_id: impl Into<String>,
        xp_awarded: u32,
    ) -> Self {
        Self::build(
            subject_id.into(),
            Payload::QuestCompletion {
                quest_id: quest_id.into(),
                xp_awarded,
            },
        )
    }

    /// Replace the generated id with one chosen by the producer.
    pub fn with_id(mut self, id: impl Into<EventId>) -> Self {
        self.id = id.into();
        self
    }

    /// Attach word-list / assignment references to an XP grant. No-op for
    /// quest events.
    pub fn with_context(mut self, word_list: Option<String>, assignment: Option<String>) -> Self {
        if let Payload::Xp {
            word_list_id,
            assignment_id,
            ..
        } = &mut self.payload
        {
            *word_list_id = word_list;
            *assignment_id = assignment;
        }
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn stream(&self) -> Stream {
        self.category.stream()
    }

    /// Structural checks shared by every stream. Payload-specific rules
    /// live with the stream that owns the category.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.as_str().trim().is_empty() {
            return Err(ValidationError::EmptyId);
        }
        if self.subject_id.as_str().trim().is_empty() {
            return Err(ValidationError::EmptySubject);
        }
        if self.payload.category() != self.category {
            return Err(ValidationError::PayloadMismatch(self.category));
        }
        Ok(())
    }

    /// Sort key for flush batches: enqueue time, then creation time, then id.
    pub fn order_key(&self) -> (DateTime<Utc>, DateTime<Utc>, &str) {
        (
            self.enqueued_at.unwrap_or(self.created_at),
            self.created_at,
            self.id.as_str(),
        )
    }

    /// View of this event as sent over the wire (no `enqueued_at`).
    pub fn wire(&self) -> WireEvent<'_> {
        WireEvent {
            id: &self.id,
            subject_id: &self.subject_id,
            category: self.category,
            payload: &self.payload,
            created_at: self.created_at,
            metadata: &self.metadata,
        }
    }
}

/// Borrowed wire representation of an [`Event`].
#[derive(Debug, Serialize)]
pub struct WireEvent<'a> {
    pub id: &'a EventId,
    pub subject_id: &'a SubjectId,
    pub category: Category,
    pub payload: &'a Payload,
    pub created_at: DateTime<Utc>,
    pub metadata: &'a serde_json::Map<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn xp_event_wire_shape() {
        let ev = Event::xp("u1", "typing", 12).with_id("a1");
        let value = serde_json::to_value(ev.wire()).unwrap();
        assert_eq!(value["id"], "a1");
        assert_eq!(value["subject_id"], "u1");
        assert_eq!(value["category"], "xp");
        assert_eq!(value["payload"], json!({"kind": "typing", "delta": 12}));
        assert!(value.get("enqueued_at").is_none());
    }

    #[test]
    fn quest_payloads_deserialize_to_the_right_variant() {
        let done: Payload = serde_json::from_value(json!({"quest_id": "q1", "xp_awarded": 50})).unwrap();
        assert_eq!(done.category(), Category::QuestCompletion);

        let step: Payload = serde_json::from_value(json!({"quest_id": "q1", "delta": 2})).unwrap();
        assert_eq!(step.category(), Category::QuestProgress);
    }

    #[test]
    fn stored_form_keeps_enqueued_at() {
        let mut ev = Event::quest_progress("u1", "q7", 3);
        ev.enqueued_at = Some(Utc::now());
        let text = serde_json::to_string(&ev).unwrap();
        let back: Event = serde_json::from_str(&text).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn validate_rejects_malformed_events() {
        assert_eq!(
            Event::xp("u1", "typing", 1).with_id("").validate(),
            Err(ValidationError::EmptyId)
        );
        assert_eq!(
            Event::xp("", "typing", 1).validate(),
            Err(ValidationError::EmptySubject)
        );

        let mut forged = Event::xp("u1", "typing", 1);
        forged.category = Category::QuestCompletion;
        assert_eq!(
            forged.validate(),
            Err(ValidationError::PayloadMismatch(Category::QuestCompletion))
        );
    }

    #[test]
    fn context_only_applies_to_xp() {
        let ev = Event::xp("u1", "spelling", 4).with_context(Some("wl-1".into()), None);
        match ev.payload {
            Payload::Xp { word_list_id, .. } => assert_eq!(word_list_id.as_deref(), Some("wl-1")),
            _ => panic!("expected xp payload"),
        }

        let quest = Event::quest_completion("u1", "q1", 10).with_context(Some("wl-1".into()), None);
        assert_eq!(quest.category, Category::QuestCompletion);
    }
}
