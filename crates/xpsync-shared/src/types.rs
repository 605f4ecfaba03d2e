use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Client-generated event identifier, the end-to-end idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct EventId(pub String);

impl EventId {
    /// Fresh UUID v4 identifier for producers.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for EventId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EventId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// The owning principal (student / user) of an event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct SubjectId(pub String);

impl SubjectId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SubjectId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SubjectId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for SubjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Closed set of facts the outbox knows how to deliver.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Xp,
    QuestProgress,
    QuestCompletion,
}

impl Category {
    /// The outbox stream that owns this category.
    pub fn stream(self) -> Stream {
        match self {
            Self::Xp => Stream::Xp,
            Self::QuestProgress | Self::QuestCompletion => Stream::Quest,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Xp => "xp",
            Self::QuestProgress => "quest_progress",
            Self::QuestCompletion => "quest_completion",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An independent delivery stream; one outbox (and one store namespace) each.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stream {
    Xp,
    Quest,
}

impl Stream {
    pub const ALL: [Stream; 2] = [Stream::Xp, Stream::Quest];

    /// Store namespace for this stream.
    pub fn namespace(self) -> &'static str {
        match self {
            Self::Xp => "xp",
            Self::Quest => "quest",
        }
    }

    pub fn owns(self, category: Category) -> bool {
        category.stream() == self
    }
}

impl std::fmt::Display for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.namespace())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_map_to_streams() {
        assert_eq!(Category::Xp.stream(), Stream::Xp);
        assert_eq!(Category::QuestProgress.stream(), Stream::Quest);
        assert_eq!(Category::QuestCompletion.stream(), Stream::Quest);
        assert!(Stream::Quest.owns(Category::QuestCompletion));
        assert!(!Stream::Xp.owns(Category::QuestProgress));
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(EventId::new(), EventId::new());
    }
}
