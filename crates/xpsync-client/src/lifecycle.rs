//! Host lifecycle signals consumed by the [`crate::SyncManager`].

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// The UI went to the background; it may never come back.
    Hidden,
    Visible,
    /// The host is about to exit.
    Unload,
    Online,
    Offline,
}

impl LifecycleEvent {
    /// Whether this signal starts teardown-safe delivery.
    pub fn is_teardown(self) -> bool {
        matches!(self, Self::Hidden | Self::Unload)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown lifecycle event: {0}")]
pub struct UnknownLifecycleEvent(pub String);

impl FromStr for LifecycleEvent {
    type Err = UnknownLifecycleEvent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hidden" => Ok(Self::Hidden),
            "visible" => Ok(Self::Visible),
            "unload" => Ok(Self::Unload),
            "online" => Ok(Self::Online),
            "offline" => Ok(Self::Offline),
            other => Err(UnknownLifecycleEvent(other.to_string())),
        }
    }
}
