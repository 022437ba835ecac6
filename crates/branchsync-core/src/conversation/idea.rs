//! Idea - the top-level grouping of conversation branches

use serde::{Deserialize, Serialize};

use crate::types::IdeaId;

/// Top-level grouping of one or more conversation branches around a topic.
///
/// An Idea is created explicitly, or implicitly when an ephemeral
/// conversation is pinned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Idea {
    /// Unique identifier
    pub id: IdeaId,
    /// Human-readable name
    pub name: String,
    /// Free-form description
    pub description: String,
    /// Unix timestamp in milliseconds
    pub created_at: i64,
    /// Whether the idea is pinned in the caller's UI
    #[serde(default)]
    pub pinned: bool,
}

impl Idea {
    /// Create a new idea with the given name and description.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: IdeaId::new(),
            name: name.into(),
            description: description.into(),
            created_at: chrono::Utc::now().timestamp_millis(),
            pinned: false,
        }
    }
}
