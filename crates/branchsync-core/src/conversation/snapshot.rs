//! Snapshot - immutable checkpoint of a branch's message history

use serde::{Deserialize, Serialize};

use super::message::Message;
use crate::types::{BranchId, SnapshotId};

/// An immutable, timestamped copy of a Branch's message history.
///
/// Created only by an explicit user checkpoint action and never mutated
/// afterwards; the merge engine inserts unseen snapshot ids and ignores
/// the rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Unique identifier
    pub id: SnapshotId,
    /// Branch this snapshot was taken from
    pub branch_id: BranchId,
    /// Immutable copy of the branch's messages at snapshot time
    pub messages: Vec<Message>,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    /// Optional user-supplied description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Snapshot {
    /// Create a snapshot of the given messages.
    pub fn new(branch_id: BranchId, messages: Vec<Message>, description: Option<String>) -> Self {
        Self {
            id: SnapshotId::new(),
            branch_id,
            messages,
            timestamp: chrono::Utc::now().timestamp_millis(),
            description,
        }
    }
}
