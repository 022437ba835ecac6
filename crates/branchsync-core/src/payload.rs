//! Sync payload wire format
//!
//! Every transport carries the same JSON document:
//!
//! ```json
//! {
//!   "type": "sync",
//!   "branches": [ { "id": "...", "ideaId": "...", "messages": [...] } ],
//!   "settings": { "temperature": 0.7, "maxTokens": 2048,
//!                 "isDark": false, "selectedModel": "default" },
//!   "timestamp": 1712345678901,
//!   "snapshots": []
//! }
//! ```
//!
//! A wire branch carries its metadata plus the *flattened* message list
//! (prompt then response per bind, in conversation order) - that list
//! is the substrate the merge engine unions by message id. `snapshots`
//! is optional; decoders tolerate its absence.

use serde::{Deserialize, Serialize};

use crate::conversation::{Message, Snapshot};
use crate::error::{SyncError, SyncResult};
use crate::repository::ConversationRepository;
use crate::types::{BranchId, IdeaId, SyncSettings};

/// Discriminator value of every sync payload.
const PAYLOAD_TYPE: &str = "sync";

/// A branch as it travels between devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncBranch {
    /// Branch id, stable across devices
    pub id: BranchId,
    /// Owning idea id
    pub idea_id: IdeaId,
    /// Name of the owning idea, so the receiver can create it if unseen
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idea_name: Option<String>,
    /// Branch this one forked from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<BranchId>,
    /// Human-readable name
    pub name: String,
    /// Unix timestamp in milliseconds; the LWW tiebreaker for metadata
    pub created_at: i64,
    /// Whether this branch was produced by a merge
    #[serde(default)]
    pub is_merged: bool,
    /// Whether this branch has never forked
    #[serde(default)]
    pub is_linear: bool,
    /// Flattened message history (prompt, response, prompt, response, ...)
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// The complete sync payload, identical across all four transports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPayload {
    /// Always `"sync"`; rejected otherwise on decode
    #[serde(rename = "type")]
    pub kind: String,
    /// Every branch on the sending device, with flattened messages
    pub branches: Vec<SyncBranch>,
    /// The sending device's settings
    pub settings: SyncSettings,
    /// Unix timestamp in milliseconds when the payload was built
    pub timestamp: i64,
    /// Snapshots on the sending device; optional on the wire
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub snapshots: Vec<Snapshot>,
}

impl SyncPayload {
    /// Build a payload from the repository's current state.
    pub fn from_repository(repo: &ConversationRepository) -> SyncResult<Self> {
        let mut branches = Vec::new();
        for branch in repo.branches()? {
            let idea_name = repo.idea(&branch.idea_id)?.map(|i| i.name);
            let messages = repo.branch_messages(&branch.id)?;
            branches.push(SyncBranch {
                id: branch.id,
                idea_id: branch.idea_id,
                idea_name,
                parent_id: branch.parent_id,
                name: branch.name,
                created_at: branch.created_at,
                is_merged: branch.is_merged,
                is_linear: branch.is_linear,
                messages,
            });
        }

        Ok(Self {
            kind: PAYLOAD_TYPE.to_string(),
            branches,
            settings: repo.settings()?.settings,
            timestamp: chrono::Utc::now().timestamp_millis(),
            snapshots: repo.snapshots()?,
        })
    }

    /// Serialize to the JSON wire form.
    pub fn encode(&self) -> SyncResult<String> {
        serde_json::to_string(self).map_err(|e| SyncError::Serialization(e.to_string()))
    }

    /// Parse and validate a received JSON document.
    pub fn decode(data: &str) -> SyncResult<Self> {
        let payload: SyncPayload =
            serde_json::from_str(data).map_err(|e| SyncError::Parse(e.to_string()))?;
        if payload.kind != PAYLOAD_TYPE {
            return Err(SyncError::Parse(format!(
                "unexpected payload type: {:?}",
                payload.kind
            )));
        }
        Ok(payload)
    }

    /// Total number of messages across all branches.
    pub fn message_count(&self) -> usize {
        self.branches.iter().map(|b| b.messages.len()).sum()
    }
}
