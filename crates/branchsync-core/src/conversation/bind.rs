//! Bind - the atomic conversation turn

use serde::{Deserialize, Serialize};

use super::message::Message;
use crate::types::{BindId, BranchId};

/// Maximum length of an auto-generated summary, in characters.
const SUMMARY_MAX_CHARS: usize = 80;

/// One user-prompt/AI-response pair - the atomic unit of conversation
/// history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bind {
    /// Unique identifier
    pub id: BindId,
    /// Owning branch
    pub branch_id: BranchId,
    /// The user's prompt
    pub user_prompt: Message,
    /// The assistant's response
    pub ai_response: Message,
    /// Short summary for list display, derived from the prompt
    pub summary: String,
    /// Unix timestamp in milliseconds
    pub created_at: i64,
    /// Locked binds are excluded from context trimming by callers
    #[serde(default)]
    pub is_locked: bool,
    /// Whether the bind is pinned in the caller's UI
    #[serde(default)]
    pub pinned: bool,
}

impl Bind {
    /// Create a bind from a completed prompt/response exchange.
    ///
    /// The summary is derived from the prompt text, truncated on a char
    /// boundary.
    pub fn new(branch_id: BranchId, user_prompt: Message, ai_response: Message) -> Self {
        let summary = summarize(&user_prompt.text());
        Self {
            id: BindId::new(),
            branch_id,
            user_prompt,
            ai_response,
            summary,
            created_at: chrono::Utc::now().timestamp_millis(),
            is_locked: false,
            pinned: false,
        }
    }

    /// Re-home this bind onto another branch with a fresh identity.
    ///
    /// Used by branch-merge operations, which copy turns rather than
    /// moving them so the source history stays intact.
    pub fn cloned_onto(&self, branch_id: BranchId) -> Self {
        let mut copy = self.clone();
        copy.id = BindId::new();
        copy.branch_id = branch_id;
        copy
    }
}

/// Derive a one-line summary from prompt text.
fn summarize(text: &str) -> String {
    let line = text.lines().next().unwrap_or("").trim();
    if line.chars().count() <= SUMMARY_MAX_CHARS {
        line.to_string()
    } else {
        let truncated: String = line.chars().take(SUMMARY_MAX_CHARS).collect();
        format!("{}...", truncated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_new_derives_summary() {
        let branch_id = BranchId::new();
        let bind = Bind::new(
            branch_id,
            Message::user("How do ULIDs sort?"),
            Message::assistant("Lexicographically, by timestamp prefix."),
        );
        assert_eq!(bind.branch_id, branch_id);
        assert_eq!(bind.summary, "How do ULIDs sort?");
        assert!(!bind.is_locked);
        assert!(!bind.pinned);
    }

    #[test]
    fn test_summary_truncates_long_prompts() {
        let long = "x".repeat(200);
        let bind = Bind::new(BranchId::new(), Message::user(long), Message::assistant("ok"));
        assert!(bind.summary.ends_with("..."));
        assert_eq!(bind.summary.chars().count(), SUMMARY_MAX_CHARS + 3);
    }

    #[test]
    fn test_summary_uses_first_line() {
        let bind = Bind::new(
            BranchId::new(),
            Message::user("first line\nsecond line"),
            Message::assistant("ok"),
        );
        assert_eq!(bind.summary, "first line");
    }

    #[test]
    fn test_cloned_onto_gets_fresh_id() {
        let bind = Bind::new(
            BranchId::new(),
            Message::user("q"),
            Message::assistant("a"),
        );
        let target = BranchId::new();
        let copy = bind.cloned_onto(target);
        assert_ne!(copy.id, bind.id);
        assert_eq!(copy.branch_id, target);
        assert_eq!(copy.user_prompt, bind.user_prompt);
        assert_eq!(copy.created_at, bind.created_at);
    }
}
