//! Branch - a linear or forked sequence of conversation turns

use serde::{Deserialize, Serialize};

use crate::types::{BranchId, IdeaId};

/// A linear or forked sequence of Binds within an Idea.
///
/// `parent_id`, when present, references another Branch in the same
/// Idea - branches form a tree per Idea. The Branch record holds
/// metadata only; its turns live as [`Bind`](super::Bind) records keyed
/// by `branch_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    /// Unique identifier
    pub id: BranchId,
    /// Owning idea
    pub idea_id: IdeaId,
    /// Branch this one forked from, within the same idea
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<BranchId>,
    /// Human-readable name
    pub name: String,
    /// Unix timestamp in milliseconds
    pub created_at: i64,
    /// Whether this branch was produced by a merge operation
    #[serde(default)]
    pub is_merged: bool,
    /// Whether this branch has never forked (pure linear history)
    #[serde(default)]
    pub is_linear: bool,
}

impl Branch {
    /// Create a new branch in the given idea.
    pub fn new(name: impl Into<String>, idea_id: IdeaId, parent_id: Option<BranchId>) -> Self {
        Self {
            id: BranchId::new(),
            idea_id,
            parent_id,
            name: name.into(),
            created_at: chrono::Utc::now().timestamp_millis(),
            is_merged: false,
            is_linear: parent_id.is_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_new_root() {
        let idea = IdeaId::new();
        let branch = Branch::new("main", idea, None);
        assert_eq!(branch.idea_id, idea);
        assert!(branch.parent_id.is_none());
        assert!(branch.is_linear);
        assert!(!branch.is_merged);
    }

    #[test]
    fn test_branch_new_fork() {
        let idea = IdeaId::new();
        let parent = Branch::new("main", idea, None);
        let fork = Branch::new("alt", idea, Some(parent.id));
        assert_eq!(fork.parent_id, Some(parent.id));
        assert!(!fork.is_linear);
    }

    #[test]
    fn test_absent_parent_omitted_on_wire() {
        let branch = Branch::new("main", IdeaId::new(), None);
        let json = serde_json::to_value(&branch).unwrap();
        assert!(json.get("parentId").is_none());
        assert!(json.get("ideaId").is_some());
    }
}
