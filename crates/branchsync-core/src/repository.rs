//! ConversationRepository - the single source of truth
//!
//! Wraps [`Storage`] with the entity lifecycle operations and fires a
//! change notification for every mutation. Listeners subscribe to a
//! broadcast channel; each subscriber owns an independent receiver, so
//! a slow or failing consumer cannot block delivery to the others.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  ConversationRepository                                         │
//! │  ├── Storage (redb tables: ideas, branches, binds, snapshots)   │
//! │  └── event_tx: broadcast::Sender<RepositoryEvent>               │
//! │      └── One event per mutation, fanned out to all subscribers  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Branches form a tree per Idea via `parent_id`; deleting a branch
//! cascades to its descendants with an iterative breadth-first walk
//! over the flat branch table, then removes the binds and snapshots of
//! every deleted branch.

use std::collections::{HashMap, VecDeque};

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::conversation::{Bind, Branch, Idea, Message, Snapshot};
use crate::error::{SyncError, SyncResult};
use crate::storage::{SettingsRecord, Storage};
use crate::types::{BindId, BranchId, IdeaId, SnapshotId, SyncSettings};

/// Default capacity for the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Change notification fired after every repository mutation
#[derive(Debug, Clone)]
pub enum RepositoryEvent {
    /// An idea was created
    IdeaCreated(IdeaId),
    /// An idea's fields changed
    IdeaUpdated(IdeaId),
    /// An idea and all its descendants were deleted
    IdeaDeleted(IdeaId),
    /// A branch was created
    BranchCreated(BranchId),
    /// A branch's fields changed
    BranchUpdated(BranchId),
    /// A branch and all its descendants were deleted
    BranchDeleted(BranchId),
    /// A bind was appended to a branch
    BindCreated(BindId),
    /// A bind's fields changed
    BindUpdated(BindId),
    /// A snapshot was taken
    SnapshotCreated(SnapshotId),
    /// Settings were updated locally or from a received payload
    SettingsChanged,
    /// A received payload was merged into the repository
    Imported {
        /// Branches inserted or merged
        branches: usize,
        /// Snapshots inserted
        snapshots: usize,
        /// Messages newly added across all branches
        messages: usize,
    },
}

/// Persistent store and mutator for conversation entities.
///
/// Cloning is cheap; clones share the same database handle and event
/// channel.
#[derive(Clone)]
pub struct ConversationRepository {
    storage: Storage,
    event_tx: broadcast::Sender<RepositoryEvent>,
}

impl ConversationRepository {
    /// Create a repository over the given storage.
    pub fn new(storage: Storage) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { storage, event_tx }
    }

    /// Subscribe to change notifications.
    ///
    /// Every subscriber receives every event; dropping the receiver
    /// unsubscribes. Subscribing twice simply yields two independent
    /// receivers.
    pub fn subscribe(&self) -> broadcast::Receiver<RepositoryEvent> {
        self.event_tx.subscribe()
    }

    /// Access the underlying storage (merge-engine internals).
    pub(crate) fn storage(&self) -> &Storage {
        &self.storage
    }

    fn emit(&self, event: RepositoryEvent) {
        // send only fails when no receiver is subscribed, which is fine
        let _ = self.event_tx.send(event);
    }

    /// Fire an import notification after a merge pass.
    pub(crate) fn notify_imported(&self, branches: usize, snapshots: usize, messages: usize) {
        self.emit(RepositoryEvent::Imported {
            branches,
            snapshots,
            messages,
        });
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Ideas
    // ═══════════════════════════════════════════════════════════════════════

    /// Create a new idea.
    pub fn create_idea(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> SyncResult<Idea> {
        let idea = Idea::new(name, description);
        self.storage.save_idea(&idea)?;
        info!(%idea.id, "Created idea");
        self.emit(RepositoryEvent::IdeaCreated(idea.id));
        Ok(idea)
    }

    /// Load a single idea.
    pub fn idea(&self, id: &IdeaId) -> SyncResult<Option<Idea>> {
        self.storage.load_idea(id)
    }

    /// Load all ideas.
    pub fn ideas(&self) -> SyncResult<Vec<Idea>> {
        self.storage.list_ideas()
    }

    /// Set an idea's pinned flag.
    pub fn pin_idea(&self, id: &IdeaId, pinned: bool) -> SyncResult<()> {
        let mut idea = self
            .storage
            .load_idea(id)?
            .ok_or_else(|| SyncError::IdeaNotFound(id.to_string()))?;
        idea.pinned = pinned;
        self.storage.save_idea(&idea)?;
        self.emit(RepositoryEvent::IdeaUpdated(*id));
        Ok(())
    }

    /// Delete an idea and every descendant branch, bind, and snapshot.
    pub fn delete_idea(&self, id: &IdeaId) -> SyncResult<()> {
        if self.storage.load_idea(id)?.is_none() {
            return Err(SyncError::IdeaNotFound(id.to_string()));
        }

        let branches = self.storage.list_branches_for_idea(id)?;
        for branch in &branches {
            self.delete_branch_record(&branch.id)?;
        }
        self.storage.delete_idea(id)?;

        info!(idea = %id, branches = branches.len(), "Deleted idea with cascade");
        self.emit(RepositoryEvent::IdeaDeleted(*id));
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Branches
    // ═══════════════════════════════════════════════════════════════════════

    /// Create a branch in an idea, optionally forking from a parent.
    ///
    /// The parent, if given, must exist and belong to the same idea.
    pub fn create_branch(
        &self,
        name: impl Into<String>,
        idea_id: &IdeaId,
        parent_id: Option<&BranchId>,
    ) -> SyncResult<Branch> {
        if self.storage.load_idea(idea_id)?.is_none() {
            return Err(SyncError::IdeaNotFound(idea_id.to_string()));
        }
        if let Some(parent_id) = parent_id {
            let parent = self
                .storage
                .load_branch(parent_id)?
                .ok_or_else(|| SyncError::BranchNotFound(parent_id.to_string()))?;
            if &parent.idea_id != idea_id {
                return Err(SyncError::InvalidOperation(format!(
                    "parent branch {} belongs to a different idea",
                    parent_id
                )));
            }
        }

        let branch = Branch::new(name, *idea_id, parent_id.copied());
        self.storage.save_branch(&branch)?;
        info!(%branch.id, idea = %idea_id, "Created branch");
        self.emit(RepositoryEvent::BranchCreated(branch.id));
        Ok(branch)
    }

    /// Load a single branch.
    pub fn branch(&self, id: &BranchId) -> SyncResult<Option<Branch>> {
        self.storage.load_branch(id)
    }

    /// Load all branches.
    pub fn branches(&self) -> SyncResult<Vec<Branch>> {
        self.storage.list_branches()
    }

    /// Load all branches of an idea. Empty when the idea is unknown.
    pub fn branches_for_idea(&self, idea_id: &IdeaId) -> SyncResult<Vec<Branch>> {
        self.storage.list_branches_for_idea(idea_id)
    }

    /// Overwrite a branch's fields. The branch must exist.
    pub fn update_branch(&self, branch: &Branch) -> SyncResult<()> {
        if self.storage.load_branch(&branch.id)?.is_none() {
            return Err(SyncError::BranchNotFound(branch.id.to_string()));
        }
        self.storage.save_branch(branch)?;
        self.emit(RepositoryEvent::BranchUpdated(branch.id));
        Ok(())
    }

    /// Rename a branch.
    pub fn rename_branch(&self, id: &BranchId, name: impl Into<String>) -> SyncResult<()> {
        let mut branch = self
            .storage
            .load_branch(id)?
            .ok_or_else(|| SyncError::BranchNotFound(id.to_string()))?;
        branch.name = name.into();
        self.storage.save_branch(&branch)?;
        self.emit(RepositoryEvent::BranchUpdated(*id));
        Ok(())
    }

    /// Delete a branch and every descendant branch, plus their binds
    /// and snapshots.
    pub fn delete_branch(&self, id: &BranchId) -> SyncResult<()> {
        if self.storage.load_branch(id)?.is_none() {
            return Err(SyncError::BranchNotFound(id.to_string()));
        }

        // Iterative BFS over the flat branch table via parent_id
        let all = self.storage.list_branches()?;
        let mut children: HashMap<BranchId, Vec<BranchId>> = HashMap::new();
        for branch in &all {
            if let Some(parent) = branch.parent_id {
                children.entry(parent).or_default().push(branch.id);
            }
        }

        let mut to_delete = Vec::new();
        let mut queue = VecDeque::from([*id]);
        while let Some(current) = queue.pop_front() {
            to_delete.push(current);
            if let Some(kids) = children.get(&current) {
                queue.extend(kids.iter().copied());
            }
        }

        for branch_id in &to_delete {
            self.delete_branch_record(branch_id)?;
        }

        info!(branch = %id, deleted = to_delete.len(), "Deleted branch subtree");
        self.emit(RepositoryEvent::BranchDeleted(*id));
        Ok(())
    }

    /// Remove one branch record with its binds and snapshots.
    fn delete_branch_record(&self, id: &BranchId) -> SyncResult<()> {
        for bind in self.storage.list_binds_for_branch(id)? {
            self.storage.delete_bind(&bind.id)?;
        }
        for snapshot in self.storage.list_snapshots_for_branch(id)? {
            self.storage.delete_snapshot(&snapshot.id)?;
        }
        self.storage.delete_branch(id)?;
        Ok(())
    }

    /// Merge two branches into a new branch concatenating both
    /// histories (source turns first, then target turns).
    ///
    /// The new branch lives in the target's idea, forks from the
    /// target, and is marked `is_merged`. Source and target are left
    /// untouched.
    pub fn merge_branches(&self, source_id: &BranchId, target_id: &BranchId) -> SyncResult<Branch> {
        let source = self
            .storage
            .load_branch(source_id)?
            .ok_or_else(|| SyncError::BranchNotFound(source_id.to_string()))?;
        let target = self
            .storage
            .load_branch(target_id)?
            .ok_or_else(|| SyncError::BranchNotFound(target_id.to_string()))?;

        let mut merged = Branch::new(
            format!("{} + {}", source.name, target.name),
            target.idea_id,
            Some(target.id),
        );
        merged.is_merged = true;
        merged.is_linear = false;
        self.storage.save_branch(&merged)?;

        let mut copied = 0;
        for bind in self
            .storage
            .list_binds_for_branch(source_id)?
            .iter()
            .chain(self.storage.list_binds_for_branch(target_id)?.iter())
        {
            self.storage.save_bind(&bind.cloned_onto(merged.id))?;
            copied += 1;
        }

        info!(source = %source_id, target = %target_id, merged = %merged.id, copied, "Merged branches");
        self.emit(RepositoryEvent::BranchCreated(merged.id));
        Ok(merged)
    }

    /// Consolidate arbitrarily chosen binds (possibly from different
    /// branches) into the target branch, or into a fresh branch forked
    /// from the target when `new_branch_name` is given.
    ///
    /// Binds are copied in the order given; the sources keep theirs.
    pub fn merge_selected_binds(
        &self,
        bind_ids: &[BindId],
        target_branch_id: &BranchId,
        new_branch_name: Option<String>,
    ) -> SyncResult<Branch> {
        let target = self
            .storage
            .load_branch(target_branch_id)?
            .ok_or_else(|| SyncError::BranchNotFound(target_branch_id.to_string()))?;

        let mut selected = Vec::with_capacity(bind_ids.len());
        for bind_id in bind_ids {
            let bind = self
                .storage
                .load_bind(bind_id)?
                .ok_or_else(|| SyncError::BindNotFound(bind_id.to_string()))?;
            selected.push(bind);
        }

        let destination = match new_branch_name {
            Some(name) => {
                let branch = Branch::new(name, target.idea_id, Some(target.id));
                self.storage.save_branch(&branch)?;
                self.emit(RepositoryEvent::BranchCreated(branch.id));
                branch
            }
            None => target,
        };

        for bind in &selected {
            let copy = bind.cloned_onto(destination.id);
            self.storage.save_bind(&copy)?;
            self.emit(RepositoryEvent::BindCreated(copy.id));
        }

        info!(
            target = %destination.id,
            binds = selected.len(),
            "Consolidated selected binds"
        );
        Ok(destination)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Binds
    // ═══════════════════════════════════════════════════════════════════════

    /// Record a completed prompt/response exchange on a branch.
    pub fn create_bind(
        &self,
        branch_id: &BranchId,
        user_prompt: Message,
        ai_response: Message,
    ) -> SyncResult<Bind> {
        if self.storage.load_branch(branch_id)?.is_none() {
            return Err(SyncError::BranchNotFound(branch_id.to_string()));
        }
        if user_prompt.id == ai_response.id {
            return Err(SyncError::InvalidOperation(
                "prompt and response share a message id".to_string(),
            ));
        }

        let bind = Bind::new(*branch_id, user_prompt, ai_response);
        self.storage.save_bind(&bind)?;
        debug!(%bind.id, branch = %branch_id, "Created bind");
        self.emit(RepositoryEvent::BindCreated(bind.id));
        Ok(bind)
    }

    /// Load a single bind.
    pub fn bind(&self, id: &BindId) -> SyncResult<Option<Bind>> {
        self.storage.load_bind(id)
    }

    /// Load a branch's binds in conversation order.
    ///
    /// An unknown branch yields an empty list so display code degrades
    /// gracefully.
    pub fn binds_for_branch(&self, branch_id: &BranchId) -> SyncResult<Vec<Bind>> {
        self.storage.list_binds_for_branch(branch_id)
    }

    /// Flatten a branch's binds into its message list (prompt then
    /// response per bind, in conversation order).
    ///
    /// This list is the merge substrate for device sync. Empty when the
    /// branch is unknown. Empty-content placeholder messages - created
    /// when an import had an unpaired prompt or response - are not part
    /// of the conversation and are skipped.
    pub fn branch_messages(&self, branch_id: &BranchId) -> SyncResult<Vec<Message>> {
        let binds = self.storage.list_binds_for_branch(branch_id)?;
        let mut messages = Vec::with_capacity(binds.len() * 2);
        for bind in binds {
            if !bind.user_prompt.content.is_empty() {
                messages.push(bind.user_prompt);
            }
            if !bind.ai_response.content.is_empty() {
                messages.push(bind.ai_response);
            }
        }
        Ok(messages)
    }

    /// Toggle a bind's pinned flag. Returns the new state.
    pub fn toggle_bind_pin(&self, id: &BindId) -> SyncResult<bool> {
        let mut bind = self
            .storage
            .load_bind(id)?
            .ok_or_else(|| SyncError::BindNotFound(id.to_string()))?;
        bind.pinned = !bind.pinned;
        self.storage.save_bind(&bind)?;
        self.emit(RepositoryEvent::BindUpdated(*id));
        Ok(bind.pinned)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Snapshots
    // ═══════════════════════════════════════════════════════════════════════

    /// Take an immutable snapshot of the given messages.
    pub fn create_snapshot(
        &self,
        branch_id: &BranchId,
        messages: Vec<Message>,
        description: Option<String>,
    ) -> SyncResult<Snapshot> {
        if self.storage.load_branch(branch_id)?.is_none() {
            return Err(SyncError::BranchNotFound(branch_id.to_string()));
        }

        let snapshot = Snapshot::new(*branch_id, messages, description);
        self.storage.save_snapshot(&snapshot)?;
        debug!(%snapshot.id, branch = %branch_id, "Created snapshot");
        self.emit(RepositoryEvent::SnapshotCreated(snapshot.id));
        Ok(snapshot)
    }

    /// Load a single snapshot.
    pub fn snapshot(&self, id: &SnapshotId) -> SyncResult<Option<Snapshot>> {
        self.storage.load_snapshot(id)
    }

    /// Load a branch's snapshots, oldest first. Empty when the branch
    /// is unknown.
    pub fn snapshots_for_branch(&self, branch_id: &BranchId) -> SyncResult<Vec<Snapshot>> {
        self.storage.list_snapshots_for_branch(branch_id)
    }

    /// Load all snapshots.
    pub fn snapshots(&self) -> SyncResult<Vec<Snapshot>> {
        self.storage.list_snapshots()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Settings
    // ═══════════════════════════════════════════════════════════════════════

    /// Current settings with their last-update timestamp.
    pub fn settings(&self) -> SyncResult<SettingsRecord> {
        self.storage.load_settings()
    }

    /// Update settings locally, stamping now.
    pub fn update_settings(&self, settings: SyncSettings) -> SyncResult<()> {
        self.storage.save_settings(&SettingsRecord {
            settings,
            updated_at: chrono::Utc::now().timestamp_millis(),
        })?;
        self.emit(RepositoryEvent::SettingsChanged);
        Ok(())
    }

    /// Apply settings from a received payload, last writer wins.
    ///
    /// Returns true when the remote side was newer and was applied.
    pub fn apply_imported_settings(
        &self,
        settings: SyncSettings,
        remote_timestamp: i64,
    ) -> SyncResult<bool> {
        let current = self.storage.load_settings()?;
        if remote_timestamp <= current.updated_at {
            debug!(
                remote_timestamp,
                local = current.updated_at,
                "Ignoring older remote settings"
            );
            return Ok(false);
        }
        self.storage.save_settings(&SettingsRecord {
            settings,
            updated_at: remote_timestamp,
        })?;
        self.emit(RepositoryEvent::SettingsChanged);
        Ok(true)
    }
}
