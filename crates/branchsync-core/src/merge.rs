//! MergeEngine - reconciles received payloads into the repository
//!
//! Merging is last-writer-wins per field with no causal-history
//! tracking: branch message lists are unioned by message id and sorted
//! by timestamp, branch metadata follows the side with the more recent
//! creation timestamp, snapshots are insert-only. Concurrent edits to
//! the same field made independently on two devices before a sync will
//! silently drop one side - a documented limitation of the design, not
//! an error.
//!
//! Merging only adds or updates; local data with no remote counterpart
//! is never deleted.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use crate::conversation::{Bind, Branch, Idea, Message, MessageContent, Role, Snapshot};
use crate::error::SyncResult;
use crate::payload::{SyncBranch, SyncPayload};
use crate::repository::ConversationRepository;
use crate::types::{BindId, BranchId, MessageId};

/// Counters describing what an import pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportStats {
    /// Remote branches inserted verbatim
    pub branches_added: usize,
    /// Existing branches that gained messages or metadata
    pub branches_merged: usize,
    /// Messages newly added across all branches
    pub messages_added: usize,
    /// Snapshots inserted
    pub snapshots_added: usize,
    /// Ideas created to own imported branches
    pub ideas_created: usize,
}

impl ImportStats {
    /// Whether the import changed anything.
    pub fn is_empty(&self) -> bool {
        *self == ImportStats::default()
    }
}

/// Reconciles remote entities into the local repository.
#[derive(Clone)]
pub struct MergeEngine {
    repo: ConversationRepository,
}

impl MergeEngine {
    /// Create a merge engine over the repository.
    pub fn new(repo: ConversationRepository) -> Self {
        Self { repo }
    }

    /// Import a full received payload: branches, snapshots, settings.
    ///
    /// Fires a single repository-level import notification at the end.
    pub fn import_payload(&self, payload: &SyncPayload) -> SyncResult<ImportStats> {
        let mut stats = self.import_branches(&payload.branches)?;
        stats.snapshots_added = self.import_snapshots(&payload.snapshots)?;
        self.repo
            .apply_imported_settings(payload.settings.clone(), payload.timestamp)?;

        info!(
            branches_added = stats.branches_added,
            branches_merged = stats.branches_merged,
            messages_added = stats.messages_added,
            snapshots_added = stats.snapshots_added,
            "Import pass completed"
        );
        self.repo.notify_imported(
            stats.branches_added + stats.branches_merged,
            stats.snapshots_added,
            stats.messages_added,
        );
        Ok(stats)
    }

    /// Import remote branches.
    ///
    /// Unknown ids are inserted verbatim (creating their owning Idea if
    /// unseen). For a branch present on both sides, the message lists
    /// are unioned by message id, sorted ascending by timestamp, and
    /// branch metadata follows the more recently created side.
    pub fn import_branches(&self, remote: &[SyncBranch]) -> SyncResult<ImportStats> {
        let storage = self.repo.storage();
        let mut stats = ImportStats::default();

        for branch in remote {
            match storage.load_branch(&branch.id)? {
                None => {
                    if storage.load_idea(&branch.idea_id)?.is_none() {
                        let name = branch
                            .idea_name
                            .clone()
                            .unwrap_or_else(|| "Imported".to_string());
                        let mut idea = Idea::new(name, "");
                        idea.id = branch.idea_id;
                        storage.save_idea(&idea)?;
                        stats.ideas_created += 1;
                        debug!(idea = %idea.id, "Created idea for imported branch");
                    }

                    let local = Branch {
                        id: branch.id,
                        idea_id: branch.idea_id,
                        parent_id: branch.parent_id,
                        name: branch.name.clone(),
                        created_at: branch.created_at,
                        is_merged: branch.is_merged,
                        is_linear: branch.is_linear,
                    };
                    storage.save_branch(&local)?;

                    let mut sorted = branch.messages.clone();
                    sorted.sort_by_key(|m| (m.timestamp, m.id));
                    for bind in rebuild_binds(branch.id, &sorted, &HashMap::new()) {
                        storage.save_bind(&bind)?;
                    }
                    stats.branches_added += 1;
                    stats.messages_added += branch.messages.len();
                    debug!(branch = %branch.id, messages = branch.messages.len(), "Inserted remote branch");
                }
                Some(mut local) => {
                    let local_messages = self.repo.branch_messages(&branch.id)?;
                    let known: HashSet<MessageId> =
                        local_messages.iter().map(|m| m.id).collect();

                    let fresh: Vec<&Message> = branch
                        .messages
                        .iter()
                        .filter(|m| !known.contains(&m.id))
                        .collect();

                    let metadata_changed =
                        branch.created_at > local.created_at && branch.name != local.name;
                    if !fresh.is_empty() || metadata_changed {
                        stats.branches_merged += 1;
                    }

                    if metadata_changed {
                        // Last writer wins on branch metadata; the
                        // older side's edit is silently dropped
                        local.name = branch.name.clone();
                        local.created_at = branch.created_at;
                        storage.save_branch(&local)?;
                    }

                    if fresh.is_empty() {
                        continue;
                    }
                    stats.messages_added += fresh.len();

                    // Union by id, ascending by timestamp
                    let mut merged = local_messages;
                    merged.extend(fresh.into_iter().cloned());
                    merged.sort_by_key(|m| (m.timestamp, m.id));

                    // Pairs whose messages are unchanged keep their
                    // bind and its lock/pin flags
                    let existing = storage.list_binds_for_branch(&branch.id)?;
                    let by_pair: HashMap<(MessageId, MessageId), Bind> = existing
                        .iter()
                        .map(|b| ((b.user_prompt.id, b.ai_response.id), b.clone()))
                        .collect();

                    let rebuilt = rebuild_binds(branch.id, &merged, &by_pair);
                    let keep: HashSet<BindId> = rebuilt.iter().map(|b| b.id).collect();
                    for old in &existing {
                        if !keep.contains(&old.id) {
                            storage.delete_bind(&old.id)?;
                        }
                    }
                    for bind in &rebuilt {
                        storage.save_bind(bind)?;
                    }
                    debug!(branch = %branch.id, binds = rebuilt.len(), "Merged remote branch");
                }
            }
        }

        Ok(stats)
    }

    /// Import remote snapshots. Snapshots are immutable, so only ids
    /// absent locally are inserted - never updated.
    pub fn import_snapshots(&self, remote: &[Snapshot]) -> SyncResult<usize> {
        let storage = self.repo.storage();
        let mut added = 0;
        for snapshot in remote {
            if storage.load_snapshot(&snapshot.id)?.is_none() {
                storage.save_snapshot(snapshot)?;
                added += 1;
            }
        }
        Ok(added)
    }

    /// User-invoked consolidation of arbitrary binds - not device
    /// sync; delegates to the repository operation.
    pub fn merge_selected_binds(
        &self,
        bind_ids: &[BindId],
        target_branch_id: &BranchId,
        new_branch_name: Option<String>,
    ) -> SyncResult<Branch> {
        self.repo
            .merge_selected_binds(bind_ids, target_branch_id, new_branch_name)
    }
}

/// Pair a sorted message list back into binds.
///
/// Consecutive user/assistant messages form a turn. An unpaired prompt
/// (or orphaned response) is paired with an empty placeholder
/// counterpart rather than dropped; placeholders are invisible to the
/// flattened message list.
fn rebuild_binds(
    branch_id: BranchId,
    sorted: &[Message],
    existing: &HashMap<(MessageId, MessageId), Bind>,
) -> Vec<Bind> {
    let mut binds = Vec::new();
    let mut pending: Option<Message> = None;

    let emit = |user: Message, assistant: Message, binds: &mut Vec<Bind>| {
        if let Some(kept) = existing.get(&(user.id, assistant.id)) {
            binds.push(kept.clone());
            return;
        }
        let turn_at = if user.content.is_empty() {
            assistant.timestamp
        } else {
            user.timestamp
        };
        let mut bind = Bind::new(branch_id, user, assistant);
        bind.created_at = turn_at;
        binds.push(bind);
    };

    for message in sorted {
        match message.role {
            Role::User => {
                if let Some(previous) = pending.take() {
                    let placeholder = placeholder_for(Role::Assistant, previous.timestamp);
                    emit(previous, placeholder, &mut binds);
                }
                pending = Some(message.clone());
            }
            Role::Assistant => match pending.take() {
                Some(user) => emit(user, message.clone(), &mut binds),
                None => {
                    let placeholder = placeholder_for(Role::User, message.timestamp);
                    emit(placeholder, message.clone(), &mut binds);
                }
            },
        }
    }
    if let Some(user) = pending {
        let placeholder = placeholder_for(Role::Assistant, user.timestamp);
        emit(user, placeholder, &mut binds);
    }

    binds
}

/// An empty counterpart message for an unpaired turn.
fn placeholder_for(role: Role, timestamp: i64) -> Message {
    Message {
        id: MessageId::new(),
        role,
        content: MessageContent::Text(String::new()),
        timestamp,
        attestation: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use crate::types::SyncSettings;
    use tempfile::TempDir;

    fn test_engine() -> (TempDir, ConversationRepository, MergeEngine) {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path().join("merge.redb")).unwrap();
        let repo = ConversationRepository::new(storage);
        let engine = MergeEngine::new(repo.clone());
        (dir, repo, engine)
    }

    fn remote_branch(messages: Vec<Message>) -> SyncBranch {
        SyncBranch {
            id: BranchId::new(),
            idea_id: crate::types::IdeaId::new(),
            idea_name: Some("Remote idea".to_string()),
            parent_id: None,
            name: "remote".to_string(),
            created_at: 1_000,
            is_merged: false,
            is_linear: true,
            messages,
        }
    }

    #[test]
    fn test_disjoint_branches_all_inserted() {
        let (_dir, repo, engine) = test_engine();
        let idea = repo.create_idea("Local", "").unwrap();
        repo.create_branch("local", &idea.id, None).unwrap();

        let remote = vec![
            remote_branch(vec![
                Message::user("q").with_timestamp(10),
                Message::assistant("a").with_timestamp(20),
            ]),
            remote_branch(vec![]),
        ];
        let stats = engine.import_branches(&remote).unwrap();

        assert_eq!(stats.branches_added, 2);
        assert_eq!(stats.branches_merged, 0);
        // 1 local + 2 remote, each retrievable by its original id
        assert_eq!(repo.branches().unwrap().len(), 3);
        for branch in &remote {
            assert!(repo.branch(&branch.id).unwrap().is_some());
        }
    }

    #[test]
    fn test_import_creates_missing_idea() {
        let (_dir, repo, engine) = test_engine();
        let remote = remote_branch(vec![]);
        let stats = engine.import_branches(&[remote.clone()]).unwrap();

        assert_eq!(stats.ideas_created, 1);
        let idea = repo.idea(&remote.idea_id).unwrap().unwrap();
        assert_eq!(idea.name, "Remote idea");
    }

    #[test]
    fn test_overlapping_messages_deduplicated_and_ordered() {
        let (_dir, repo, engine) = test_engine();

        let m1 = Message::user("m1").with_timestamp(100);
        let m2 = Message::assistant("m2").with_timestamp(200);

        // First import: branch b1 with just m1
        let mut first = remote_branch(vec![m1.clone()]);
        engine.import_branches(&[first.clone()]).unwrap();
        assert_eq!(
            repo.branch_messages(&first.id)
                .unwrap()
                .iter()
                .map(|m| m.id)
                .collect::<Vec<_>>(),
            vec![m1.id]
        );

        // Remote delivers b1 with [m1, m2]
        first.messages = vec![m1.clone(), m2.clone()];
        let stats = engine.import_branches(&[first.clone()]).unwrap();
        assert_eq!(stats.messages_added, 1);

        // m1 deduplicated, m2 appended in timestamp order
        let messages = repo.branch_messages(&first.id).unwrap();
        assert_eq!(
            messages.iter().map(|m| m.id).collect::<Vec<_>>(),
            vec![m1.id, m2.id]
        );
    }

    #[test]
    fn test_reimport_is_idempotent() {
        let (_dir, repo, engine) = test_engine();
        let remote = remote_branch(vec![
            Message::user("q").with_timestamp(10),
            Message::assistant("a").with_timestamp(20),
        ]);

        engine.import_branches(&[remote.clone()]).unwrap();
        let before = repo.branch_messages(&remote.id).unwrap();

        let stats = engine.import_branches(&[remote.clone()]).unwrap();
        assert_eq!(stats.messages_added, 0);
        assert_eq!(stats.branches_merged, 0);
        assert_eq!(repo.branch_messages(&remote.id).unwrap(), before);
    }

    #[test]
    fn test_metadata_lww_newer_remote_wins() {
        let (_dir, repo, engine) = test_engine();
        let mut remote = remote_branch(vec![]);
        engine.import_branches(&[remote.clone()]).unwrap();

        // Older remote rename loses
        let mut older = remote.clone();
        older.created_at = 500;
        older.name = "stale".to_string();
        engine.import_branches(&[older]).unwrap();
        assert_eq!(repo.branch(&remote.id).unwrap().unwrap().name, "remote");

        // Newer remote rename wins
        remote.created_at = 2_000;
        remote.name = "fresh".to_string();
        engine.import_branches(&[remote.clone()]).unwrap();
        assert_eq!(repo.branch(&remote.id).unwrap().unwrap().name, "fresh");
    }

    #[test]
    fn test_merge_preserves_bind_flags_for_unchanged_pairs() {
        let (_dir, repo, engine) = test_engine();
        let remote = remote_branch(vec![
            Message::user("q").with_timestamp(10),
            Message::assistant("a").with_timestamp(20),
        ]);
        engine.import_branches(&[remote.clone()]).unwrap();

        let bind = repo.binds_for_branch(&remote.id).unwrap().remove(0);
        repo.toggle_bind_pin(&bind.id).unwrap();

        // A later turn arrives; the pinned first turn must survive
        let mut update = remote.clone();
        update.messages.push(Message::user("q2").with_timestamp(30));
        update
            .messages
            .push(Message::assistant("a2").with_timestamp(40));
        engine.import_branches(&[update]).unwrap();

        let binds = repo.binds_for_branch(&remote.id).unwrap();
        assert_eq!(binds.len(), 2);
        assert_eq!(binds[0].id, bind.id);
        assert!(binds[0].pinned);
    }

    #[test]
    fn test_unpaired_prompt_gets_placeholder() {
        let (_dir, repo, engine) = test_engine();
        let remote = remote_branch(vec![Message::user("only prompt").with_timestamp(10)]);
        engine.import_branches(&[remote.clone()]).unwrap();

        let binds = repo.binds_for_branch(&remote.id).unwrap();
        assert_eq!(binds.len(), 1);
        assert!(binds[0].ai_response.content.is_empty());
        // Placeholder invisible in the flattened list
        assert_eq!(repo.branch_messages(&remote.id).unwrap().len(), 1);
    }

    #[test]
    fn test_snapshots_insert_only() {
        let (_dir, repo, engine) = test_engine();
        let idea = repo.create_idea("Topic", "").unwrap();
        let branch = repo.create_branch("main", &idea.id, None).unwrap();

        let mut snapshot = Snapshot::new(branch.id, vec![Message::user("q")], None);
        assert_eq!(engine.import_snapshots(&[snapshot.clone()]).unwrap(), 1);

        // A mutated copy of the same id must not overwrite
        snapshot.description = Some("tampered".to_string());
        assert_eq!(engine.import_snapshots(&[snapshot.clone()]).unwrap(), 0);
        assert!(repo
            .snapshot(&snapshot.id)
            .unwrap()
            .unwrap()
            .description
            .is_none());
    }

    #[test]
    fn test_import_payload_applies_newer_settings() {
        let (_dir, repo, engine) = test_engine();
        let payload = SyncPayload {
            kind: "sync".to_string(),
            branches: vec![],
            settings: SyncSettings {
                temperature: 0.1,
                max_tokens: 64,
                is_dark: true,
                selected_model: "remote-model".to_string(),
            },
            timestamp: chrono::Utc::now().timestamp_millis() + 1_000,
            snapshots: vec![],
        };

        engine.import_payload(&payload).unwrap();
        assert_eq!(
            repo.settings().unwrap().settings.selected_model,
            "remote-model"
        );
    }

    #[test]
    fn test_import_fires_single_notification() {
        let (_dir, repo, engine) = test_engine();
        let mut events = repo.subscribe();

        let payload = SyncPayload {
            kind: "sync".to_string(),
            branches: vec![remote_branch(vec![
                Message::user("q").with_timestamp(10),
                Message::assistant("a").with_timestamp(20),
            ])],
            settings: SyncSettings::default(),
            timestamp: 0,
            snapshots: vec![],
        };
        engine.import_payload(&payload).unwrap();

        let mut imported_events = 0;
        while let Ok(event) = events.try_recv() {
            if let crate::repository::RepositoryEvent::Imported {
                branches, messages, ..
            } = event
            {
                imported_events += 1;
                assert_eq!(branches, 1);
                assert_eq!(messages, 2);
            }
        }
        assert_eq!(imported_events, 1);
    }
}
