//! Persistent storage using redb.
//!
//! One table per entity kind (ideas, branches, binds, snapshots) plus a
//! single-record settings table. Records are JSON-serialized and keyed
//! by their ULID string, so the flat tables double as the id arena the
//! cascade-delete walks iterate over.

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};

use crate::conversation::{Bind, Branch, Idea, Snapshot};
use crate::error::SyncError;
use crate::types::{BindId, BranchId, IdeaId, SnapshotId, SyncSettings};

// Table definitions
const IDEAS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("ideas");
const BRANCHES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("branches");
const BINDS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("binds");
const SNAPSHOTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("snapshots");
const SETTINGS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("settings");

/// Key of the single settings record.
const SETTINGS_KEY: &str = "sync_settings";

/// Settings record with the timestamp of its last update, for
/// last-writer-wins resolution against received payloads.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SettingsRecord {
    /// The settings themselves
    pub settings: SyncSettings,
    /// Unix timestamp in milliseconds of the last local or imported update
    pub updated_at: i64,
}

/// Storage layer using redb for ACID-compliant persistence
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
}

impl Storage {
    /// Create a new storage instance at the given path.
    ///
    /// Creates the parent directory and all required tables if needed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        // Initialize all tables
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(IDEAS_TABLE)?;
            let _ = write_txn.open_table(BRANCHES_TABLE)?;
            let _ = write_txn.open_table(BINDS_TABLE)?;
            let _ = write_txn.open_table(SNAPSHOTS_TABLE)?;
            let _ = write_txn.open_table(SETTINGS_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Idea Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Save an idea. Overwrites an existing record with the same id.
    pub fn save_idea(&self, idea: &Idea) -> Result<(), SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(IDEAS_TABLE)?;
            let data =
                serde_json::to_vec(idea).map_err(|e| SyncError::Serialization(e.to_string()))?;
            let key = idea.id.to_string_repr();
            table.insert(key.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load a single idea by id. Returns `None` if absent.
    pub fn load_idea(&self, id: &IdeaId) -> Result<Option<Idea>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(IDEAS_TABLE)?;
        let key = id.to_string_repr();

        match table.get(key.as_str())? {
            Some(v) => {
                let idea: Idea = serde_json::from_slice(v.value())
                    .map_err(|e| SyncError::Serialization(e.to_string()))?;
                Ok(Some(idea))
            }
            None => Ok(None),
        }
    }

    /// Load all ideas.
    pub fn list_ideas(&self) -> Result<Vec<Idea>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(IDEAS_TABLE)?;

        let mut ideas = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let idea: Idea = serde_json::from_slice(value.value())
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            ideas.push(idea);
        }
        Ok(ideas)
    }

    /// Delete an idea record. Cascading is the repository's concern.
    pub fn delete_idea(&self, id: &IdeaId) -> Result<(), SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(IDEAS_TABLE)?;
            let key = id.to_string_repr();
            table.remove(key.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Branch Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Save a branch. Overwrites an existing record with the same id.
    pub fn save_branch(&self, branch: &Branch) -> Result<(), SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(BRANCHES_TABLE)?;
            let data =
                serde_json::to_vec(branch).map_err(|e| SyncError::Serialization(e.to_string()))?;
            let key = branch.id.to_string_repr();
            table.insert(key.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load a single branch by id. Returns `None` if absent.
    pub fn load_branch(&self, id: &BranchId) -> Result<Option<Branch>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(BRANCHES_TABLE)?;
        let key = id.to_string_repr();

        match table.get(key.as_str())? {
            Some(v) => {
                let branch: Branch = serde_json::from_slice(v.value())
                    .map_err(|e| SyncError::Serialization(e.to_string()))?;
                Ok(Some(branch))
            }
            None => Ok(None),
        }
    }

    /// Load all branches.
    pub fn list_branches(&self) -> Result<Vec<Branch>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(BRANCHES_TABLE)?;

        let mut branches = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let branch: Branch = serde_json::from_slice(value.value())
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            branches.push(branch);
        }
        Ok(branches)
    }

    /// Load all branches belonging to an idea.
    pub fn list_branches_for_idea(&self, idea_id: &IdeaId) -> Result<Vec<Branch>, SyncError> {
        let mut branches = self.list_branches()?;
        branches.retain(|b| &b.idea_id == idea_id);
        Ok(branches)
    }

    /// Delete a branch record. Cascading is the repository's concern.
    pub fn delete_branch(&self, id: &BranchId) -> Result<(), SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(BRANCHES_TABLE)?;
            let key = id.to_string_repr();
            table.remove(key.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Bind Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Save a bind. Overwrites an existing record with the same id.
    pub fn save_bind(&self, bind: &Bind) -> Result<(), SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(BINDS_TABLE)?;
            let data =
                serde_json::to_vec(bind).map_err(|e| SyncError::Serialization(e.to_string()))?;
            let key = bind.id.to_string_repr();
            table.insert(key.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load a single bind by id. Returns `None` if absent.
    pub fn load_bind(&self, id: &BindId) -> Result<Option<Bind>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(BINDS_TABLE)?;
        let key = id.to_string_repr();

        match table.get(key.as_str())? {
            Some(v) => {
                let bind: Bind = serde_json::from_slice(v.value())
                    .map_err(|e| SyncError::Serialization(e.to_string()))?;
                Ok(Some(bind))
            }
            None => Ok(None),
        }
    }

    /// Load all binds belonging to a branch, ordered by creation time.
    ///
    /// BindIds are ULIDs, so table order is already creation order; the
    /// explicit sort keeps imported binds with back-dated timestamps in
    /// conversation order.
    pub fn list_binds_for_branch(&self, branch_id: &BranchId) -> Result<Vec<Bind>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(BINDS_TABLE)?;

        let mut binds = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let bind: Bind = serde_json::from_slice(value.value())
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            if &bind.branch_id == branch_id {
                binds.push(bind);
            }
        }
        binds.sort_by_key(|b| (b.created_at, b.id));
        Ok(binds)
    }

    /// Delete a bind record.
    pub fn delete_bind(&self, id: &BindId) -> Result<(), SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(BINDS_TABLE)?;
            let key = id.to_string_repr();
            table.remove(key.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Snapshot Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Save a snapshot. Snapshots are immutable; callers only insert.
    pub fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(SNAPSHOTS_TABLE)?;
            let data = serde_json::to_vec(snapshot)
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            let key = snapshot.id.to_string_repr();
            table.insert(key.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load a single snapshot by id. Returns `None` if absent.
    pub fn load_snapshot(&self, id: &SnapshotId) -> Result<Option<Snapshot>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(SNAPSHOTS_TABLE)?;
        let key = id.to_string_repr();

        match table.get(key.as_str())? {
            Some(v) => {
                let snapshot: Snapshot = serde_json::from_slice(v.value())
                    .map_err(|e| SyncError::Serialization(e.to_string()))?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    /// Load all snapshots.
    pub fn list_snapshots(&self) -> Result<Vec<Snapshot>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(SNAPSHOTS_TABLE)?;

        let mut snapshots = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let snapshot: Snapshot = serde_json::from_slice(value.value())
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            snapshots.push(snapshot);
        }
        Ok(snapshots)
    }

    /// Load all snapshots taken from a branch, oldest first.
    pub fn list_snapshots_for_branch(
        &self,
        branch_id: &BranchId,
    ) -> Result<Vec<Snapshot>, SyncError> {
        let mut snapshots = self.list_snapshots()?;
        snapshots.retain(|s| &s.branch_id == branch_id);
        snapshots.sort_by_key(|s| s.timestamp);
        Ok(snapshots)
    }

    /// Delete a snapshot record.
    pub fn delete_snapshot(&self, id: &SnapshotId) -> Result<(), SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(SNAPSHOTS_TABLE)?;
            let key = id.to_string_repr();
            table.remove(key.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Settings Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Save the settings record.
    pub fn save_settings(&self, record: &SettingsRecord) -> Result<(), SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(SETTINGS_TABLE)?;
            let data = serde_json::to_vec(record)
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            table.insert(SETTINGS_KEY, data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load the settings record, or defaults if never saved.
    pub fn load_settings(&self) -> Result<SettingsRecord, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(SETTINGS_TABLE)?;

        match table.get(SETTINGS_KEY)? {
            Some(v) => {
                let record: SettingsRecord = serde_json::from_slice(v.value())
                    .map_err(|e| SyncError::Serialization(e.to_string()))?;
                Ok(record)
            }
            None => Ok(SettingsRecord {
                settings: SyncSettings::default(),
                updated_at: 0,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Message;
    use tempfile::TempDir;

    fn test_storage() -> (TempDir, Storage) {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path().join("test.redb")).unwrap();
        (dir, storage)
    }

    #[test]
    fn test_idea_save_load() {
        let (_dir, storage) = test_storage();
        let idea = Idea::new("Topic", "notes");

        storage.save_idea(&idea).unwrap();
        let loaded = storage.load_idea(&idea.id).unwrap().unwrap();
        assert_eq!(loaded, idea);
    }

    #[test]
    fn test_missing_idea_is_none() {
        let (_dir, storage) = test_storage();
        assert!(storage.load_idea(&IdeaId::new()).unwrap().is_none());
    }

    #[test]
    fn test_branch_filtering_by_idea() {
        let (_dir, storage) = test_storage();
        let idea_a = Idea::new("A", "");
        let idea_b = Idea::new("B", "");
        storage.save_idea(&idea_a).unwrap();
        storage.save_idea(&idea_b).unwrap();

        storage
            .save_branch(&Branch::new("main", idea_a.id, None))
            .unwrap();
        storage
            .save_branch(&Branch::new("main", idea_b.id, None))
            .unwrap();
        storage
            .save_branch(&Branch::new("alt", idea_a.id, None))
            .unwrap();

        assert_eq!(storage.list_branches_for_idea(&idea_a.id).unwrap().len(), 2);
        assert_eq!(storage.list_branches_for_idea(&idea_b.id).unwrap().len(), 1);
    }

    #[test]
    fn test_binds_sorted_by_created_at() {
        let (_dir, storage) = test_storage();
        let branch_id = BranchId::new();

        let mut early = Bind::new(branch_id, Message::user("1"), Message::assistant("a"));
        early.created_at = 1000;
        let mut late = Bind::new(branch_id, Message::user("2"), Message::assistant("b"));
        late.created_at = 2000;

        // Save out of order
        storage.save_bind(&late).unwrap();
        storage.save_bind(&early).unwrap();

        let binds = storage.list_binds_for_branch(&branch_id).unwrap();
        assert_eq!(binds.len(), 2);
        assert_eq!(binds[0].summary, "1");
        assert_eq!(binds[1].summary, "2");
    }

    #[test]
    fn test_snapshot_save_load() {
        let (_dir, storage) = test_storage();
        let snap = Snapshot::new(BranchId::new(), vec![Message::user("q")], None);
        storage.save_snapshot(&snap).unwrap();
        let loaded = storage.load_snapshot(&snap.id).unwrap().unwrap();
        assert_eq!(loaded, snap);
    }

    #[test]
    fn test_settings_default_then_roundtrip() {
        let (_dir, storage) = test_storage();

        let record = storage.load_settings().unwrap();
        assert_eq!(record.settings, SyncSettings::default());
        assert_eq!(record.updated_at, 0);

        let updated = SettingsRecord {
            settings: SyncSettings {
                temperature: 0.2,
                max_tokens: 512,
                is_dark: true,
                selected_model: "tiny".to_string(),
            },
            updated_at: 42,
        };
        storage.save_settings(&updated).unwrap();

        let loaded = storage.load_settings().unwrap();
        assert_eq!(loaded.settings.selected_model, "tiny");
        assert_eq!(loaded.updated_at, 42);
    }

    #[test]
    fn test_delete_removes_record() {
        let (_dir, storage) = test_storage();
        let idea = Idea::new("gone", "");
        storage.save_idea(&idea).unwrap();
        storage.delete_idea(&idea.id).unwrap();
        assert!(storage.load_idea(&idea.id).unwrap().is_none());
    }
}
