use crate::core::group::Group;
use crate::core::ids::GroupId;
use crate::store::{Store, StoreError, Tables, Transaction};
use log::{debug, info};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// In-process store with optional JSON file persistence.
///
/// Writers are serialized by a single mutex held for the whole
/// transaction, so a group row locked by one transaction can never be
/// observed half-updated by another. Readers get the last committed
/// snapshot and never wait for a writer.
///
/// When opened with a path, every commit rewrites the file through a
/// temporary sibling and an atomic rename before the new state becomes
/// visible.
pub struct MemoryStore {
    committed: RwLock<Arc<Tables>>,
    writer: Mutex<()>,
    path: Option<PathBuf>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Purely in-memory store.
    pub fn new() -> Self {
        Self {
            committed: RwLock::new(Arc::new(Tables::new())),
            writer: Mutex::new(()),
            path: None,
        }
    }

    /// Store backed by a JSON file, created on first commit if missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let tables = if path.exists() {
            let content = fs::read_to_string(&path)?;
            let tables: Tables = serde_json::from_str(&content)?;
            info!("loaded store from {}", path.display());
            tables
        } else {
            Tables::new()
        };
        Ok(Self {
            committed: RwLock::new(Arc::new(tables)),
            writer: Mutex::new(()),
            path: Some(path),
        })
    }

    fn persist(&self, tables: &Tables) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(tables)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl Store for MemoryStore {
    fn snapshot(&self) -> Arc<Tables> {
        Arc::clone(&self.committed.read())
    }

    fn begin(&self) -> Result<Box<dyn Transaction + '_>, StoreError> {
        let guard = self.writer.lock();
        let working = (**self.committed.read()).clone();
        Ok(Box::new(MemoryTransaction {
            store: self,
            _guard: guard,
            working,
            locked: BTreeSet::new(),
        }))
    }
}

struct MemoryTransaction<'a> {
    store: &'a MemoryStore,
    _guard: MutexGuard<'a, ()>,
    working: Tables,
    locked: BTreeSet<GroupId>,
}

impl Transaction for MemoryTransaction<'_> {
    fn tables(&self) -> &Tables {
        &self.working
    }

    fn tables_mut(&mut self) -> &mut Tables {
        &mut self.working
    }

    fn lock_group(&mut self, id: GroupId) -> Result<Group, StoreError> {
        let group = self.working.require_group(id)?.clone();
        if self.locked.insert(id) {
            debug!("locked {}", id);
        }
        Ok(group)
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        this.store.persist(&this.working)?;
        *this.store.committed.write() = Arc::new(this.working);
        if !this.locked.is_empty() {
            debug!("released {} group lock(s)", this.locked.len());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::currency::CurrencyCode;
    use chrono::Utc;

    fn sample_group(tables: &mut Tables, token: &str) -> GroupId {
        let id = tables.next_group_id();
        tables
            .insert_group(Group {
                id,
                name: "Flat".into(),
                description: None,
                currency: CurrencyCode::new("EUR"),
                share_token: token.into(),
                admin_token: format!("{token}-ADMIN"),
                is_active: true,
                is_settled: false,
                settled_at: None,
                expires_at: None,
                is_recurring: false,
                next_settlement_date: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .unwrap();
        id
    }

    #[test]
    fn test_dropped_transaction_rolls_back() {
        let store = MemoryStore::new();
        {
            let mut tx = store.begin().unwrap();
            sample_group(tx.tables_mut(), "T1");
        }
        assert_eq!(store.snapshot().groups().count(), 0);

        let mut tx = store.begin().unwrap();
        sample_group(tx.tables_mut(), "T1");
        tx.commit().unwrap();
        assert_eq!(store.snapshot().groups().count(), 1);
    }

    #[test]
    fn test_snapshot_is_isolated_from_open_transaction() {
        let store = MemoryStore::new();
        let before = store.snapshot();
        let mut tx = store.begin().unwrap();
        let id = sample_group(tx.tables_mut(), "T2");
        assert!(tx.lock_group(id).is_ok());
        assert!(store.snapshot().group(id).is_none());
        tx.commit().unwrap();
        assert!(before.group(id).is_none());
        assert!(store.snapshot().group(id).is_some());
    }

    #[test]
    fn test_lock_missing_group() {
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        assert!(matches!(
            tx.lock_group(GroupId::new(7)),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn test_file_store_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        {
            let store = MemoryStore::open(&path).unwrap();
            let mut tx = store.begin().unwrap();
            sample_group(tx.tables_mut(), "DISK");
            tx.commit().unwrap();
        }
        let reopened = MemoryStore::open(&path).unwrap();
        let snapshot = reopened.snapshot();
        assert!(snapshot.group_by_share_token("DISK").is_some());

        let mut tx = reopened.begin().unwrap();
        assert_eq!(tx.tables_mut().next_group_id(), GroupId::new(2));
    }
}
