//! In-memory transactional store.
//!
//! Tables hold string rows as versions stamped with the transaction that
//! created them and, once deleted, the transaction that deleted them. Which
//! versions a reader sees depends on its isolation level:
//!
//! | Isolation | Sees |
//! |---|---|
//! | READ_UNCOMMITTED | every live version, committed or not |
//! | READ_COMMITTED, DEFAULT | versions committed when the statement runs |
//! | REPEATABLE_READ, SERIALIZABLE | versions committed when the transaction began |
//!
//! A transaction always sees its own writes. Write-write conflicts are not
//! detected.
//!
//! Once no open transaction can tell a commit apart from history, its
//! versions are folded into the base state and dropped from the commit log.

use crate::db::manager::{TransactionManager, TransactionSession};
use crate::error::{TxError, TxResult};
use crate::models::{Isolation, TransactionDefinition};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

type TxId = u64;

/// Creator of versions whose commit every reader already sees.
const FROZEN: TxId = 0;

#[derive(Debug)]
struct RowVersion {
    id: u64,
    value: String,
    created_by: TxId,
    deleted_by: Option<TxId>,
}

#[derive(Debug, Clone)]
enum Undo {
    Inserted { table: String, version: u64 },
    Deleted { table: String, version: u64 },
}

#[derive(Debug, Default)]
struct Store {
    tables: BTreeMap<String, Vec<RowVersion>>,
    next_tx: TxId,
    next_version: u64,
    commit_seq: u64,
    /// Commit sequence number of committed transactions not yet frozen.
    committed: HashMap<TxId, u64>,
    /// Snapshot of every open transaction.
    open: HashMap<TxId, u64>,
}

/// How a statement looks at the store.
#[derive(Debug, Clone, Copy)]
struct Viewer {
    tx: Option<TxId>,
    isolation: Isolation,
    snapshot: u64,
}

impl Store {
    fn allocate_tx(&mut self) -> TxId {
        self.next_tx += 1;
        self.next_tx
    }

    fn horizon(&self, viewer: &Viewer) -> u64 {
        match viewer.isolation {
            Isolation::RepeatableRead | Isolation::Serializable => viewer.snapshot,
            _ => self.commit_seq,
        }
    }

    fn committed_by(&self, tx: TxId, horizon: u64) -> bool {
        tx == FROZEN || self.committed.get(&tx).is_some_and(|seq| *seq <= horizon)
    }

    fn is_visible(&self, version: &RowVersion, viewer: &Viewer) -> bool {
        let dirty = viewer.isolation == Isolation::ReadUncommitted;
        let horizon = self.horizon(viewer);
        let own = |tx: TxId| viewer.tx == Some(tx);

        let created = own(version.created_by) || dirty || self.committed_by(version.created_by, horizon);
        if !created {
            return false;
        }
        match version.deleted_by {
            None => true,
            Some(tx) if own(tx) || dirty => false,
            Some(tx) => !self.committed_by(tx, horizon),
        }
    }

    fn visible_rows(&self, table: &str, viewer: &Viewer) -> Vec<String> {
        self.tables
            .get(table)
            .map(|versions| {
                versions
                    .iter()
                    .filter(|v| self.is_visible(v, viewer))
                    .map(|v| v.value.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn insert(&mut self, table: &str, value: String, tx: TxId) -> u64 {
        self.next_version += 1;
        let id = self.next_version;
        self.tables.entry(table.to_string()).or_default().push(RowVersion {
            id,
            value,
            created_by: tx,
            deleted_by: None,
        });
        id
    }

    fn delete_visible(&mut self, table: &str, viewer: &Viewer, tx: TxId) -> Vec<u64> {
        let targets: Vec<u64> = match self.tables.get(table) {
            Some(versions) => versions
                .iter()
                .filter(|v| v.deleted_by.is_none() && self.is_visible(v, viewer))
                .map(|v| v.id)
                .collect(),
            None => return Vec::new(),
        };
        if let Some(versions) = self.tables.get_mut(table) {
            for version in versions.iter_mut().filter(|v| targets.contains(&v.id)) {
                version.deleted_by = Some(tx);
            }
        }
        targets
    }

    fn commit(&mut self, tx: TxId) {
        self.commit_seq += 1;
        self.committed.insert(tx, self.commit_seq);
        self.release(tx);
    }

    /// Forget `tx` as an open transaction and prune what nobody can see.
    fn release(&mut self, tx: TxId) {
        self.open.remove(&tx);
        self.prune();
    }

    /// Freeze commits at or below the oldest open snapshot.
    fn prune(&mut self) {
        let oldest = self.open.values().copied().min().unwrap_or(self.commit_seq);
        let settled: Vec<TxId> = self
            .committed
            .iter()
            .filter(|(_, seq)| **seq <= oldest)
            .map(|(tx, _)| *tx)
            .collect();
        if settled.is_empty() {
            return;
        }
        for versions in self.tables.values_mut() {
            versions.retain(|v| !v.deleted_by.is_some_and(|tx| settled.contains(&tx)));
            for version in versions.iter_mut() {
                if settled.contains(&version.created_by) {
                    version.created_by = FROZEN;
                }
            }
        }
        for tx in &settled {
            self.committed.remove(tx);
        }
    }

    fn undo(&mut self, entry: Undo) {
        match entry {
            Undo::Inserted { table, version } => {
                if let Some(versions) = self.tables.get_mut(&table) {
                    versions.retain(|v| v.id != version);
                }
            }
            Undo::Deleted { table, version } => {
                if let Some(v) = self
                    .tables
                    .get_mut(&table)
                    .and_then(|versions| versions.iter_mut().find(|v| v.id == version))
                {
                    v.deleted_by = None;
                }
            }
        }
    }
}

/// Shared in-memory database.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    store: Mutex<Store>,
}

impl MemoryDatabase {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Rows of `table` committed so far, in insertion order.
    pub fn committed_rows(&self, table: &str) -> Vec<String> {
        let store = self.store.lock();
        let viewer = Viewer {
            tx: None,
            isolation: Isolation::ReadCommitted,
            snapshot: store.commit_seq,
        };
        store.visible_rows(table, &viewer)
    }

    pub fn committed_count(&self, table: &str) -> usize {
        self.committed_rows(table).len()
    }
}

#[derive(Debug)]
struct OpenTransaction {
    id: TxId,
    isolation: Isolation,
    snapshot: u64,
    undo: Vec<Undo>,
    savepoints: Vec<(String, usize)>,
}

/// Session on a [`MemoryDatabase`].
#[derive(Debug)]
pub struct MemorySession {
    db: Arc<MemoryDatabase>,
    transaction: Option<OpenTransaction>,
    read_only: bool,
}

impl MemorySession {
    fn auto_commit(db: Arc<MemoryDatabase>) -> Self {
        Self {
            db,
            transaction: None,
            read_only: false,
        }
    }

    fn begin(db: Arc<MemoryDatabase>, definition: &TransactionDefinition) -> Self {
        let transaction = {
            let mut store = db.store.lock();
            let id = store.allocate_tx();
            let snapshot = store.commit_seq;
            store.open.insert(id, snapshot);
            OpenTransaction {
                id,
                isolation: definition.isolation,
                snapshot,
                undo: Vec::new(),
                savepoints: Vec::new(),
            }
        };
        debug!(
            tx_id = transaction.id,
            isolation = %definition.isolation,
            read_only = definition.read_only,
            "Memory transaction started"
        );
        Self {
            db,
            transaction: Some(transaction),
            read_only: definition.read_only,
        }
    }

    fn viewer(&self, store: &Store) -> Viewer {
        match &self.transaction {
            Some(tx) => Viewer {
                tx: Some(tx.id),
                isolation: tx.isolation,
                snapshot: tx.snapshot,
            },
            None => Viewer {
                tx: None,
                isolation: Isolation::ReadCommitted,
                snapshot: store.commit_seq,
            },
        }
    }

    fn check_writable(&self, operation: &str) -> TxResult<()> {
        if self.read_only {
            return Err(TxError::read_only(operation));
        }
        Ok(())
    }

    /// Insert one row into `table`.
    pub fn insert(&mut self, table: &str, value: impl Into<String>) -> TxResult<()> {
        self.check_writable(&format!("INSERT INTO {table}"))?;
        let value = value.into();
        let mut store = self.db.store.lock();
        match &mut self.transaction {
            Some(tx) => {
                let version = store.insert(table, value, tx.id);
                tx.undo.push(Undo::Inserted {
                    table: table.to_string(),
                    version,
                });
            }
            None => {
                let tx = store.allocate_tx();
                store.insert(table, value, tx);
                store.commit(tx);
            }
        }
        Ok(())
    }

    /// Delete every row of `table` visible to this session.
    pub fn delete_all(&mut self, table: &str) -> TxResult<u64> {
        self.check_writable(&format!("DELETE FROM {table}"))?;
        let mut store = self.db.store.lock();
        let viewer = self.viewer(&store);
        let deleted = match &mut self.transaction {
            Some(tx) => {
                let deleted = store.delete_visible(table, &viewer, tx.id);
                tx.undo.extend(deleted.iter().map(|version| Undo::Deleted {
                    table: table.to_string(),
                    version: *version,
                }));
                deleted
            }
            None => {
                let tx = store.allocate_tx();
                let deleted = store.delete_visible(table, &viewer, tx);
                store.commit(tx);
                deleted
            }
        };
        Ok(deleted.len() as u64)
    }

    /// Rows of `table` visible to this session.
    pub fn select(&self, table: &str) -> TxResult<Vec<String>> {
        let store = self.db.store.lock();
        let viewer = self.viewer(&store);
        Ok(store.visible_rows(table, &viewer))
    }

    pub fn count(&self, table: &str) -> TxResult<usize> {
        self.select(table).map(|rows| rows.len())
    }

    fn open_transaction(&mut self, operation: &str) -> TxResult<&mut OpenTransaction> {
        self.transaction
            .as_mut()
            .ok_or_else(|| TxError::internal(format!("{operation}: no transaction in progress")))
    }

    fn undo_to(&mut self, mark: usize) {
        let Some(tx) = self.transaction.as_mut() else {
            return;
        };
        let entries: Vec<Undo> = tx.undo.drain(mark..).rev().collect();
        let mut store = self.db.store.lock();
        for entry in entries {
            store.undo(entry);
        }
    }

    fn savepoint_index(&mut self, name: &str) -> TxResult<usize> {
        let tx = self.open_transaction("savepoint")?;
        tx.savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| {
                TxError::database(
                    format!("Savepoint '{}' does not exist", name),
                    None,
                    "Create the savepoint before rolling back to or releasing it",
                )
            })
    }
}

impl TransactionSession for MemorySession {
    fn is_transactional(&self) -> bool {
        self.transaction.is_some()
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    async fn commit(&mut self) -> TxResult<()> {
        let tx = self
            .transaction
            .take()
            .ok_or_else(|| TxError::internal("commit: no transaction in progress"))?;
        self.db.store.lock().commit(tx.id);
        debug!(tx_id = tx.id, "Memory transaction committed");
        Ok(())
    }

    async fn rollback(&mut self) -> TxResult<()> {
        let id = self.open_transaction("rollback")?.id;
        self.undo_to(0);
        self.transaction = None;
        self.db.store.lock().release(id);
        debug!(tx_id = id, "Memory transaction rolled back");
        Ok(())
    }

    async fn create_savepoint(&mut self, name: &str) -> TxResult<()> {
        let tx = self.open_transaction("savepoint")?;
        let mark = tx.undo.len();
        tx.savepoints.push((name.to_string(), mark));
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> TxResult<()> {
        let index = self.savepoint_index(name)?;
        let mark = self.open_transaction("savepoint")?.savepoints[index].1;
        self.undo_to(mark);
        if let Some(tx) = self.transaction.as_mut() {
            tx.savepoints.truncate(index + 1);
        }
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> TxResult<()> {
        let index = self.savepoint_index(name)?;
        if let Some(tx) = self.transaction.as_mut() {
            tx.savepoints.truncate(index);
        }
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if let Some(tx_id) = self.transaction.as_ref().map(|tx| tx.id) {
            warn!(tx_id = tx_id, "Memory session dropped with open transaction, rolling back");
            self.undo_to(0);
            self.transaction = None;
            self.db.store.lock().release(tx_id);
        }
    }
}

/// [`TransactionManager`] over a shared [`MemoryDatabase`].
#[derive(Debug)]
pub struct MemoryTransactionManager {
    name: String,
    db: Arc<MemoryDatabase>,
    started: AtomicU64,
}

impl MemoryTransactionManager {
    pub fn new(name: impl Into<String>, db: Arc<MemoryDatabase>) -> Self {
        Self {
            name: name.into(),
            db,
            started: AtomicU64::new(0),
        }
    }

    pub fn database(&self) -> &Arc<MemoryDatabase> {
        &self.db
    }

    /// Number of physical transactions begun so far.
    pub fn transactions_started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }
}

impl TransactionManager for MemoryTransactionManager {
    type Session = MemorySession;

    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self) -> TxResult<MemorySession> {
        Ok(MemorySession::auto_commit(self.db.clone()))
    }

    async fn begin(&self, definition: &TransactionDefinition) -> TxResult<MemorySession> {
        self.started.fetch_add(1, Ordering::Relaxed);
        Ok(MemorySession::begin(self.db.clone(), definition))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn begin(db: &Arc<MemoryDatabase>, isolation: Isolation) -> MemorySession {
        MemorySession::begin(db.clone(), &TransactionDefinition::read_write(isolation))
    }

    #[tokio::test]
    async fn test_commit_makes_rows_visible() {
        let db = MemoryDatabase::new();
        let mut session = begin(&db, Isolation::Default);
        session.insert("t", "a").unwrap();
        assert_eq!(session.count("t").unwrap(), 1);
        assert_eq!(db.committed_count("t"), 0);
        session.commit().await.unwrap();
        assert_eq!(db.committed_rows("t"), vec!["a"]);
    }

    #[tokio::test]
    async fn test_rollback_discards_rows() {
        let db = MemoryDatabase::new();
        let mut session = begin(&db, Isolation::Default);
        session.insert("t", "a").unwrap();
        session.rollback().await.unwrap();
        assert_eq!(db.committed_count("t"), 0);
        assert!(!session.is_transactional());
    }

    #[tokio::test]
    async fn test_dirty_read_only_under_read_uncommitted() {
        let db = MemoryDatabase::new();
        let mut writer = begin(&db, Isolation::Default);
        writer.insert("t", "pending").unwrap();

        let dirty = begin(&db, Isolation::ReadUncommitted);
        let committed = begin(&db, Isolation::ReadCommitted);
        assert_eq!(dirty.count("t").unwrap(), 1);
        assert_eq!(committed.count("t").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_repeatable_read_keeps_snapshot() {
        let db = MemoryDatabase::new();
        let repeatable = begin(&db, Isolation::RepeatableRead);
        let read_committed = begin(&db, Isolation::ReadCommitted);

        let mut writer = begin(&db, Isolation::Default);
        writer.insert("t", "late").unwrap();
        writer.commit().await.unwrap();

        assert_eq!(repeatable.count("t").unwrap(), 0);
        assert_eq!(read_committed.count("t").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_savepoint_rollback_keeps_earlier_work() {
        let db = MemoryDatabase::new();
        let mut session = begin(&db, Isolation::Default);
        session.insert("t", "outer").unwrap();
        session.create_savepoint("SAVEPOINT_1").await.unwrap();
        session.insert("t", "inner").unwrap();
        session.delete_all("t").unwrap();
        session.rollback_to_savepoint("SAVEPOINT_1").await.unwrap();
        session.release_savepoint("SAVEPOINT_1").await.unwrap();
        session.commit().await.unwrap();
        assert_eq!(db.committed_rows("t"), vec!["outer"]);
    }

    #[tokio::test]
    async fn test_unknown_savepoint_is_an_error() {
        let db = MemoryDatabase::new();
        let mut session = begin(&db, Isolation::Default);
        assert!(session.rollback_to_savepoint("nope").await.is_err());
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let db = MemoryDatabase::new();
        let mut session =
            MemorySession::begin(db.clone(), &TransactionDefinition::read_only(Isolation::Default));
        let err = session.insert("t", "x").unwrap_err();
        assert!(matches!(err, TxError::ReadOnlyTransaction { .. }));
    }

    #[test]
    fn test_auto_commit_writes_immediately() {
        let db = MemoryDatabase::new();
        let mut session = MemorySession::auto_commit(db.clone());
        session.insert("t", "x").unwrap();
        assert_eq!(db.committed_count("t"), 1);
        assert_eq!(session.delete_all("t").unwrap(), 1);
        assert_eq!(db.committed_count("t"), 0);
    }

    #[tokio::test]
    async fn test_commit_log_is_pruned_past_the_oldest_snapshot() {
        let db = MemoryDatabase::new();
        let mut writer = MemorySession::auto_commit(db.clone());
        writer.insert("t", "a").unwrap();
        assert!(db.store.lock().committed.is_empty());

        let mut snapshot = begin(&db, Isolation::RepeatableRead);
        writer.delete_all("t").unwrap();
        writer.insert("t", "b").unwrap();
        assert_eq!(db.store.lock().committed.len(), 2);
        assert_eq!(snapshot.select("t").unwrap(), vec!["a"]);

        snapshot.commit().await.unwrap();
        let store = db.store.lock();
        assert!(store.committed.is_empty());
        assert!(store.open.is_empty());
        assert_eq!(store.tables["t"].len(), 1);
        drop(store);
        assert_eq!(db.committed_rows("t"), vec!["b"]);
    }

    #[test]
    fn test_dropped_session_rolls_back() {
        let db = MemoryDatabase::new();
        {
            let mut session = begin(&db, Isolation::Default);
            session.insert("t", "x").unwrap();
        }
        let reader = begin(&db, Isolation::ReadUncommitted);
        assert_eq!(reader.count("t").unwrap(), 0);
    }
}
