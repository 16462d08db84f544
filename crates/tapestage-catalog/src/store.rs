//! Persistent catalog store backed by redb.
//!
//! Every catalog mutation is written through in its own write transaction.
//! Reads are served from the in-memory catalogs; this module is only read
//! back at startup.

use crate::entry::StageCatalogEntry;
use crate::tables;
use redb::{Database, ReadableTable};
use std::path::Path;
use tapestage_common::ReqId;
use tracing::error;

/// Error type for catalog store operations
#[derive(Debug, thiserror::Error)]
pub enum CatalogStoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::TransactionError> for CatalogStoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<CatalogStoreError> for tapestage_common::Error {
    fn from(e: CatalogStoreError) -> Self {
        Self::Store(e.to_string())
    }
}

pub type CatalogStoreResult<T> = Result<T, CatalogStoreError>;

/// Persistent stage and path catalogs
pub struct CatalogStore {
    db: Database,
}

impl std::fmt::Debug for CatalogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogStore").finish_non_exhaustive()
    }
}

impl CatalogStore {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> CatalogStoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(tables::STAGE_ENTRIES)?;
            let _t = write_txn.open_table(tables::STAGE_PATHS)?;
            let _t = write_txn.open_table(tables::STAGE_META)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    // ---- Stage entries (bincode) ----

    pub fn put_entry(&self, entry: &StageCatalogEntry) {
        if let Err(e) = self.try_put_entry(entry) {
            error!("Failed to persist stage entry {}: {}", entry.reqid, e);
        }
    }

    fn try_put_entry(&self, entry: &StageCatalogEntry) -> CatalogStoreResult<()> {
        let bytes = bincode::serialize(entry)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::STAGE_ENTRIES)?;
            table.insert(entry.reqid.get(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn delete_entry(&self, reqid: ReqId) {
        if let Err(e) = self.try_delete_entry(reqid) {
            error!("Failed to delete stage entry {}: {}", reqid, e);
        }
    }

    fn try_delete_entry(&self, reqid: ReqId) -> CatalogStoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::STAGE_ENTRIES)?;
            table.remove(reqid.get())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn load_entries(&self) -> CatalogStoreResult<Vec<StageCatalogEntry>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::STAGE_ENTRIES)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            let key = entry.0.value();
            match bincode::deserialize::<StageCatalogEntry>(entry.1.value()) {
                Ok(value) => result.push(value),
                Err(e) => error!("Failed to decode stage entry {}: {}", key, e),
            }
        }
        Ok(result)
    }

    /// Remember the last reqid handed out so numbering resumes after a restart
    pub fn put_last_reqid(&self, reqid: ReqId) {
        if let Err(e) = (|| -> CatalogStoreResult<()> {
            let write_txn = self.db.begin_write()?;
            {
                let mut table = write_txn.open_table(tables::STAGE_META)?;
                table.insert(tables::META_LAST_REQID, u64::from(reqid.get()))?;
            }
            write_txn.commit()?;
            Ok(())
        })() {
            error!("Failed to persist last reqid {}: {}", reqid, e);
        }
    }

    /// Last reqid handed out before the last shutdown
    pub fn last_reqid(&self) -> CatalogStoreResult<Option<ReqId>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::STAGE_META)?;
        Ok(table
            .get(tables::META_LAST_REQID)?
            .and_then(|v| u32::try_from(v.value()).ok())
            .map(ReqId::new))
    }

    // ---- Path catalog ----

    pub fn put_path(&self, path: &str, reqid: ReqId) {
        if let Err(e) = (|| -> CatalogStoreResult<()> {
            let write_txn = self.db.begin_write()?;
            {
                let mut table = write_txn.open_table(tables::STAGE_PATHS)?;
                table.insert(path, reqid.get())?;
            }
            write_txn.commit()?;
            Ok(())
        })() {
            error!("Failed to persist path '{}': {}", path, e);
        }
    }

    pub fn delete_path(&self, path: &str) {
        if let Err(e) = (|| -> CatalogStoreResult<()> {
            let write_txn = self.db.begin_write()?;
            {
                let mut table = write_txn.open_table(tables::STAGE_PATHS)?;
                table.remove(path)?;
            }
            write_txn.commit()?;
            Ok(())
        })() {
            error!("Failed to delete path '{}': {}", path, e);
        }
    }

    pub fn load_paths(&self) -> CatalogStoreResult<Vec<(String, ReqId)>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::STAGE_PATHS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            result.push((entry.0.value().to_string(), ReqId::new(entry.1.value())));
        }
        Ok(result)
    }
}
