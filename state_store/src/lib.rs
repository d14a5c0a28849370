//! Transactional ledger of snapshot records.
//!
//! Records live in a RocksDB `TransactionDB` under the snapshotter root.
//! Write transactions are serialized by a writer lock so that a caller may
//! hold one across slow external work; read transactions run concurrently.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context};
use data_model::{Error, Result};
use rocksdb::{
    ColumnFamily,
    ColumnFamilyDescriptor,
    Options,
    TransactionDB,
    TransactionDBOptions,
};
use state_machine::SnapshotterColumns;
use strum::IntoEnumIterator;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};
use zvol_utils::OptionInspectNone;

pub mod scanner;
pub mod serializer;
pub mod state_machine;
pub mod test_state_store;

use serializer::JsonEncoder;

/// Version of the record layout written by this build.
pub const DB_VERSION: u64 = 1;

const DB_VERSION_KEY: &str = "db_version";

pub struct MetaStore {
    db: TransactionDB,
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl MetaStore {
    pub fn open(path: &Path) -> Result<Self> {
        fs::create_dir_all(path)
            .with_context(|| format!("failed to create metadata dir {}", path.display()))?;

        let column_families = SnapshotterColumns::iter()
            .map(|cf| ColumnFamilyDescriptor::new(cf.to_string(), Options::default()));
        let mut db_opts = Options::default();
        db_opts.create_missing_column_families(true);
        db_opts.create_if_missing(true);
        let db = TransactionDB::open_cf_descriptors(
            &db_opts,
            &TransactionDBOptions::default(),
            path,
            column_families,
        )
        .map_err(|e| anyhow!("failed to open metadata db {}: {}", path.display(), e))?;

        let store = Self {
            db,
            path: path.to_path_buf(),
            write_lock: Mutex::new(()),
        };
        store.check_version()?;
        info!(path = %path.display(), db_version = DB_VERSION, "opened metadata store");
        Ok(store)
    }

    fn check_version(&self) -> Result<()> {
        let cf = self.column_family(SnapshotterColumns::Metadata)?;
        let version = self
            .db
            .get_cf(cf, DB_VERSION_KEY)
            .context("failed to read db version")?;
        match version {
            Some(bytes) => {
                let version: u64 = JsonEncoder::decode(DB_VERSION_KEY, &bytes)?;
                if version > DB_VERSION {
                    return Err(Error::failed_precondition(format!(
                        "metadata db version {} is newer than supported version {}",
                        version, DB_VERSION
                    )));
                }
                debug!(version, "metadata db version discovered");
            }
            None => {
                self.db
                    .put_cf(cf, DB_VERSION_KEY, JsonEncoder::encode(DB_VERSION_KEY, &DB_VERSION)?)
                    .context("failed to write db version")?;
            }
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn column_family(&self, column: SnapshotterColumns) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(column.as_ref())
            .inspect_none(|| {
                tracing::error!("failed to get column family handle for {}", column);
            })
            .ok_or_else(|| Error::Internal(anyhow!("missing column family {}", column)))
    }

    /// Begin a transaction. Writable transactions wait for every other
    /// writable transaction to finish first. A transaction that is dropped
    /// without `commit` is rolled back.
    pub async fn transaction(&self, writable: bool) -> Transaction<'_> {
        let guard = if writable {
            Some(self.write_lock.lock().await)
        } else {
            None
        };
        Transaction {
            store: self,
            txn: self.db.transaction(),
            writable,
            _guard: guard,
        }
    }
}

pub struct Transaction<'db> {
    store: &'db MetaStore,
    txn: rocksdb::Transaction<'db, TransactionDB>,
    writable: bool,
    _guard: Option<MutexGuard<'db, ()>>,
}

impl<'db> Transaction<'db> {
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn commit(self) -> Result<()> {
        if !self.writable {
            return Ok(());
        }
        self.txn
            .commit()
            .context("failed to commit metadata transaction")?;
        Ok(())
    }

    pub fn rollback(self) -> Result<()> {
        self.txn
            .rollback()
            .context("failed to roll back metadata transaction")?;
        Ok(())
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(Error::failed_precondition(
                "write attempted in a read-only metadata transaction",
            ))
        }
    }

    pub(crate) fn column_family(&self, column: SnapshotterColumns) -> Result<&'db ColumnFamily> {
        self.store.column_family(column)
    }

    pub(crate) fn inner(&self) -> &rocksdb::Transaction<'db, TransactionDB> {
        &self.txn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reopen_keeps_version() -> Result<()> {
        let temp_dir = tempfile::tempdir().map_err(anyhow::Error::from)?;
        let path = temp_dir.path().join("metadata.db");
        {
            let store = MetaStore::open(&path)?;
            assert_eq!(store.path(), path.as_path());
        }
        let store = MetaStore::open(&path)?;
        let cf = store.column_family(SnapshotterColumns::Metadata)?;
        let version = store.db.get_cf(cf, DB_VERSION_KEY).unwrap().unwrap();
        assert_eq!(JsonEncoder::decode::<u64>(DB_VERSION_KEY, &version)?, DB_VERSION);
        Ok(())
    }

    #[tokio::test]
    async fn test_rejects_newer_version() -> Result<()> {
        let temp_dir = tempfile::tempdir().map_err(anyhow::Error::from)?;
        let path = temp_dir.path().join("metadata.db");
        {
            let store = MetaStore::open(&path)?;
            let cf = store.column_family(SnapshotterColumns::Metadata)?;
            store
                .db
                .put_cf(cf, DB_VERSION_KEY, JsonEncoder::encode(DB_VERSION_KEY, &(DB_VERSION + 1))?)
                .unwrap();
        }
        let err = MetaStore::open(&path).err().unwrap();
        assert!(err.is_failed_precondition());
        Ok(())
    }

    #[tokio::test]
    async fn test_read_transaction_rejects_writes() -> Result<()> {
        let temp_dir = tempfile::tempdir().map_err(anyhow::Error::from)?;
        let store = MetaStore::open(&temp_dir.path().join("metadata.db"))?;
        let txn = store.transaction(false).await;
        assert!(!txn.is_writable());
        assert!(txn.ensure_writable().unwrap_err().is_failed_precondition());
        Ok(())
    }
}
