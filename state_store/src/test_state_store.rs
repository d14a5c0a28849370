use anyhow::Context;
use data_model::Result;
use tempfile::TempDir;

use crate::MetaStore;

/// A metadata store in a throwaway directory, removed on drop.
pub struct TestStateStore {
    pub meta_store: MetaStore,
    _temp_dir: TempDir,
}

impl TestStateStore {
    pub fn new() -> Result<TestStateStore> {
        let temp_dir = tempfile::tempdir().context("failed to create temp dir")?;
        let meta_store = MetaStore::open(&temp_dir.path().join("metadata.db"))?;
        Ok(TestStateStore {
            meta_store,
            _temp_dir: temp_dir,
        })
    }
}
