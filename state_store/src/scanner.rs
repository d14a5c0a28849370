use anyhow::Context;
use data_model::{filter::SnapshotFilter, Info, Result};
use rocksdb::{IteratorMode, ReadOptions};

use super::state_machine::{SnapshotRecord, SnapshotterColumns};
use crate::{serializer::JsonEncoder, Transaction};

/// Visit every snapshot record matching `filter` in key order. The first
/// error returned by `visit` stops the walk and is returned.
pub fn walk<F>(txn: &Transaction, filter: &SnapshotFilter, mut visit: F) -> Result<()>
where
    F: FnMut(&Info) -> Result<()>,
{
    let cf = txn.column_family(SnapshotterColumns::Snapshots)?;
    let mut read_options = ReadOptions::default();
    read_options.set_readahead_size(4_194_304);
    let iter = txn.inner().iterator_cf_opt(cf, read_options, IteratorMode::Start);
    for item in iter {
        let (key, value) = item.context("failed to scan snapshot records")?;
        let key = String::from_utf8(key.to_vec()).context("snapshot key is not utf-8")?;
        let record: SnapshotRecord = JsonEncoder::decode(&key, &value)?;
        let info = record.info(&key);
        if filter.matches(&info) {
            visit(&info)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use data_model::{Error, Kind, Usage};

    use super::*;
    use crate::{state_machine, test_state_store::TestStateStore};

    #[tokio::test]
    async fn test_walk_with_filters() -> Result<()> {
        let store = TestStateStore::new()?;
        let txn = store.meta_store.transaction(true).await;
        state_machine::create_snapshot(&txn, Kind::Active, "a", "", HashMap::new())?;
        state_machine::commit_active(&txn, "a", "base", Usage::default(), HashMap::new())?;
        state_machine::create_snapshot(&txn, Kind::Active, "work", "base", HashMap::new())?;
        state_machine::create_snapshot(&txn, Kind::View, "view", "base", HashMap::new())?;
        txn.commit()?;

        let txn = store.meta_store.transaction(false).await;
        let mut names = vec![];
        walk(&txn, &SnapshotFilter::default(), |info| {
            names.push(info.name.clone());
            Ok(())
        })?;
        assert_eq!(names, vec!["base", "view", "work"]);

        let mut names = vec![];
        let filter = SnapshotFilter::parse(&["parent==base,kind==view", "kind==committed"])?;
        walk(&txn, &filter, |info| {
            names.push(info.name.clone());
            Ok(())
        })?;
        assert_eq!(names, vec!["base", "view"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_walk_stops_on_error() -> Result<()> {
        let store = TestStateStore::new()?;
        let txn = store.meta_store.transaction(true).await;
        state_machine::create_snapshot(&txn, Kind::Active, "a", "", HashMap::new())?;
        state_machine::create_snapshot(&txn, Kind::Active, "b", "", HashMap::new())?;

        let mut visited = 0;
        let err = walk(&txn, &SnapshotFilter::default(), |_| {
            visited += 1;
            Err(Error::failed_precondition("stop"))
        })
        .unwrap_err();
        assert!(err.is_failed_precondition());
        assert_eq!(visited, 1);
        Ok(())
    }
}
