use std::collections::HashMap;

use anyhow::Context;
use data_model::{Error, Info, Kind, Result, Snapshot, Usage, LABEL_VOLUME_SIZE};
use rocksdb::{Direction, IteratorMode};
use serde::{Deserialize, Serialize};
use strum::AsRefStr;
use tracing::debug;
use zvol_utils::get_epoch_time_in_ns;

use crate::{
    serializer::JsonEncoder,
    Transaction,
};

#[derive(Debug, Clone, Copy, AsRefStr, strum::Display, strum::EnumIter)]
pub enum SnapshotterColumns {
    Metadata,  //  db_version, id sequence
    Snapshots, //  Key -> SnapshotRecord
    Children,  //  ParentKey \0 ChildKey -> Empty
}

const SEQUENCE_KEY: &str = "sequence";

/// Maximum combined length of a label key and value.
const MAX_LABEL_SIZE: usize = 4096;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SnapshotRecord {
    pub id: String,
    pub kind: Kind,
    pub parent: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub created_at: u64,
    pub updated_at: u64,
    #[serde(default)]
    pub usage: Usage,
}

impl SnapshotRecord {
    pub(crate) fn info(&self, key: &str) -> Info {
        Info {
            name: key.to_string(),
            parent: self.parent.clone(),
            kind: self.kind,
            labels: self.labels.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

fn child_key(parent: &str, child: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(parent.len() + child.len() + 1);
    key.extend_from_slice(parent.as_bytes());
    key.push(0);
    key.extend_from_slice(child.as_bytes());
    key
}

fn children_prefix(parent: &str) -> Vec<u8> {
    let mut key = parent.as_bytes().to_vec();
    key.push(0);
    key
}

fn validate_labels(labels: &HashMap<String, String>) -> Result<()> {
    for (key, value) in labels {
        if key.is_empty() {
            return Err(Error::invalid_argument("label key must not be empty"));
        }
        if key.len() + value.len() > MAX_LABEL_SIZE {
            return Err(Error::invalid_argument(format!(
                "label key and value length ({} bytes) greater than maximum size ({} bytes), key: {}",
                key.len() + value.len(),
                MAX_LABEL_SIZE,
                key
            )));
        }
    }
    Ok(())
}

pub(crate) fn read_record(txn: &Transaction, key: &str) -> Result<Option<SnapshotRecord>> {
    let cf = txn.column_family(SnapshotterColumns::Snapshots)?;
    let value = if txn.is_writable() {
        txn.inner().get_for_update_cf(cf, key, true)
    } else {
        txn.inner().get_cf(cf, key)
    }
    .with_context(|| format!("failed to read snapshot record {}", key))?;
    value
        .map(|bytes| JsonEncoder::decode(key, &bytes))
        .transpose()
}

fn write_record(txn: &Transaction, key: &str, record: &SnapshotRecord) -> Result<()> {
    let cf = txn.column_family(SnapshotterColumns::Snapshots)?;
    txn.inner()
        .put_cf(cf, key, JsonEncoder::encode(key, record)?)
        .with_context(|| format!("failed to write snapshot record {}", key))?;
    Ok(())
}

fn next_id(txn: &Transaction) -> Result<String> {
    let cf = txn.column_family(SnapshotterColumns::Metadata)?;
    let current = txn
        .inner()
        .get_for_update_cf(cf, SEQUENCE_KEY, true)
        .context("failed to read id sequence")?
        .map(|bytes| JsonEncoder::decode::<u64>(SEQUENCE_KEY, &bytes))
        .transpose()?
        .unwrap_or(0);
    let next = current + 1;
    txn.inner()
        .put_cf(cf, SEQUENCE_KEY, JsonEncoder::encode(SEQUENCE_KEY, &next)?)
        .context("failed to write id sequence")?;
    Ok(next.to_string())
}

fn has_children(txn: &Transaction, key: &str) -> Result<bool> {
    let cf = txn.column_family(SnapshotterColumns::Children)?;
    let prefix = children_prefix(key);
    let mut iter = txn
        .inner()
        .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
    match iter.next() {
        Some(item) => {
            let (child, _) = item.context("failed to scan snapshot children")?;
            Ok(child.starts_with(&prefix))
        }
        None => Ok(false),
    }
}

fn parent_ids(txn: &Transaction, mut parent: String) -> Result<Vec<String>> {
    let mut ids = Vec::new();
    while !parent.is_empty() {
        let record = read_record(txn, &parent)?
            .ok_or_else(|| Error::not_found(format!("ancestor snapshot {}", parent)))?;
        ids.push(record.id);
        parent = record.parent;
    }
    Ok(ids)
}

/// Return the id, info and recorded usage of the snapshot stored under
/// `key`.
pub fn get_info(txn: &Transaction, key: &str) -> Result<(String, Info, Usage)> {
    let record =
        read_record(txn, key)?.ok_or_else(|| Error::not_found(format!("snapshot {}", key)))?;
    Ok((record.id.clone(), record.info(key), record.usage))
}

/// Return the volume level identity of an active or view snapshot.
pub fn get_snapshot(txn: &Transaction, key: &str) -> Result<Snapshot> {
    let record =
        read_record(txn, key)?.ok_or_else(|| Error::not_found(format!("snapshot {}", key)))?;
    if record.kind == Kind::Committed {
        return Err(Error::failed_precondition(format!(
            "requested snapshot {} not active or view",
            key
        )));
    }
    Ok(Snapshot {
        id: record.id,
        kind: record.kind,
        parent_ids: parent_ids(txn, record.parent)?,
    })
}

/// Create a new active or view record under `key`, optionally descending
/// from the committed snapshot `parent`.
pub fn create_snapshot(
    txn: &Transaction,
    kind: Kind,
    key: &str,
    parent: &str,
    labels: HashMap<String, String>,
) -> Result<Snapshot> {
    txn.ensure_writable()?;
    if kind == Kind::Committed {
        return Err(Error::invalid_argument(format!(
            "snapshot kind must be active or view, got {}",
            kind
        )));
    }
    if key.is_empty() {
        return Err(Error::invalid_argument("snapshot key must not be empty"));
    }
    validate_labels(&labels)?;
    if read_record(txn, key)?.is_some() {
        return Err(Error::already_exists(format!("snapshot {}", key)));
    }

    let parent_ids = if parent.is_empty() {
        vec![]
    } else {
        let parent_record = read_record(txn, parent)?
            .ok_or_else(|| Error::not_found(format!("parent snapshot {}", parent)))?;
        if parent_record.kind != Kind::Committed {
            return Err(Error::failed_precondition(format!(
                "parent {} is not committed snapshot",
                parent
            )));
        }
        let mut ids = vec![parent_record.id.clone()];
        ids.extend(parent_ids(txn, parent_record.parent)?);
        ids
    };

    let now = get_epoch_time_in_ns();
    let record = SnapshotRecord {
        id: next_id(txn)?,
        kind,
        parent: parent.to_string(),
        labels,
        created_at: now,
        updated_at: now,
        usage: Usage::default(),
    };
    write_record(txn, key, &record)?;
    if !parent.is_empty() {
        let cf = txn.column_family(SnapshotterColumns::Children)?;
        txn.inner()
            .put_cf(cf, child_key(parent, key), b"")
            .context("failed to index snapshot child")?;
    }
    debug!(key, id = record.id, %kind, parent, "created snapshot record");

    Ok(Snapshot {
        id: record.id,
        kind,
        parent_ids,
    })
}

/// Update the mutable fields of a snapshot. Only `labels` and
/// `labels.<key>` may be named; no field paths replace all labels.
pub fn update_info(txn: &Transaction, info: Info, fieldpaths: &[String]) -> Result<Info> {
    txn.ensure_writable()?;
    let mut record = read_record(txn, &info.name)?
        .ok_or_else(|| Error::not_found(format!("snapshot {}", info.name)))?;

    let replace_all = |record: &mut SnapshotRecord| {
        let size = record.labels.remove(LABEL_VOLUME_SIZE);
        record.labels = info.labels.clone();
        match size {
            Some(size) => {
                record.labels.insert(LABEL_VOLUME_SIZE.to_string(), size);
            }
            None => {
                record.labels.remove(LABEL_VOLUME_SIZE);
            }
        }
    };

    if fieldpaths.is_empty() {
        replace_all(&mut record);
    }
    for path in fieldpaths {
        if let Some(label) = path.strip_prefix("labels.") {
            if label == LABEL_VOLUME_SIZE {
                return Err(Error::invalid_argument(format!(
                    "cannot update immutable label {} on snapshot {}",
                    label, info.name
                )));
            }
            match info.labels.get(label) {
                Some(value) => {
                    record.labels.insert(label.to_string(), value.clone());
                }
                None => {
                    record.labels.remove(label);
                }
            }
            continue;
        }
        match path.as_str() {
            "labels" => replace_all(&mut record),
            _ => {
                return Err(Error::invalid_argument(format!(
                    "cannot update {:?} field on snapshot {:?}",
                    path, info.name
                )))
            }
        }
    }
    validate_labels(&record.labels)?;
    record.updated_at = get_epoch_time_in_ns();
    write_record(txn, &info.name, &record)?;
    Ok(record.info(&info.name))
}

/// Turn the active snapshot `key` into the committed snapshot `name`. The
/// id is preserved and the labels of the committed record are exactly
/// `labels`.
pub fn commit_active(
    txn: &Transaction,
    key: &str,
    name: &str,
    usage: Usage,
    labels: HashMap<String, String>,
) -> Result<String> {
    txn.ensure_writable()?;
    if name.is_empty() {
        return Err(Error::invalid_argument("committed snapshot name must not be empty"));
    }
    validate_labels(&labels)?;
    if read_record(txn, name)?.is_some() {
        return Err(Error::already_exists(format!("committed snapshot {}", name)));
    }
    let active = read_record(txn, key)?
        .ok_or_else(|| Error::not_found(format!("active snapshot {}", key)))?;
    if active.kind != Kind::Active {
        return Err(Error::failed_precondition(format!(
            "snapshot {} is not active",
            key
        )));
    }

    let now = get_epoch_time_in_ns();
    let committed = SnapshotRecord {
        id: active.id.clone(),
        kind: Kind::Committed,
        parent: active.parent.clone(),
        labels,
        created_at: now,
        updated_at: now,
        usage,
    };
    write_record(txn, name, &committed)?;

    let cf = txn.column_family(SnapshotterColumns::Snapshots)?;
    txn.inner()
        .delete_cf(cf, key)
        .with_context(|| format!("failed to delete active snapshot record {}", key))?;
    if !active.parent.is_empty() {
        let cf = txn.column_family(SnapshotterColumns::Children)?;
        txn.inner()
            .delete_cf(cf, child_key(&active.parent, key))
            .context("failed to unindex snapshot child")?;
        txn.inner()
            .put_cf(cf, child_key(&active.parent, name), b"")
            .context("failed to index snapshot child")?;
    }
    debug!(key, name, id = committed.id, "committed snapshot record");
    Ok(committed.id)
}

/// Remove the record stored under `key`, returning its id and kind.
pub fn remove(txn: &Transaction, key: &str) -> Result<(String, Kind)> {
    txn.ensure_writable()?;
    let record =
        read_record(txn, key)?.ok_or_else(|| Error::not_found(format!("snapshot {}", key)))?;
    if has_children(txn, key)? {
        return Err(Error::failed_precondition(format!(
            "cannot remove snapshot {} with child",
            key
        )));
    }

    let cf = txn.column_family(SnapshotterColumns::Snapshots)?;
    txn.inner()
        .delete_cf(cf, key)
        .with_context(|| format!("failed to delete snapshot record {}", key))?;
    if !record.parent.is_empty() {
        let cf = txn.column_family(SnapshotterColumns::Children)?;
        txn.inner()
            .delete_cf(cf, child_key(&record.parent, key))
            .context("failed to unindex snapshot child")?;
    }
    debug!(key, id = record.id, kind = %record.kind, "removed snapshot record");
    Ok((record.id, record.kind))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_state_store::TestStateStore;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_create_and_get_info() -> Result<()> {
        let store = TestStateStore::new()?;
        let txn = store.meta_store.transaction(true).await;
        let snap = create_snapshot(&txn, Kind::Active, "a", "", labels(&[("x", "1")]))?;
        assert_eq!(snap.id, "1");
        assert!(snap.parent_ids.is_empty());
        txn.commit()?;

        let txn = store.meta_store.transaction(false).await;
        let (id, info, usage) = get_info(&txn, "a")?;
        assert_eq!(id, "1");
        assert_eq!(info.kind, Kind::Active);
        assert_eq!(info.parent, "");
        assert_eq!(info.labels.get("x").map(String::as_str), Some("1"));
        assert_eq!(usage, Usage::default());
        assert!(get_info(&txn, "missing").unwrap_err().is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_key_and_parent_checks() -> Result<()> {
        let store = TestStateStore::new()?;
        let txn = store.meta_store.transaction(true).await;
        create_snapshot(&txn, Kind::Active, "a", "", HashMap::new())?;
        assert!(create_snapshot(&txn, Kind::View, "a", "", HashMap::new())
            .unwrap_err()
            .is_already_exists());
        assert!(create_snapshot(&txn, Kind::Active, "b", "missing", HashMap::new())
            .unwrap_err()
            .is_not_found());
        assert!(create_snapshot(&txn, Kind::Active, "b", "a", HashMap::new())
            .unwrap_err()
            .is_failed_precondition());
        assert!(create_snapshot(&txn, Kind::Active, "", "", HashMap::new())
            .unwrap_err()
            .is_invalid_argument());
        Ok(())
    }

    #[tokio::test]
    async fn test_commit_active_keeps_id_and_chain() -> Result<()> {
        let store = TestStateStore::new()?;
        let txn = store.meta_store.transaction(true).await;
        create_snapshot(&txn, Kind::Active, "a", "", labels(&[(LABEL_VOLUME_SIZE, "10")]))?;
        let usage = Usage {
            size: 42,
            inodes: -1,
        };
        let id = commit_active(&txn, "a", "base", usage, labels(&[(LABEL_VOLUME_SIZE, "10")]))?;
        assert_eq!(id, "1");
        assert!(get_info(&txn, "a").unwrap_err().is_not_found());
        let (_, info, recorded) = get_info(&txn, "base")?;
        assert_eq!(info.kind, Kind::Committed);
        assert_eq!(recorded, usage);

        let child = create_snapshot(&txn, Kind::Active, "b", "base", HashMap::new())?;
        assert_eq!(child.parent_ids, vec!["1".to_string()]);
        let id = commit_active(&txn, "b", "layer2", Usage::default(), HashMap::new())?;
        let grandchild = create_snapshot(&txn, Kind::View, "c", "layer2", HashMap::new())?;
        assert_eq!(grandchild.parent_ids, vec![id, "1".to_string()]);

        let snap = get_snapshot(&txn, "c")?;
        assert_eq!(snap.kind, Kind::View);
        assert!(get_snapshot(&txn, "base").unwrap_err().is_failed_precondition());
        Ok(())
    }

    #[tokio::test]
    async fn test_commit_active_errors() -> Result<()> {
        let store = TestStateStore::new()?;
        let txn = store.meta_store.transaction(true).await;
        create_snapshot(&txn, Kind::Active, "a", "", HashMap::new())?;
        create_snapshot(&txn, Kind::View, "v", "", HashMap::new())?;
        assert!(commit_active(&txn, "missing", "n", Usage::default(), HashMap::new())
            .unwrap_err()
            .is_not_found());
        assert!(commit_active(&txn, "v", "n", Usage::default(), HashMap::new())
            .unwrap_err()
            .is_failed_precondition());
        assert!(commit_active(&txn, "a", "v", Usage::default(), HashMap::new())
            .unwrap_err()
            .is_already_exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_requires_no_children() -> Result<()> {
        let store = TestStateStore::new()?;
        let txn = store.meta_store.transaction(true).await;
        create_snapshot(&txn, Kind::Active, "a", "", HashMap::new())?;
        commit_active(&txn, "a", "base", Usage::default(), HashMap::new())?;
        create_snapshot(&txn, Kind::Active, "b", "base", HashMap::new())?;
        create_snapshot(&txn, Kind::View, "c", "base", HashMap::new())?;

        assert!(remove(&txn, "base").unwrap_err().is_failed_precondition());
        assert_eq!(remove(&txn, "b")?.1, Kind::Active);
        assert!(remove(&txn, "base").unwrap_err().is_failed_precondition());
        assert_eq!(remove(&txn, "c")?.1, Kind::View);
        assert_eq!(remove(&txn, "base")?, ("1".to_string(), Kind::Committed));
        assert!(remove(&txn, "base").unwrap_err().is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn test_update_info() -> Result<()> {
        let store = TestStateStore::new()?;
        let txn = store.meta_store.transaction(true).await;
        create_snapshot(
            &txn,
            Kind::Active,
            "a",
            "",
            labels(&[(LABEL_VOLUME_SIZE, "10"), ("keep", "1"), ("drop", "2")]),
        )?;
        let (_, mut info, _) = get_info(&txn, "a")?;

        info.labels = labels(&[("keep", "changed"), ("new", "3")]);
        let updated = update_info(&txn, info.clone(), &["labels.keep".to_string()])?;
        assert_eq!(updated.labels.get("keep").map(String::as_str), Some("changed"));
        assert!(updated.labels.get("new").is_none());
        assert!(updated.labels.contains_key("drop"));

        let updated = update_info(&txn, info.clone(), &["labels.drop".to_string()])?;
        assert!(!updated.labels.contains_key("drop"));

        let updated = update_info(&txn, info.clone(), &[])?;
        assert_eq!(updated.labels.len(), 3);
        assert_eq!(updated.volume_size_label(), Some("10"));

        assert!(update_info(&txn, info.clone(), &["parent".to_string()])
            .unwrap_err()
            .is_invalid_argument());
        let size_path = format!("labels.{}", LABEL_VOLUME_SIZE);
        assert!(update_info(&txn, info.clone(), &[size_path])
            .unwrap_err()
            .is_invalid_argument());

        info.name = "missing".to_string();
        assert!(update_info(&txn, info, &[]).unwrap_err().is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn test_rollback_discards_changes() -> Result<()> {
        let store = TestStateStore::new()?;
        {
            let txn = store.meta_store.transaction(true).await;
            create_snapshot(&txn, Kind::Active, "a", "", HashMap::new())?;
            txn.rollback()?;
        }
        {
            let txn = store.meta_store.transaction(true).await;
            create_snapshot(&txn, Kind::Active, "b", "", HashMap::new())?;
            // dropped without commit
        }
        let txn = store.meta_store.transaction(false).await;
        assert!(get_info(&txn, "a").unwrap_err().is_not_found());
        assert!(get_info(&txn, "b").unwrap_err().is_not_found());
        Ok(())
    }
}
