//! Snapshot lifecycle manager.
//!
//! [`Snapshotter`] turns containerd snapshot requests into ZFS volume
//! operations. Every mutating operation runs inside one writable ledger
//! transaction, and the physical work happens while that transaction is
//! held, so the ledger only commits once the volume side succeeded.

use std::{
    collections::HashMap,
    fs::DirBuilder,
    os::unix::fs::DirBuilderExt,
    path::PathBuf,
    sync::Arc,
};

use anyhow::Context;
use data_model::{
    error::ResultExt,
    filter::SnapshotFilter,
    Error,
    Info,
    Kind,
    MountDescriptor,
    Result,
    Usage,
    LABEL_VOLUME_SIZE,
    MAX_SNAPSHOT_SIZE,
    UNKNOWN_INODES,
};
use metrics::{snapshotter_stats, AutoIncrement, Timer};
use opentelemetry::KeyValue;
use state_store::{scanner, state_machine, MetaStore};
use tokio::sync::{RwLock, RwLockReadGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod backend;
pub mod device;
pub mod fs;
mod provision;
pub mod size;
pub mod testing;

use backend::{snapshot_name, DestroyMode, VolumeBackend, PROPERTY_VOLMODE};
pub use device::DeviceWaitConfig;
use fs::{FsInitializer, FsType};

/// Suffix of the frozen snapshot every committed volume owns.
pub const SNAPSHOT_SUFFIX: &str = "snapshot";

pub const METADATA_DB: &str = "metadata.db";

#[derive(Debug, Clone)]
pub struct SnapshotterConfig {
    pub root_path: PathBuf,
    pub dataset: String,
    pub volume_size: u64,
    pub fs_type: FsType,
    pub device_wait: DeviceWaitConfig,
}

pub struct Snapshotter {
    config: SnapshotterConfig,
    store: RwLock<Option<MetaStore>>,
    backend: Arc<dyn VolumeBackend>,
    fs: Arc<dyn FsInitializer>,
    metrics: snapshotter_stats::Metrics,
}

impl Snapshotter {
    /// Check that the pool dataset exists, create the root directory and
    /// open the ledger below it.
    pub async fn new(
        config: SnapshotterConfig,
        backend: Arc<dyn VolumeBackend>,
        fs: Arc<dyn FsInitializer>,
    ) -> Result<Self> {
        backend
            .get(&config.dataset)
            .await
            .with_context(|| format!("failed to look up dataset {}", config.dataset))?;

        DirBuilder::new()
            .recursive(true)
            .mode(0o750)
            .create(&config.root_path)
            .with_context(|| {
                format!(
                    "failed to create root directory: {}",
                    config.root_path.display()
                )
            })?;

        let store = MetaStore::open(&config.root_path.join(METADATA_DB))?;
        info!(
            dataset = config.dataset,
            root = %config.root_path.display(),
            fs_type = %config.fs_type,
            "snapshotter ready"
        );
        Ok(Self {
            config,
            store: RwLock::new(Some(store)),
            backend,
            fs,
            metrics: snapshotter_stats::Metrics::new(),
        })
    }

    pub fn config(&self) -> &SnapshotterConfig {
        &self.config
    }

    async fn store(&self) -> Result<RwLockReadGuard<'_, MetaStore>> {
        RwLockReadGuard::try_map(self.store.read().await, |store| store.as_ref())
            .map_err(|_| Error::failed_precondition("snapshotter is closed"))
    }

    fn volume_name(&self, id: &str) -> String {
        format!("{}/{}", self.config.dataset, id)
    }

    fn record_outcome<T>(&self, op: &'static str, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.metrics
                .operation_errors
                .increment(&[KeyValue::new("op", op)]);
            debug!(op, error = %err, "snapshot operation failed");
        }
        result
    }

    /// Info of the snapshot stored under `key`.
    pub async fn stat(&self, key: &str) -> Result<Info> {
        let labels = [KeyValue::new("op", "stat")];
        let _timer = Timer::start_with_labels(&self.metrics.operations, &labels);
        debug!(key, "stat");

        let result: Result<Info> = async {
            let store = self.store().await?;
            let txn = store.transaction(false).await;
            let (_, info, _) = state_machine::get_info(&txn, key)?;
            Ok(info)
        }
        .await;
        self.record_outcome("stat", result)
    }

    /// Update the labels of a snapshot. See [`state_machine::update_info`].
    pub async fn update(&self, info: Info, fieldpaths: &[String]) -> Result<Info> {
        let labels = [KeyValue::new("op", "update")];
        let _timer = Timer::start_with_labels(&self.metrics.operations, &labels);
        debug!(key = info.name, fieldpaths = fieldpaths.join(", "), "update");

        let result: Result<Info> = async {
            let store = self.store().await?;
            let txn = store.transaction(true).await;
            let info = state_machine::update_info(&txn, info, fieldpaths)?;
            txn.commit()?;
            Ok(info)
        }
        .await;
        self.record_outcome("update", result)
    }

    /// Space consumed by a snapshot, excluding its parents.
    pub async fn usage(&self, key: &str) -> Result<Usage> {
        let labels = [KeyValue::new("op", "usage")];
        let _timer = Timer::start_with_labels(&self.metrics.operations, &labels);
        debug!(key, "usage");

        let result: Result<Usage> = async {
            let (id, info, usage) = {
                let store = self.store().await?;
                let txn = store.transaction(false).await;
                state_machine::get_info(&txn, key)?
            };
            match info.kind {
                Kind::Active => self.volume_usage(&id).await,
                _ => Ok(usage),
            }
        }
        .await;
        self.record_outcome("usage", result)
    }

    /// Live usage of the volume behind snapshot `id`.
    async fn volume_usage(&self, id: &str) -> Result<Usage> {
        let volume = self.volume_name(id);
        let dataset = self.backend.get(&volume).await?;
        if dataset.used > MAX_SNAPSHOT_SIZE {
            return Err(Error::resource_exhausted(format!(
                "dataset size exceeds maximum snapshot size of {} bytes",
                MAX_SNAPSHOT_SIZE
            )));
        }
        Ok(Usage {
            size: dataset.used as i64,
            inodes: UNKNOWN_INODES,
        })
    }

    /// Mounts of an active or view snapshot, for recovering what Prepare or
    /// View returned.
    pub async fn mounts(&self, key: &str) -> Result<Vec<MountDescriptor>> {
        let labels = [KeyValue::new("op", "mounts")];
        let _timer = Timer::start_with_labels(&self.metrics.operations, &labels);
        debug!(key, "mounts");

        let result: Result<Vec<MountDescriptor>> = async {
            let store = self.store().await?;
            let txn = store.transaction(false).await;
            let snapshot = state_machine::get_snapshot(&txn, key)?;
            let volume = self.volume_name(&snapshot.id);
            self.backend.get(&volume).await?;
            Ok(vec![self.mount_descriptor(&volume, snapshot.kind)])
        }
        .await;
        self.record_outcome("mounts", result)
    }

    fn mount_descriptor(&self, volume: &str, kind: Kind) -> MountDescriptor {
        MountDescriptor::new(
            self.config.fs_type.as_ref(),
            self.backend.device_path(volume).to_string_lossy(),
            kind == Kind::View,
        )
    }

    /// Create an active snapshot descending from the committed `parent`, or
    /// from an empty filesystem when `parent` is empty.
    pub async fn prepare(
        &self,
        key: &str,
        parent: &str,
        labels: HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<Vec<MountDescriptor>> {
        let op_labels = [KeyValue::new("op", "prepare")];
        let _timer = Timer::start_with_labels(&self.metrics.operations, &op_labels);
        debug!(key, parent, "prepare");

        let result = self
            .create_snapshot(Kind::Active, key, parent, labels, cancel)
            .await;
        self.record_outcome("prepare", result)
    }

    /// Like [`Snapshotter::prepare`] but the returned mount is read-only and
    /// the snapshot can never be committed.
    pub async fn view(
        &self,
        key: &str,
        parent: &str,
        labels: HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<Vec<MountDescriptor>> {
        let op_labels = [KeyValue::new("op", "view")];
        let _timer = Timer::start_with_labels(&self.metrics.operations, &op_labels);
        debug!(key, parent, "view");

        let result = self
            .create_snapshot(Kind::View, key, parent, labels, cancel)
            .await;
        self.record_outcome("view", result)
    }

    async fn create_snapshot(
        &self,
        kind: Kind,
        key: &str,
        parent: &str,
        mut labels: HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<Vec<MountDescriptor>> {
        let store = self.store().await?;
        let txn = store.transaction(true).await;

        let parent_info = if parent.is_empty() {
            None
        } else {
            let (_, info, _) = state_machine::get_info(&txn, parent)
                .op_context(format!("failed to read parent of {}", key))?;
            Some(info)
        };
        let size =
            size::resolve_volume_size(self.config.volume_size, key, parent_info.as_ref(), &labels)?;
        labels.insert(LABEL_VOLUME_SIZE.to_string(), size.to_string());

        let snapshot = state_machine::create_snapshot(&txn, kind, key, parent, labels)?;
        let volume = self.provision_volume(&snapshot, size, cancel).await?;

        if let Err(err) = txn.commit() {
            self.destroy_after_failure(&volume).await;
            return Err(err.context(format!("failed to record snapshot {}", key)));
        }
        info!(key, parent, id = snapshot.id, %kind, "snapshot created");
        Ok(vec![self.mount_descriptor(&volume, kind)])
    }

    /// Freeze the active snapshot `key` into the committed snapshot `name`.
    pub async fn commit(
        &self,
        name: &str,
        key: &str,
        labels: HashMap<String, String>,
    ) -> Result<()> {
        let op_labels = [KeyValue::new("op", "commit")];
        let _timer = Timer::start_with_labels(&self.metrics.operations, &op_labels);
        debug!(name, key, "commit");

        let result = self.commit_in(name, key, labels).await;
        self.record_outcome("commit", result)
    }

    async fn commit_in(
        &self,
        name: &str,
        key: &str,
        mut labels: HashMap<String, String>,
    ) -> Result<()> {
        let store = self.store().await?;
        let txn = store.transaction(true).await;

        let (id, info, recorded) = state_machine::get_info(&txn, key)?;
        let usage = match info.kind {
            Kind::Active => self.volume_usage(&id).await?,
            _ => recorded,
        };
        if let Some(size) = info.volume_size_label() {
            labels.insert(LABEL_VOLUME_SIZE.to_string(), size.to_string());
        }
        let id = state_machine::commit_active(&txn, key, name, usage, labels)?;

        let volume = self.volume_name(&id);
        self.backend
            .snapshot(&volume, SNAPSHOT_SUFFIX)
            .await
            .with_context(|| format!("failed to snapshot volume {}", volume))?;

        // The committed volume is only ever cloned from here on, so it is
        // hidden from the host.
        if let Err(err) = self
            .backend
            .set_property(&volume, PROPERTY_VOLMODE, "none")
            .await
        {
            self.undo_freeze(&volume, false).await;
            return Err(Error::from(err).context(format!("failed to hide volume {}", volume)));
        }
        if let Err(err) = txn.commit() {
            self.undo_freeze(&volume, true).await;
            return Err(err.context(format!("failed to record commit of {}", key)));
        }
        info!(name, key, id, "snapshot committed");
        Ok(())
    }

    /// Compensate a failed commit: drop the frozen snapshot and expose the
    /// volume again. Failures are logged and leave the original error
    /// authoritative.
    async fn undo_freeze(&self, volume: &str, restore_volmode: bool) {
        let snapshot = snapshot_name(volume, SNAPSHOT_SUFFIX);
        if let Err(e) = self.backend.destroy(&snapshot, DestroyMode::Default).await {
            warn!(snapshot, error = ?e, "failed to destroy snapshot of failed commit");
        }
        if restore_volmode {
            if let Err(e) = self
                .backend
                .set_property(volume, PROPERTY_VOLMODE, "full")
                .await
            {
                warn!(volume, error = ?e, "failed to restore volmode of failed commit");
            }
        }
    }

    /// Remove a snapshot and its volume. Committed snapshots with children
    /// cannot be removed.
    pub async fn remove(&self, key: &str) -> Result<()> {
        let op_labels = [KeyValue::new("op", "remove")];
        let _timer = Timer::start_with_labels(&self.metrics.operations, &op_labels);
        debug!(key, "remove");

        let result: Result<()> = async {
            let store = self.store().await?;
            let txn = store.transaction(true).await;

            let (id, kind) = state_machine::remove(&txn, key)
                .op_context("failed to remove snapshot")?;
            let volume = self.volume_name(&id);
            if kind == Kind::Committed {
                let snapshot = snapshot_name(&volume, SNAPSHOT_SUFFIX);
                self.backend
                    .destroy(&snapshot, DestroyMode::DeferDeletion)
                    .await
                    .with_context(|| format!("failed to destroy snapshot {}", snapshot))?;
            }
            self.backend
                .destroy(&volume, DestroyMode::Default)
                .await
                .with_context(|| format!("failed to destroy volume {}", volume))?;
            txn.commit()?;
            info!(key, id, %kind, "snapshot removed");
            Ok(())
        }
        .await;
        self.record_outcome("remove", result)
    }

    /// Call `visit` for every snapshot matching any of `filters`. No filters
    /// match everything.
    pub async fn walk<S, F>(&self, filters: &[S], visit: F) -> Result<()>
    where
        S: AsRef<str>,
        F: FnMut(&Info) -> Result<()>,
    {
        let op_labels = [KeyValue::new("op", "walk")];
        let _timer = Timer::start_with_labels(&self.metrics.operations, &op_labels);
        debug!("walk");

        let result: Result<()> = async {
            let filter = SnapshotFilter::parse(filters)?;
            let store = self.store().await?;
            let txn = store.transaction(false).await;
            scanner::walk(&txn, &filter, visit)
        }
        .await;
        self.record_outcome("walk", result)
    }

    /// Release the ledger. Closing twice is not an error; every other
    /// operation fails once closed.
    pub async fn close(&self) -> Result<()> {
        let mut store = self.store.write().await;
        if let Some(store) = store.take() {
            info!(path = %store.path().display(), "closing metadata store");
        }
        Ok(())
    }
}
