//! In-memory collaborators for exercising the lifecycle manager without
//! ZFS or root privileges.

use std::{
    collections::{BTreeMap, HashSet},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tempfile::TempDir;
use zvol_utils::byte_size::GIB;

use crate::{
    backend::{snapshot_name, Dataset, DestroyMode, VolumeBackend},
    fs::{FsInitializer, FsType},
    DeviceWaitConfig,
    Snapshotter,
    SnapshotterConfig,
};

pub const TEST_DATASET: &str = "tank/containerd";

#[derive(Debug, Clone)]
struct FakeDataset {
    dataset: Dataset,
    properties: BTreeMap<String, String>,
    /// Snapshot this dataset was cloned from.
    origin: Option<String>,
    deferred_destroy: bool,
}

#[derive(Debug, Default)]
struct FakeState {
    datasets: BTreeMap<String, FakeDataset>,
    calls: Vec<String>,
    failures: HashSet<String>,
}

/// A [`VolumeBackend`] that keeps datasets in memory and materializes
/// device nodes as plain files below a temporary directory.
pub struct FakeVolumeBackend {
    state: Mutex<FakeState>,
    device_root: TempDir,
    create_devices: bool,
}

impl FakeVolumeBackend {
    pub fn new(pool: &str) -> Result<Self> {
        let backend = Self {
            state: Mutex::new(FakeState::default()),
            device_root: tempfile::tempdir().context("failed to create device root")?,
            create_devices: true,
        };
        backend.insert(pool, 0, None);
        Ok(backend)
    }

    /// Never create device nodes, so every device wait times out.
    pub fn without_devices(mut self) -> Self {
        self.create_devices = false;
        self
    }

    /// Make every later call of `operation` (`create`, `clone`, `set`,
    /// `snapshot`, `destroy`, `get`) fail.
    pub fn fail_on(&self, operation: &str) {
        self.lock().failures.insert(operation.to_string());
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    pub fn set_used(&self, name: &str, used: u64) {
        if let Some(dataset) = self.lock().datasets.get_mut(name) {
            dataset.dataset.used = used;
        }
    }

    pub fn exists(&self, name: &str) -> bool {
        self.lock().datasets.contains_key(name)
    }

    pub fn dataset(&self, name: &str) -> Option<Dataset> {
        self.lock().datasets.get(name).map(|d| d.dataset.clone())
    }

    pub fn property(&self, name: &str, key: &str) -> Option<String> {
        self.lock()
            .datasets
            .get(name)
            .and_then(|d| d.properties.get(key).cloned())
    }

    /// Names of every dataset below the pool, in order.
    pub fn datasets(&self) -> Vec<String> {
        self.lock().datasets.keys().cloned().collect()
    }

    /// Every call made so far, formatted as `operation name`. Deferred
    /// destroys are logged as `destroy -d name`.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn begin(&self, operation: &str, name: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(format!("{} {}", operation, name));
        if state.failures.contains(operation) {
            bail!("injected {} failure for {}", operation, name);
        }
        Ok(())
    }

    fn insert(&self, name: &str, volsize: u64, origin: Option<String>) -> Dataset {
        let dataset = Dataset {
            name: name.to_string(),
            used: 0,
            volsize,
        };
        self.lock().datasets.insert(
            name.to_string(),
            FakeDataset {
                dataset: dataset.clone(),
                properties: BTreeMap::new(),
                origin,
                deferred_destroy: false,
            },
        );
        dataset
    }

    fn set_properties(&self, name: &str, properties: &[(&str, &str)]) {
        if let Some(dataset) = self.lock().datasets.get_mut(name) {
            for (key, value) in properties {
                dataset.properties.insert(key.to_string(), value.to_string());
            }
        }
    }

    fn create_device(&self, name: &str) -> Result<()> {
        if !self.create_devices {
            return Ok(());
        }
        let device = self.device_path(name);
        if let Some(parent) = device.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&device, b"")?;
        Ok(())
    }

    fn remove_device(&self, name: &str) {
        let _ = std::fs::remove_file(self.device_path(name));
    }

    /// Drop `snapshot` if it was marked for deferred deletion and its last
    /// clone is gone.
    fn reap_deferred(state: &mut FakeState, snapshot: &str) {
        let has_clones = state
            .datasets
            .values()
            .any(|d| d.origin.as_deref() == Some(snapshot));
        let deferred = state
            .datasets
            .get(snapshot)
            .is_some_and(|d| d.deferred_destroy);
        if deferred && !has_clones {
            state.datasets.remove(snapshot);
        }
    }
}

#[async_trait]
impl VolumeBackend for FakeVolumeBackend {
    async fn get(&self, name: &str) -> Result<Dataset> {
        self.begin("get", name)?;
        self.dataset(name)
            .ok_or_else(|| anyhow!("cannot open '{}': dataset does not exist", name))
    }

    async fn create_volume(
        &self,
        name: &str,
        size: u64,
        properties: &[(&str, &str)],
    ) -> Result<Dataset> {
        self.begin("create", name)?;
        if self.exists(name) {
            bail!("cannot create '{}': dataset already exists", name);
        }
        let dataset = self.insert(name, size, None);
        self.set_properties(name, properties);
        self.create_device(name)?;
        Ok(dataset)
    }

    async fn clone_snapshot(
        &self,
        snapshot: &str,
        target: &str,
        properties: &[(&str, &str)],
    ) -> Result<Dataset> {
        self.begin("clone", target)?;
        let origin = self
            .dataset(snapshot)
            .ok_or_else(|| anyhow!("cannot open '{}': dataset does not exist", snapshot))?;
        if self.exists(target) {
            bail!("cannot create '{}': dataset already exists", target);
        }
        let dataset = self.insert(target, origin.volsize, Some(snapshot.to_string()));
        self.set_properties(target, properties);
        self.create_device(target)?;
        Ok(dataset)
    }

    async fn set_property(&self, name: &str, key: &str, value: &str) -> Result<()> {
        self.begin("set", name)?;
        let mut state = self.lock();
        let dataset = state
            .datasets
            .get_mut(name)
            .ok_or_else(|| anyhow!("cannot open '{}': dataset does not exist", name))?;
        if key == "volsize" {
            dataset.dataset.volsize = value.parse().context("bad volsize")?;
        }
        dataset.properties.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn snapshot(&self, name: &str, suffix: &str) -> Result<Dataset> {
        let snapshot = snapshot_name(name, suffix);
        self.begin("snapshot", &snapshot)?;
        let volume = self
            .dataset(name)
            .ok_or_else(|| anyhow!("cannot open '{}': dataset does not exist", name))?;
        if self.exists(&snapshot) {
            bail!("cannot create snapshot '{}': dataset already exists", snapshot);
        }
        Ok(self.insert(&snapshot, volume.volsize, None))
    }

    async fn destroy(&self, name: &str, mode: DestroyMode) -> Result<()> {
        match mode {
            DestroyMode::Default => self.begin("destroy", name)?,
            DestroyMode::DeferDeletion => self.begin("destroy", &format!("-d {}", name))?,
        }
        let mut state = self.lock();
        let Some(dataset) = state.datasets.get(name).cloned() else {
            bail!("cannot destroy '{}': dataset does not exist", name);
        };
        let has_clones = state
            .datasets
            .values()
            .any(|d| d.origin.as_deref() == Some(name));
        if has_clones {
            if mode == DestroyMode::DeferDeletion {
                if let Some(d) = state.datasets.get_mut(name) {
                    d.deferred_destroy = true;
                }
                return Ok(());
            }
            bail!("cannot destroy '{}': filesystem has dependent clones", name);
        }
        let snapshot_prefix = format!("{}@", name);
        if state
            .datasets
            .keys()
            .any(|k| k.starts_with(&snapshot_prefix))
        {
            bail!("cannot destroy '{}': volume has children", name);
        }
        state.datasets.remove(name);
        if let Some(origin) = dataset.origin {
            Self::reap_deferred(&mut state, &origin);
        }
        drop(state);
        self.remove_device(name);
        Ok(())
    }

    fn device_path(&self, name: &str) -> PathBuf {
        self.device_root.path().join(name)
    }
}

/// An [`FsInitializer`] that records what it was asked to do.
#[derive(Default)]
pub struct FakeFsInitializer {
    formatted: Mutex<Vec<PathBuf>>,
    cleaned: Mutex<Vec<PathBuf>>,
    fail_format: Mutex<bool>,
}

impl FakeFsInitializer {
    pub fn fail_format(&self, fail: bool) {
        *self.fail_format.lock().unwrap_or_else(|e| e.into_inner()) = fail;
    }

    pub fn formatted(&self) -> Vec<PathBuf> {
        self.formatted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn cleaned(&self) -> Vec<PathBuf> {
        self.cleaned.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl FsInitializer for FakeFsInitializer {
    async fn format(&self, fs_type: FsType, device: &Path) -> Result<()> {
        if *self.fail_format.lock().unwrap_or_else(|e| e.into_inner()) {
            bail!(
                "{} failed to initialize {}: injected failure",
                fs_type.mkfs_command(),
                device.display()
            );
        }
        self.formatted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(device.to_path_buf());
        Ok(())
    }

    async fn remove_default_dirs(&self, _fs_type: FsType, device: &Path) -> Result<()> {
        self.cleaned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(device.to_path_buf());
        Ok(())
    }
}

/// A [`Snapshotter`] wired to fakes, with its root in a temporary directory.
pub struct TestSnapshotter {
    pub snapshotter: Snapshotter,
    pub backend: Arc<FakeVolumeBackend>,
    pub fs: Arc<FakeFsInitializer>,
    pub root: TempDir,
}

impl TestSnapshotter {
    pub async fn new() -> Result<Self> {
        Self::with_backend(FakeVolumeBackend::new(TEST_DATASET)?).await
    }

    pub async fn with_backend(backend: FakeVolumeBackend) -> Result<Self> {
        let root = tempfile::tempdir()?;
        let config = SnapshotterConfig {
            root_path: root.path().join("root"),
            dataset: TEST_DATASET.to_string(),
            volume_size: 20 * GIB,
            fs_type: FsType::Ext4,
            device_wait: DeviceWaitConfig {
                poll_interval: std::time::Duration::from_millis(1),
                timeout: std::time::Duration::from_millis(50),
            },
        };
        let backend = Arc::new(backend);
        let fs = Arc::new(FakeFsInitializer::default());
        let snapshotter = Snapshotter::new(config, backend.clone(), fs.clone()).await?;
        Ok(Self {
            snapshotter,
            backend,
            fs,
            root,
        })
    }

    pub fn volume(&self, id: &str) -> String {
        format!("{}/{}", TEST_DATASET, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deferred_destroy_waits_for_clones() -> Result<()> {
        let backend = FakeVolumeBackend::new(TEST_DATASET)?;
        let volume = format!("{}/1", TEST_DATASET);
        let clone = format!("{}/2", TEST_DATASET);
        backend.create_volume(&volume, GIB, &[]).await?;
        let snapshot = backend.snapshot(&volume, "snapshot").await?.name;
        backend.clone_snapshot(&snapshot, &clone, &[]).await?;

        assert!(backend.destroy(&snapshot, DestroyMode::Default).await.is_err());
        backend.destroy(&snapshot, DestroyMode::DeferDeletion).await?;
        assert!(backend.exists(&snapshot));
        assert!(backend.destroy(&volume, DestroyMode::Default).await.is_err());

        backend.destroy(&clone, DestroyMode::Default).await?;
        assert!(!backend.exists(&snapshot));
        backend.destroy(&volume, DestroyMode::Default).await?;
        assert_eq!(backend.datasets(), vec![TEST_DATASET.to_string()]);

        let calls = backend.calls();
        assert!(calls.contains(&format!("destroy {}", snapshot)));
        assert!(calls.contains(&format!("destroy -d {}", snapshot)));
        Ok(())
    }

    #[tokio::test]
    async fn test_deferred_destroy_without_clones_is_immediate() -> Result<()> {
        let backend = FakeVolumeBackend::new(TEST_DATASET)?;
        let volume = format!("{}/1", TEST_DATASET);
        backend.create_volume(&volume, GIB, &[]).await?;
        let snapshot = backend.snapshot(&volume, "snapshot").await?.name;

        backend.destroy(&snapshot, DestroyMode::DeferDeletion).await?;
        assert!(!backend.exists(&snapshot));
        Ok(())
    }
}
