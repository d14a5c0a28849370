use std::path::Path;

use anyhow::Context;
use data_model::{Result, Snapshot};
use metrics::Timer;
use opentelemetry::KeyValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    backend::{snapshot_name, DestroyMode, CREATE_VOLUME_PROPERTIES, PROPERTY_VOLSIZE},
    device::wait_for_device,
    Snapshotter,
    SNAPSHOT_SUFFIX,
};

impl Snapshotter {
    /// Create the volume backing `snapshot` and return its name.
    ///
    /// Root snapshots get a fresh, formatted volume. Children are clones of
    /// their parent's frozen snapshot, grown to `size` when it differs. A
    /// volume that cannot be made usable is destroyed before the error is
    /// returned.
    pub(crate) async fn provision_volume(
        &self,
        snapshot: &Snapshot,
        size: u64,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let volume = self.volume_name(&snapshot.id);
        match snapshot.parent_ids.first() {
            None => self.create_volume(&volume, size, cancel).await?,
            Some(parent_id) => self.clone_volume(parent_id, &volume, size, cancel).await?,
        }
        Ok(volume)
    }

    async fn create_volume(
        &self,
        volume: &str,
        size: u64,
        cancel: &CancellationToken,
    ) -> Result<()> {
        debug!(volume, size, "creating volume");
        self.backend
            .create_volume(volume, size, CREATE_VOLUME_PROPERTIES)
            .await
            .with_context(|| format!("failed to create volume {}", volume))?;

        let device = self.backend.device_path(volume);
        if let Err(err) = self.initialize_filesystem(&device, cancel).await {
            self.destroy_after_failure(volume).await;
            return Err(err.context(format!("failed to initialize volume {}", volume)));
        }

        if let Err(e) = self
            .fs
            .remove_default_dirs(self.config.fs_type, &device)
            .await
        {
            warn!(volume, error = ?e, "failed to remove default directories");
        }
        info!(volume, size, "volume created");
        Ok(())
    }

    async fn initialize_filesystem(&self, device: &Path, cancel: &CancellationToken) -> Result<()> {
        self.wait_for_device(device, cancel).await?;
        self.fs.format(self.config.fs_type, device).await?;
        Ok(())
    }

    async fn clone_volume(
        &self,
        parent_id: &str,
        volume: &str,
        size: u64,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let origin = snapshot_name(&self.volume_name(parent_id), SNAPSHOT_SUFFIX);
        let parent = self
            .backend
            .get(&origin)
            .await
            .with_context(|| format!("failed to look up parent snapshot {}", origin))?;

        debug!(origin, volume, "cloning volume");
        self.backend
            .clone_snapshot(&origin, volume, CREATE_VOLUME_PROPERTIES)
            .await
            .with_context(|| format!("failed to clone {} into {}", origin, volume))?;

        let result: Result<()> = async {
            if parent.volsize != size {
                debug!(volume, from = parent.volsize, to = size, "resizing clone");
                self.backend
                    .set_property(volume, PROPERTY_VOLSIZE, &size.to_string())
                    .await
                    .with_context(|| format!("failed to resize {}", volume))?;
            }
            let device = self.backend.device_path(volume);
            self.wait_for_device(&device, cancel).await
        }
        .await;
        if let Err(err) = result {
            self.destroy_after_failure(volume).await;
            return Err(err);
        }
        info!(origin, volume, size, "volume cloned");
        Ok(())
    }

    async fn wait_for_device(&self, device: &Path, cancel: &CancellationToken) -> Result<()> {
        let labels = [KeyValue::new("fs_type", self.config.fs_type.to_string())];
        let _timer = Timer::start_with_labels(&self.metrics.device_waits, &labels);
        wait_for_device(device, &self.config.device_wait, cancel).await
    }

    /// Best effort removal of a volume whose provisioning failed. The
    /// original failure stays the reported error.
    pub(crate) async fn destroy_after_failure(&self, volume: &str) {
        match self.backend.destroy(volume, DestroyMode::Default).await {
            Ok(()) => debug!(volume, "rolled back volume"),
            Err(e) => warn!(volume, error = ?e, "failed to roll back volume"),
        }
    }
}
