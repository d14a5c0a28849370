use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FsType {
    #[default]
    Ext4,
}

impl FsType {
    pub fn mkfs_command(&self) -> &'static str {
        match self {
            FsType::Ext4 => "mkfs.ext4",
        }
    }

    /// Extended options passed to mkfs. Inode tables and the journal are
    /// initialized eagerly and discard is skipped since zvols start zeroed.
    pub fn format_options(&self) -> &'static str {
        match self {
            FsType::Ext4 => "nodiscard,lazy_itable_init=0,lazy_journal_init=0",
        }
    }

    /// Directories mkfs leaves behind that container images do not expect.
    pub fn default_dirs(&self) -> &'static [&'static str] {
        match self {
            FsType::Ext4 => &["lost+found"],
        }
    }
}

#[async_trait]
pub trait FsInitializer: Send + Sync {
    /// Create a filesystem on `device`. The error carries the tool output.
    async fn format(&self, fs_type: FsType, device: &Path) -> Result<()>;

    /// Mount `device` on a temporary directory and remove
    /// [`FsType::default_dirs`].
    async fn remove_default_dirs(&self, fs_type: FsType, device: &Path) -> Result<()>;
}

/// [`FsInitializer`] backed by the host's mkfs and mount tools.
#[derive(Debug, Default)]
pub struct Mkfs;

#[async_trait]
impl FsInitializer for Mkfs {
    async fn format(&self, fs_type: FsType, device: &Path) -> Result<()> {
        let command = fs_type.mkfs_command();
        let options = fs_type.format_options();
        debug!(command, options, device = %device.display(), "creating filesystem");

        let output = Command::new(command)
            .args(["-E", options])
            .arg(device)
            .output()
            .await
            .with_context(|| format!("failed to execute {}", command))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            bail!(
                "{} failed to initialize {}: {}",
                command,
                device.display(),
                combined.trim()
            );
        }
        debug!(output = combined.trim(), "mkfs finished");
        Ok(())
    }

    async fn remove_default_dirs(&self, fs_type: FsType, device: &Path) -> Result<()> {
        let mount_point = tempfile::Builder::new()
            .prefix("zvol-snapshotter-")
            .tempdir()
            .context("failed to create temporary mount point")?;

        mount_device(fs_type, device, mount_point.path()).await?;
        let result = remove_dirs(mount_point.path(), fs_type.default_dirs()).await;
        if let Err(e) = unmount(mount_point.path()).await {
            warn!(mount_point = %mount_point.path().display(), error = ?e, "failed to unmount volume");
            // Leave the directory in place rather than deleting into a live mount.
            let _ = mount_point.keep();
            return result.and(Err(e));
        }
        result
    }
}

async fn remove_dirs(root: &Path, dirs: &[&str]) -> Result<()> {
    for dir in dirs {
        let path: PathBuf = root.join(dir);
        match tokio::fs::remove_dir(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("failed to remove {}", path.display()))
            }
        }
    }
    Ok(())
}

async fn mount_device(fs_type: FsType, device: &Path, mount_point: &Path) -> Result<()> {
    let output = Command::new("mount")
        .args(["-t", fs_type.as_ref()])
        .arg(device)
        .arg(mount_point)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("failed to execute mount")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "failed to mount {} at {}: {}",
            device.display(),
            mount_point.display(),
            stderr.trim()
        );
    }
    Ok(())
}

async fn unmount(mount_point: &Path) -> Result<()> {
    let output = Command::new("umount")
        .arg(mount_point)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("failed to execute umount")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "failed to unmount {}: {}",
            mount_point.display(),
            stderr.trim()
        );
    }
    Ok(())
}
