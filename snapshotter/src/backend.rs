//! Block volume manager seam.
//!
//! The snapshotter only ever talks to ZFS through [`VolumeBackend`]. The
//! production implementation, [`ZfsCli`], drives the stock `zfs` command
//! line tool.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use metrics::{snapshotter_stats, Timer};
use opentelemetry::KeyValue;
use tokio::process::Command;
use tracing::debug;

/// Root under which udev exposes zvol block devices.
pub const ZVOL_DEVICE_ROOT: &str = "/dev/zvol";

pub const PROPERTY_VOLMODE: &str = "volmode";
pub const PROPERTY_VOLSIZE: &str = "volsize";
pub const PROPERTY_REFRESERVATION: &str = "refreservation";

/// Properties every snapshot volume is created or cloned with.
pub const CREATE_VOLUME_PROPERTIES: &[(&str, &str)] = &[
    (PROPERTY_REFRESERVATION, "none"),
    (PROPERTY_VOLMODE, "full"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    pub name: String,
    pub used: u64,
    /// Zero for datasets that are not volumes.
    pub volsize: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyMode {
    /// Fail if the dataset is still referenced.
    Default,
    /// Mark a snapshot for deletion once its last clone is gone.
    DeferDeletion,
}

#[async_trait]
pub trait VolumeBackend: Send + Sync {
    async fn get(&self, name: &str) -> Result<Dataset>;

    async fn create_volume(
        &self,
        name: &str,
        size: u64,
        properties: &[(&str, &str)],
    ) -> Result<Dataset>;

    async fn clone_snapshot(
        &self,
        snapshot: &str,
        target: &str,
        properties: &[(&str, &str)],
    ) -> Result<Dataset>;

    async fn set_property(&self, name: &str, key: &str, value: &str) -> Result<()>;

    /// Take the snapshot `name@suffix`.
    async fn snapshot(&self, name: &str, suffix: &str) -> Result<Dataset>;

    async fn destroy(&self, name: &str, mode: DestroyMode) -> Result<()>;

    /// Block device node of the volume `name`.
    fn device_path(&self, name: &str) -> PathBuf;
}

pub fn snapshot_name(volume: &str, suffix: &str) -> String {
    format!("{}@{}", volume, suffix)
}

/// [`VolumeBackend`] that shells out to `zfs`.
pub struct ZfsCli {
    binary: PathBuf,
    device_root: PathBuf,
    metrics: snapshotter_stats::Metrics,
}

impl Default for ZfsCli {
    fn default() -> Self {
        Self::new("zfs", ZVOL_DEVICE_ROOT)
    }
}

impl ZfsCli {
    pub fn new(binary: impl Into<PathBuf>, device_root: impl AsRef<Path>) -> Self {
        Self {
            binary: binary.into(),
            device_root: device_root.as_ref().to_path_buf(),
            metrics: snapshotter_stats::Metrics::new(),
        }
    }

    async fn run(&self, args: &[String]) -> Result<String> {
        let subcommand = args.first().cloned().unwrap_or_default();
        let labels = [KeyValue::new("command", subcommand)];
        let _timer = Timer::start_with_labels(&self.metrics.volume_commands, &labels);

        debug!(binary = %self.binary.display(), ?args, "running volume command");
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .with_context(|| format!("failed to execute {}", self.binary.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} {} failed (exit {}): {}",
                self.binary.display(),
                args.join(" "),
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

fn property_args(properties: &[(&str, &str)]) -> Vec<String> {
    properties
        .iter()
        .flat_map(|(key, value)| ["-o".to_string(), format!("{}={}", key, value)])
        .collect()
}

/// Parse one line of `zfs list -H -p -o name,used,volsize`.
fn parse_dataset_line(line: &str) -> Result<Dataset> {
    let fields: Vec<&str> = line.trim_end().split('\t').collect();
    let [name, used, volsize] = fields.as_slice() else {
        bail!("unexpected zfs list output: {:?}", line);
    };
    let parse = |field: &str, value: &str| -> Result<u64> {
        if value == "-" {
            return Ok(0);
        }
        value
            .parse::<u64>()
            .with_context(|| format!("invalid {} value {:?} for {}", field, value, name))
    };
    Ok(Dataset {
        name: name.to_string(),
        used: parse("used", used)?,
        volsize: parse("volsize", volsize)?,
    })
}

#[async_trait]
impl VolumeBackend for ZfsCli {
    async fn get(&self, name: &str) -> Result<Dataset> {
        let args = ["list", "-H", "-p", "-t", "all", "-o", "name,used,volsize", name]
            .map(String::from);
        let output = self.run(&args).await?;
        let line = output
            .lines()
            .next()
            .with_context(|| format!("zfs list returned nothing for {}", name))?;
        parse_dataset_line(line)
    }

    async fn create_volume(
        &self,
        name: &str,
        size: u64,
        properties: &[(&str, &str)],
    ) -> Result<Dataset> {
        let mut args = vec!["create".to_string(), "-V".to_string(), size.to_string()];
        args.extend(property_args(properties));
        args.push(name.to_string());
        self.run(&args).await?;
        self.get(name).await
    }

    async fn clone_snapshot(
        &self,
        snapshot: &str,
        target: &str,
        properties: &[(&str, &str)],
    ) -> Result<Dataset> {
        let mut args = vec!["clone".to_string()];
        args.extend(property_args(properties));
        args.push(snapshot.to_string());
        args.push(target.to_string());
        self.run(&args).await?;
        self.get(target).await
    }

    async fn set_property(&self, name: &str, key: &str, value: &str) -> Result<()> {
        let args = vec!["set".to_string(), format!("{}={}", key, value), name.to_string()];
        self.run(&args).await?;
        Ok(())
    }

    async fn snapshot(&self, name: &str, suffix: &str) -> Result<Dataset> {
        let snapshot = snapshot_name(name, suffix);
        self.run(&["snapshot".to_string(), snapshot.clone()]).await?;
        self.get(&snapshot).await
    }

    async fn destroy(&self, name: &str, mode: DestroyMode) -> Result<()> {
        let mut args = vec!["destroy".to_string()];
        if mode == DestroyMode::DeferDeletion {
            args.push("-d".to_string());
        }
        args.push(name.to_string());
        self.run(&args).await?;
        Ok(())
    }

    fn device_path(&self, name: &str) -> PathBuf {
        self.device_root.join(name)
    }
}
