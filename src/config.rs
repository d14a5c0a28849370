use std::{
    fmt::Debug,
    io::ErrorKind,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use snapshotter::{fs::FsType, DeviceWaitConfig, SnapshotterConfig};
use zvol_utils::parse_byte_size;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/containerd-zvol-snapshotter/config.toml";
pub const DEFAULT_ROOT_DIR: &str = "/var/lib/containerd-zvol";
pub const DEFAULT_VOLUME_SIZE: &str = "20G";
const ENV_PREFIX: &str = "ZVOL_";
const DEFAULT_METRICS_INTERVAL_SECS: u64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Export spans over OTLP.
    #[serde(default)]
    pub enable_tracing: bool,
    /// Export operation metrics over OTLP.
    #[serde(default)]
    pub enable_metrics: bool,
    /// OTLP collector endpoint. The exporter default is used when unset.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_metrics_interval", with = "duration_serde")]
    pub metrics_interval: Duration,
}

fn default_metrics_interval() -> Duration {
    Duration::from_secs(DEFAULT_METRICS_INTERVAL_SECS)
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable_tracing: false,
            enable_metrics: false,
            endpoint: None,
            metrics_interval: default_metrics_interval(),
        }
    }
}

mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(seconds))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory holding the metadata store.
    pub root_path: String,
    /// Parent dataset below which every volume is created.
    pub dataset: String,
    /// Size of volumes without a size label, e.g. `20G`.
    pub volume_size: String,
    /// Filesystem created on fresh volumes.
    pub fs_type: String,
    pub device_wait: DeviceWaitConfig,
    /// Emit logs as JSON instead of compact text.
    pub structured_logging: bool,
    pub telemetry: TelemetryConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            root_path: String::new(),
            dataset: String::new(),
            volume_size: DEFAULT_VOLUME_SIZE.to_string(),
            fs_type: FsType::default().to_string(),
            device_wait: DeviceWaitConfig::default(),
            structured_logging: false,
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load the TOML file at `path` and merge `ZVOL_` environment overrides
    /// on top, nested keys separated by `__`. A missing file is only
    /// tolerated at the default location.
    pub fn load(path: &Path) -> Result<DaemonConfig> {
        let mut figment = Figment::new();
        match std::fs::read_to_string(path) {
            Ok(config_str) => figment = figment.merge(Toml::string(&config_str)),
            Err(e) if e.kind() == ErrorKind::NotFound && path == Path::new(DEFAULT_CONFIG_PATH) => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read config file {}", path.display()))
            }
        }
        let config: DaemonConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Apply command line overrides. A root given on the command line wins
    /// when the file leaves it empty or when it differs from the default.
    pub fn apply_overrides(&mut self, root: &Path, dataset: Option<&str>) {
        if self.root_path.is_empty() || root != Path::new(DEFAULT_ROOT_DIR) {
            self.root_path = root.to_string_lossy().to_string();
        }
        if let Some(dataset) = dataset.filter(|d| !d.is_empty()) {
            self.dataset = dataset.to_string();
        }
    }

    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.root_path.is_empty() {
            problems.push("root_path is required".to_string());
        }
        if self.dataset.is_empty() {
            problems.push("dataset is required".to_string());
        }
        if self.fs_type.is_empty() {
            problems.push("fs_type is required".to_string());
        } else if FsType::from_str(&self.fs_type).is_err() {
            problems.push(format!("unsupported filesystem type: {:?}", self.fs_type));
        }
        if let Err(e) = self.volume_size_bytes() {
            problems.push(e.to_string());
        }
        if self.device_wait.poll_interval.is_zero() {
            problems.push("device_wait.poll_interval must be greater than zero".to_string());
        }
        problems
    }

    pub fn validate(&self) -> Result<()> {
        let problems = self.problems();
        if problems.is_empty() {
            return Ok(());
        }
        Err(anyhow!("invalid config: {}", problems.join("; ")))
    }

    pub fn volume_size_bytes(&self) -> Result<u64> {
        if self.volume_size.is_empty() {
            return parse_byte_size(DEFAULT_VOLUME_SIZE);
        }
        let size = parse_byte_size(&self.volume_size)
            .with_context(|| format!("failed to parse volume size: '{}'", self.volume_size))?;
        if size == 0 {
            return Err(anyhow!("volume_size must be greater than zero"));
        }
        Ok(size)
    }

    pub fn snapshotter_config(&self) -> Result<SnapshotterConfig> {
        self.validate()?;
        Ok(SnapshotterConfig {
            root_path: PathBuf::from(&self.root_path),
            dataset: self.dataset.clone(),
            volume_size: self.volume_size_bytes()?,
            fs_type: FsType::from_str(&self.fs_type)?,
            device_wait: self.device_wait,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use zvol_utils::byte_size::GIB;

    use super::*;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_valid_config() {
        let file = write_config(
            r#"
root_path = "/tmp"
dataset = "tank/snapshots"
volume_size = "50G"

[device_wait]
poll_interval = 10
timeout = 1000

[telemetry]
enable_metrics = true
metrics_interval = 30
"#,
        );
        let config = DaemonConfig::load(file.path()).unwrap();
        assert_eq!(config.root_path, "/tmp");
        assert_eq!(config.dataset, "tank/snapshots");
        assert_eq!(config.volume_size_bytes().unwrap(), 50 * GIB);
        assert_eq!(config.fs_type, "ext4");
        assert_eq!(config.device_wait.poll_interval, Duration::from_millis(10));
        assert_eq!(config.device_wait.timeout, Duration::from_secs(1));
        assert!(config.telemetry.enable_metrics);
        assert!(!config.telemetry.enable_tracing);
        assert_eq!(config.telemetry.metrics_interval, Duration::from_secs(30));

        let snapshotter_config = config.snapshotter_config().unwrap();
        assert_eq!(snapshotter_config.root_path, PathBuf::from("/tmp"));
        assert_eq!(snapshotter_config.fs_type, FsType::Ext4);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = DaemonConfig::load(&dir.path().join("absent.toml")).unwrap_err();
        let io_err = err.downcast_ref::<std::io::Error>().unwrap();
        assert_eq!(io_err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_invalid_volume_size() {
        let file = write_config(
            r#"
root_path = "/tmp"
dataset = "tank/snapshots"
volume_size = "x"
"#,
        );
        let config = DaemonConfig::load(file.path()).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("failed to parse volume size"));
        assert!(config.snapshotter_config().is_err());
    }

    #[test]
    fn test_malformed_toml() {
        let file = write_config("root_path = [");
        assert!(DaemonConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_validation_collects_every_problem() {
        let config = DaemonConfig {
            fs_type: String::new(),
            ..Default::default()
        };
        assert_eq!(config.problems().len(), 3);

        let config = DaemonConfig {
            fs_type: "xfs".to_string(),
            ..Default::default()
        };
        let problems = config.problems();
        assert!(problems.iter().any(|p| p.contains("unsupported filesystem type")));

        let config = DaemonConfig {
            root_path: "/tmp".to_string(),
            dataset: "tank/snapshots".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.volume_size_bytes().unwrap(), 20 * GIB);
    }

    #[test]
    fn test_overrides() {
        let mut config = DaemonConfig::default();
        config.apply_overrides(Path::new(DEFAULT_ROOT_DIR), None);
        assert_eq!(config.root_path, DEFAULT_ROOT_DIR);

        let mut config = DaemonConfig {
            root_path: "/srv/zvol".to_string(),
            dataset: "tank/a".to_string(),
            ..Default::default()
        };
        config.apply_overrides(Path::new(DEFAULT_ROOT_DIR), Some(""));
        assert_eq!(config.root_path, "/srv/zvol");
        assert_eq!(config.dataset, "tank/a");

        config.apply_overrides(Path::new("/mnt/zvol"), Some("tank/b"));
        assert_eq!(config.root_path, "/mnt/zvol");
        assert_eq!(config.dataset, "tank/b");
    }
}
