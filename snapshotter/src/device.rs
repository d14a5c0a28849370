use std::{path::Path, time::Duration};

use anyhow::anyhow;
use data_model::{Error, Result};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceWaitConfig {
    #[serde(with = "millis")]
    pub poll_interval: Duration,
    #[serde(with = "millis")]
    pub timeout: Duration,
}

impl Default for DeviceWaitConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(5),
            timeout: Duration::from_secs(30),
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Wait until the device node at `path` exists.
///
/// Fails once `config.timeout` elapses or `cancel` fires, naming the device
/// in both cases.
pub async fn wait_for_device(
    path: &Path,
    config: &DeviceWaitConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let start = Instant::now();
    loop {
        if exists(path).await {
            debug!(device = %path.display(), waited = ?start.elapsed(), "device ready");
            return Ok(());
        }
        let elapsed = start.elapsed();
        if elapsed >= config.timeout {
            return Err(Error::Internal(anyhow!(
                "timed out after {:?} waiting for device {}",
                config.timeout,
                path.display()
            )));
        }
        let sleep = config.poll_interval.min(config.timeout - elapsed);
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::cancelled(format!(
                    "waiting for device {}",
                    path.display()
                )));
            }
            _ = tokio::time::sleep(sleep) => {}
        }
    }
}
