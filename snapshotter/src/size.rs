use std::collections::HashMap;

use data_model::{Error, Info, Result, LABEL_VOLUME_SIZE};
use tracing::debug;
use zvol_utils::{parse_byte_size, ByteSize};

/// Compute the volume size for the snapshot `key`.
///
/// The size starts at `default_size`, is replaced by the parent's size
/// label when the parent carries one, and finally by the caller's size
/// label, which may never be smaller than what the parent dictates.
pub fn resolve_volume_size(
    default_size: u64,
    key: &str,
    parent: Option<&Info>,
    labels: &HashMap<String, String>,
) -> Result<u64> {
    let mut size = default_size;
    if let Some(parent) = parent {
        if let Some(value) = parent.volume_size_label() {
            size = parse_byte_size(value).map_err(|e| {
                Error::invalid_argument(format!(
                    "failed to parse volume size of parent {}: {}",
                    parent.name, e
                ))
            })?;
        }
    }

    if let Some(value) = labels.get(LABEL_VOLUME_SIZE) {
        let requested = parse_byte_size(value).map_err(|e| {
            Error::invalid_argument(format!("failed to parse volume size for {}: {}", key, e))
        })?;
        if requested < size {
            return Err(Error::invalid_argument(format!(
                "invalid volume size for snapshot {}, must be greater than or equal to parent volume size: {}",
                key, size
            )));
        }
        size = requested;
    }

    if size == 0 {
        return Err(Error::invalid_argument(format!(
            "volume size for snapshot {} must be greater than zero",
            key
        )));
    }
    debug!(key, size = %ByteSize(size), "resolved volume size");
    Ok(size)
}
