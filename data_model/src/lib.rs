pub mod error;
pub mod filter;

use std::collections::HashMap;

use derive_builder::Builder;
pub use error::{Error, Result};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use zvol_utils::get_epoch_time_in_ns;

/// Label carrying a snapshot's volume size in bytes as a decimal string.
pub const LABEL_VOLUME_SIZE: &str = "containerd.io/snapshot/zvol/size";

/// Inode count reported when the backend does not track inodes.
pub const UNKNOWN_INODES: i64 = -1;

/// Largest usage that can be reported for a snapshot.
pub const MAX_SNAPSHOT_SIZE: u64 = i64::MAX as u64;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Active,
    View,
    Committed,
}

/// Caller visible description of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[builder(setter(into))]
pub struct Info {
    pub name: String,
    #[builder(default)]
    pub parent: String,
    pub kind: Kind,
    #[builder(default)]
    pub labels: HashMap<String, String>,
    #[builder(default = "get_epoch_time_in_ns()")]
    pub created_at: u64,
    #[builder(default = "get_epoch_time_in_ns()")]
    pub updated_at: u64,
}

impl Info {
    pub fn volume_size_label(&self) -> Option<&str> {
        self.labels.get(LABEL_VOLUME_SIZE).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub size: i64,
    pub inodes: i64,
}

/// Identity of a snapshot as seen by the volume layer.
///
/// `parent_ids` holds the ids of every ancestor, nearest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub id: String,
    pub kind: Kind,
    pub parent_ids: Vec<String>,
}

/// How a snapshot's volume is exposed to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountDescriptor {
    pub fs_type: String,
    pub source: String,
    pub options: Vec<String>,
}

impl MountDescriptor {
    pub fn new(fs_type: impl Into<String>, source: impl Into<String>, readonly: bool) -> Self {
        let options = if readonly {
            vec!["ro".to_string()]
        } else {
            vec![]
        };
        Self {
            fs_type: fs_type.into(),
            source: source.into(),
            options,
        }
    }

    pub fn is_readonly(&self) -> bool {
        self.options.iter().any(|o| o == "ro")
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn test_kind_strings() {
        assert_eq!(Kind::Active.to_string(), "active");
        assert_eq!(Kind::from_str("Committed").unwrap(), Kind::Committed);
        assert!(Kind::from_str("unknown").is_err());
        assert_eq!(serde_json::to_string(&Kind::View).unwrap(), "\"view\"");
    }

    #[test]
    fn test_info_builder_defaults() {
        let info = InfoBuilder::default()
            .name("a")
            .kind(Kind::Active)
            .build()
            .unwrap();
        assert!(info.parent.is_empty());
        assert!(info.labels.is_empty());
        assert!(info.created_at > 0);
        assert_eq!(info.volume_size_label(), None);
    }

    #[test]
    fn test_mount_descriptor_readonly() {
        let rw = MountDescriptor::new("ext4", "/dev/zvol/tank/1", false);
        assert!(rw.options.is_empty());
        assert!(!rw.is_readonly());
        let ro = MountDescriptor::new("ext4", "/dev/zvol/tank/1", true);
        assert!(ro.is_readonly());
    }
}
