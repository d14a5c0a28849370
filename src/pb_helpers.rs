use data_model::{Error, Info, Kind, MountDescriptor};
use prost_types::Timestamp;
use tonic::{Code, Status};

use crate::snapshots_api::{snapshots_pb, types_pb};

const NANOS_PER_SECOND: u64 = 1_000_000_000;

impl From<Kind> for snapshots_pb::Kind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::View => snapshots_pb::Kind::View,
            Kind::Active => snapshots_pb::Kind::Active,
            Kind::Committed => snapshots_pb::Kind::Committed,
        }
    }
}

pub fn kind_from_pb(kind: i32) -> Option<Kind> {
    match snapshots_pb::Kind::try_from(kind).ok()? {
        snapshots_pb::Kind::View => Some(Kind::View),
        snapshots_pb::Kind::Active => Some(Kind::Active),
        snapshots_pb::Kind::Committed => Some(Kind::Committed),
        snapshots_pb::Kind::Unknown => None,
    }
}

pub fn timestamp_from_nanos(nanos: u64) -> Timestamp {
    Timestamp {
        seconds: (nanos / NANOS_PER_SECOND) as i64,
        nanos: (nanos % NANOS_PER_SECOND) as i32,
    }
}

pub fn nanos_from_timestamp(timestamp: Option<&Timestamp>) -> u64 {
    timestamp
        .filter(|ts| ts.seconds >= 0 && ts.nanos >= 0)
        .map(|ts| ts.seconds as u64 * NANOS_PER_SECOND + ts.nanos as u64)
        .unwrap_or_default()
}

impl From<Info> for snapshots_pb::Info {
    fn from(info: Info) -> Self {
        snapshots_pb::Info {
            name: info.name,
            parent: info.parent,
            kind: snapshots_pb::Kind::from(info.kind) as i32,
            created_at: Some(timestamp_from_nanos(info.created_at)),
            updated_at: Some(timestamp_from_nanos(info.updated_at)),
            labels: info.labels,
        }
    }
}

/// Convert an info received on Update. Only the name and labels are read
/// by the ledger, so an unknown kind is accepted.
pub fn info_from_pb(info: snapshots_pb::Info) -> Info {
    Info {
        kind: kind_from_pb(info.kind).unwrap_or(Kind::Active),
        created_at: nanos_from_timestamp(info.created_at.as_ref()),
        updated_at: nanos_from_timestamp(info.updated_at.as_ref()),
        name: info.name,
        parent: info.parent,
        labels: info.labels,
    }
}

impl From<MountDescriptor> for types_pb::Mount {
    fn from(mount: MountDescriptor) -> Self {
        types_pb::Mount {
            r#type: mount.fs_type,
            source: mount.source,
            target: String::new(),
            options: mount.options,
        }
    }
}

pub fn mounts_to_pb(mounts: Vec<MountDescriptor>) -> Vec<types_pb::Mount> {
    mounts.into_iter().map(Into::into).collect()
}

pub fn error_to_status(err: Error) -> Status {
    let code = match &err {
        Error::NotFound(_) => Code::NotFound,
        Error::AlreadyExists(_) => Code::AlreadyExists,
        Error::InvalidArgument(_) => Code::InvalidArgument,
        Error::FailedPrecondition(_) => Code::FailedPrecondition,
        Error::ResourceExhausted(_) => Code::ResourceExhausted,
        Error::Cancelled(_) => Code::Cancelled,
        Error::Internal(_) => Code::Internal,
        _ => Code::Unknown,
    };
    Status::new(code, format!("{:#}", err))
}
