//! Generated containerd snapshot service types. The module tree mirrors the
//! protobuf packages so cross-package references resolve.

pub mod containerd {
    pub mod types {
        tonic::include_proto!("containerd.types");
    }

    pub mod services {
        pub mod snapshots {
            pub mod v1 {
                tonic::include_proto!("containerd.services.snapshots.v1");
            }
        }
    }
}

pub use containerd::{services::snapshots::v1 as snapshots_pb, types as types_pb};
