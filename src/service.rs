use std::{
    fs::DirBuilder,
    future::Future,
    io::ErrorKind,
    os::unix::fs::DirBuilderExt,
    path::{Path, PathBuf},
    pin::Pin,
    sync::Arc,
};

use anyhow::{Context, Result};
use data_model::Info;
use snapshotter::{backend::ZfsCli, fs::Mkfs, Snapshotter};
use tokio::{net::UnixListener, signal};
use tokio_stream::{wrappers::UnixListenerStream, Stream};
use tokio_util::sync::CancellationToken;
use tonic::{transport::Server, Request, Response, Status};
use tracing::{debug, error, info, warn};

use crate::{
    config::DaemonConfig,
    pb_helpers::{error_to_status, info_from_pb, mounts_to_pb},
    snapshots_api::snapshots_pb::{
        self,
        snapshots_server::{Snapshots, SnapshotsServer},
        CleanupRequest,
        CommitSnapshotRequest,
        ListSnapshotsRequest,
        ListSnapshotsResponse,
        MountsRequest,
        MountsResponse,
        PrepareSnapshotRequest,
        PrepareSnapshotResponse,
        RemoveSnapshotRequest,
        StatSnapshotRequest,
        StatSnapshotResponse,
        UpdateSnapshotRequest,
        UpdateSnapshotResponse,
        UsageRequest,
        UsageResponse,
        ViewSnapshotRequest,
        ViewSnapshotResponse,
    },
};

/// Number of infos sent per List response message.
const LIST_BATCH_SIZE: usize = 100;

pub struct SnapshotService {
    snapshotter: Arc<Snapshotter>,
}

impl SnapshotService {
    pub fn new(snapshotter: Arc<Snapshotter>) -> Self {
        Self { snapshotter }
    }

    /// Run a mutating operation on its own task. Dropping the request, for
    /// example when the client goes away, cancels the token the operation
    /// observes but never aborts it halfway.
    async fn detached<T, F, Fut>(&self, op: F) -> Result<T, Status>
    where
        F: FnOnce(Arc<Snapshotter>, CancellationToken) -> Fut,
        Fut: Future<Output = data_model::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let cancel = CancellationToken::new();
        let _guard = cancel.clone().drop_guard();
        let handle = tokio::spawn(op(self.snapshotter.clone(), cancel));
        match handle.await {
            Ok(result) => result.map_err(error_to_status),
            Err(e) => Err(Status::internal(format!("snapshot operation failed: {}", e))),
        }
    }
}

type InfoBatchStream = Pin<Box<dyn Stream<Item = Result<ListSnapshotsResponse, Status>> + Send>>;

#[tonic::async_trait]
impl Snapshots for SnapshotService {
    async fn prepare(
        &self,
        request: Request<PrepareSnapshotRequest>,
    ) -> Result<Response<PrepareSnapshotResponse>, Status> {
        let req = request.into_inner();
        let mounts = self
            .detached(|snapshotter, cancel| async move {
                snapshotter
                    .prepare(&req.key, &req.parent, req.labels, &cancel)
                    .await
            })
            .await?;
        Ok(Response::new(PrepareSnapshotResponse {
            mounts: mounts_to_pb(mounts),
        }))
    }

    async fn view(
        &self,
        request: Request<ViewSnapshotRequest>,
    ) -> Result<Response<ViewSnapshotResponse>, Status> {
        let req = request.into_inner();
        let mounts = self
            .detached(|snapshotter, cancel| async move {
                snapshotter
                    .view(&req.key, &req.parent, req.labels, &cancel)
                    .await
            })
            .await?;
        Ok(Response::new(ViewSnapshotResponse {
            mounts: mounts_to_pb(mounts),
        }))
    }

    async fn mounts(
        &self,
        request: Request<MountsRequest>,
    ) -> Result<Response<MountsResponse>, Status> {
        let req = request.into_inner();
        let mounts = self
            .snapshotter
            .mounts(&req.key)
            .await
            .map_err(error_to_status)?;
        Ok(Response::new(MountsResponse {
            mounts: mounts_to_pb(mounts),
        }))
    }

    async fn commit(&self, request: Request<CommitSnapshotRequest>) -> Result<Response<()>, Status> {
        let req = request.into_inner();
        self.detached(|snapshotter, _| async move {
            snapshotter.commit(&req.name, &req.key, req.labels).await
        })
        .await?;
        Ok(Response::new(()))
    }

    async fn remove(&self, request: Request<RemoveSnapshotRequest>) -> Result<Response<()>, Status> {
        let req = request.into_inner();
        self.detached(|snapshotter, _| async move { snapshotter.remove(&req.key).await })
            .await?;
        Ok(Response::new(()))
    }

    async fn stat(
        &self,
        request: Request<StatSnapshotRequest>,
    ) -> Result<Response<StatSnapshotResponse>, Status> {
        let req = request.into_inner();
        let info = self
            .snapshotter
            .stat(&req.key)
            .await
            .map_err(error_to_status)?;
        Ok(Response::new(StatSnapshotResponse {
            info: Some(info.into()),
        }))
    }

    async fn update(
        &self,
        request: Request<UpdateSnapshotRequest>,
    ) -> Result<Response<UpdateSnapshotResponse>, Status> {
        let req = request.into_inner();
        let info = req
            .info
            .map(info_from_pb)
            .ok_or_else(|| Status::invalid_argument("update requires snapshot info"))?;
        let fieldpaths = req.update_mask.map(|mask| mask.paths).unwrap_or_default();
        let info = self
            .detached(|snapshotter, _| async move { snapshotter.update(info, &fieldpaths).await })
            .await?;
        Ok(Response::new(UpdateSnapshotResponse {
            info: Some(info.into()),
        }))
    }

    type ListStream = InfoBatchStream;

    async fn list(
        &self,
        request: Request<ListSnapshotsRequest>,
    ) -> Result<Response<Self::ListStream>, Status> {
        let req = request.into_inner();
        let mut infos: Vec<Info> = Vec::new();
        self.snapshotter
            .walk(&req.filters, |info| {
                infos.push(info.clone());
                Ok(())
            })
            .await
            .map_err(error_to_status)?;
        debug!(count = infos.len(), "listing snapshots");

        let mut batches = Vec::new();
        let mut infos = infos.into_iter().peekable();
        while infos.peek().is_some() {
            let info: Vec<snapshots_pb::Info> =
                infos.by_ref().take(LIST_BATCH_SIZE).map(Into::into).collect();
            batches.push(Ok(ListSnapshotsResponse { info }));
        }
        Ok(Response::new(Box::pin(tokio_stream::iter(batches))))
    }

    async fn usage(&self, request: Request<UsageRequest>) -> Result<Response<UsageResponse>, Status> {
        let req = request.into_inner();
        let usage = self
            .snapshotter
            .usage(&req.key)
            .await
            .map_err(error_to_status)?;
        Ok(Response::new(UsageResponse {
            size: usage.size,
            inodes: usage.inodes,
        }))
    }

    async fn cleanup(&self, _request: Request<CleanupRequest>) -> Result<Response<()>, Status> {
        Err(Status::unimplemented("cleanup is not supported"))
    }
}

pub struct Service {
    pub config: DaemonConfig,
    pub address: PathBuf,
    pub snapshotter: Arc<Snapshotter>,
}

impl Service {
    pub async fn new(config: DaemonConfig, address: PathBuf) -> Result<Self> {
        let snapshotter_config = config.snapshotter_config()?;
        let snapshotter = Snapshotter::new(
            snapshotter_config,
            Arc::new(ZfsCli::default()),
            Arc::new(Mkfs),
        )
        .await
        .context("failed to create snapshotter")?;
        Ok(Self {
            config,
            address,
            snapshotter: Arc::new(snapshotter),
        })
    }

    pub async fn start(&self) -> Result<()> {
        let listener = bind_socket(&self.address)?;
        let cancel = CancellationToken::new();
        tokio::spawn(shutdown_signal(cancel.clone()));

        info!(address = %self.address.display(), "snapshotter listening");
        let service = SnapshotService::new(self.snapshotter.clone());
        let served = Server::builder()
            .add_service(SnapshotsServer::new(service))
            .serve_with_incoming_shutdown(UnixListenerStream::new(listener), cancel.cancelled())
            .await
            .with_context(|| format!("error serving on socket {}", self.address.display()));

        debug!("closing the snapshotter");
        if let Err(e) = self.snapshotter.close().await {
            error!(error = %e, "failed to close snapshotter");
        }
        if let Err(e) = std::fs::remove_file(&self.address) {
            if e.kind() != ErrorKind::NotFound {
                warn!(address = %self.address.display(), error = %e, "failed to remove socket");
            }
        }
        served
    }
}

/// Bind the unix socket at `address`, creating its directory and removing a
/// socket left behind by an earlier run.
fn bind_socket(address: &Path) -> Result<UnixListener> {
    if let Some(dir) = address.parent() {
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)
            .with_context(|| format!("failed to create directory {}", dir.display()))?;
    }
    match std::fs::remove_file(address) {
        Ok(()) => debug!(address = %address.display(), "removed stale socket"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("failed to remove {}", address.display()))
        }
    }
    UnixListener::bind(address)
        .with_context(|| format!("error listening on socket {}", address.display()))
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => info!(signal = "SIGINT", "signal received, shutting down"),
        _ = terminate => info!(signal = "SIGTERM", "signal received, shutting down"),
    }
    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use data_model::LABEL_VOLUME_SIZE;
    use prost_types::FieldMask;
    use snapshotter::testing::TestSnapshotter;
    use tokio_stream::StreamExt;
    use tonic::Code;

    use super::*;

    async fn service() -> (SnapshotService, TestSnapshotter) {
        let test = TestSnapshotter::new().await.unwrap();
        // Hand the ledger over to a snapshotter the service can share.
        test.snapshotter.close().await.unwrap();
        let snapshotter = Arc::new(
            Snapshotter::new(
                test.snapshotter.config().clone(),
                test.backend.clone(),
                test.fs.clone(),
            )
            .await
            .unwrap(),
        );
        (SnapshotService::new(snapshotter), test)
    }

    fn prepare_request(key: &str, parent: &str) -> Request<PrepareSnapshotRequest> {
        Request::new(PrepareSnapshotRequest {
            snapshotter: "zvol".to_string(),
            key: key.to_string(),
            parent: parent.to_string(),
            labels: HashMap::new(),
        })
    }

    #[tokio::test]
    async fn test_prepare_commit_view() {
        let (service, test) = service().await;

        let mounts = service
            .prepare(prepare_request("a", ""))
            .await
            .unwrap()
            .into_inner()
            .mounts;
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].r#type, "ext4");
        assert!(mounts[0].options.is_empty());
        assert_eq!(test.fs.formatted().len(), 1);

        service
            .commit(Request::new(CommitSnapshotRequest {
                snapshotter: "zvol".to_string(),
                name: "snap1".to_string(),
                key: "a".to_string(),
                labels: HashMap::new(),
            }))
            .await
            .unwrap();

        let info = service
            .stat(Request::new(StatSnapshotRequest {
                snapshotter: "zvol".to_string(),
                key: "snap1".to_string(),
            }))
            .await
            .unwrap()
            .into_inner()
            .info
            .unwrap();
        assert_eq!(info.kind, snapshots_pb::Kind::Committed as i32);

        let mounts = service
            .view(Request::new(ViewSnapshotRequest {
                snapshotter: "zvol".to_string(),
                key: "v".to_string(),
                parent: "snap1".to_string(),
                labels: HashMap::new(),
            }))
            .await
            .unwrap()
            .into_inner()
            .mounts;
        assert_eq!(mounts[0].options, vec!["ro".to_string()]);

        let mounts = service
            .mounts(Request::new(MountsRequest {
                snapshotter: "zvol".to_string(),
                key: "v".to_string(),
            }))
            .await
            .unwrap()
            .into_inner()
            .mounts;
        assert_eq!(mounts[0].options, vec!["ro".to_string()]);
    }

    #[tokio::test]
    async fn test_error_codes() {
        let (service, _test) = service().await;

        let status = service
            .stat(Request::new(StatSnapshotRequest {
                snapshotter: "zvol".to_string(),
                key: "missing".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::NotFound);

        service.prepare(prepare_request("a", "")).await.unwrap();
        let status = service
            .prepare(prepare_request("a", ""))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::AlreadyExists);

        let status = service
            .prepare(prepare_request("b", "a"))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::FailedPrecondition);

        let status = service
            .cleanup(Request::new(CleanupRequest {
                snapshotter: "zvol".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::Unimplemented);

        let status = service
            .update(Request::new(UpdateSnapshotRequest {
                snapshotter: "zvol".to_string(),
                info: None,
                update_mask: None,
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_update_and_usage() {
        let (service, test) = service().await;
        service.prepare(prepare_request("a", "")).await.unwrap();
        test.backend.set_used(&test.volume("1"), 4096);

        let usage = service
            .usage(Request::new(UsageRequest {
                snapshotter: "zvol".to_string(),
                key: "a".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(usage.size, 4096);
        assert_eq!(usage.inodes, -1);

        let info = snapshots_pb::Info {
            name: "a".to_string(),
            labels: HashMap::from([("team".to_string(), "infra".to_string())]),
            ..Default::default()
        };
        let updated = service
            .update(Request::new(UpdateSnapshotRequest {
                snapshotter: "zvol".to_string(),
                info: Some(info),
                update_mask: Some(FieldMask {
                    paths: vec!["labels.team".to_string()],
                }),
            }))
            .await
            .unwrap()
            .into_inner()
            .info
            .unwrap();
        assert_eq!(updated.labels.get("team").map(String::as_str), Some("infra"));
        assert!(updated.labels.contains_key(LABEL_VOLUME_SIZE));
    }

    #[tokio::test]
    async fn test_list_batches_and_filters() {
        let (service, _test) = service().await;
        for i in 0..(LIST_BATCH_SIZE + 5) {
            service
                .prepare(prepare_request(&format!("key-{:03}", i), ""))
                .await
                .unwrap();
        }

        let stream = service
            .list(Request::new(ListSnapshotsRequest {
                snapshotter: "zvol".to_string(),
                filters: vec![],
            }))
            .await
            .unwrap()
            .into_inner();
        let batches: Vec<ListSnapshotsResponse> =
            stream.map(|batch| batch.unwrap()).collect().await;
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].info.len(), LIST_BATCH_SIZE);
        assert_eq!(batches[1].info.len(), 5);

        let stream = service
            .list(Request::new(ListSnapshotsRequest {
                snapshotter: "zvol".to_string(),
                filters: vec!["name==key-007".to_string()],
            }))
            .await
            .unwrap()
            .into_inner();
        let batches: Vec<ListSnapshotsResponse> =
            stream.map(|batch| batch.unwrap()).collect().await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].info[0].name, "key-007");

        let status = service
            .list(Request::new(ListSnapshotsRequest {
                snapshotter: "zvol".to_string(),
                filters: vec!["name=key".to_string()],
            }))
            .await
            .err()
            .unwrap();
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_remove_and_closed() {
        let (service, _test) = service().await;
        service.prepare(prepare_request("a", "")).await.unwrap();
        service
            .remove(Request::new(RemoveSnapshotRequest {
                snapshotter: "zvol".to_string(),
                key: "a".to_string(),
            }))
            .await
            .unwrap();

        service.snapshotter.close().await.unwrap();
        let status = service
            .prepare(prepare_request("b", ""))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn test_bind_socket_replaces_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let address = dir.path().join("run").join("zvol.sock");
        std::fs::create_dir_all(address.parent().unwrap()).unwrap();
        std::fs::write(&address, b"stale").unwrap();

        let listener = bind_socket(&address).unwrap();
        assert!(listener.local_addr().is_ok());
        assert!(address.exists());
    }
}
