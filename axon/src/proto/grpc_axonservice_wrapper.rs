use std::pin::Pin;
use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};
use tonic::{async_trait, Request, Response, Status, Streaming};
use tracing::instrument;

use crate::perms::{Authorizer, PERM_GET, PERM_HAS, PERM_UPLOAD};
use crate::service::AxonService;
use crate::upload::UploadSession;
use crate::Sha256Digest;

/// Exposes an [AxonService] as the `axon.v1.AxonService` gRPC service,
/// gating every operation on a capability check against the calling
/// identity.
pub struct GRPCAxonServiceWrapper {
    axon: Arc<dyn AxonService>,
    auth: Arc<dyn Authorizer>,
}

impl GRPCAxonServiceWrapper {
    pub fn new(axon: Arc<dyn AxonService>, auth: Arc<dyn Authorizer>) -> Self {
        Self { axon, auth }
    }

    /// Capability check against the calling identity, before any side
    /// effect.
    fn allowed<T>(&self, request: &Request<T>, perm: &str) -> Result<(), Status> {
        let user = match request.metadata().get(super::USER_METADATA_KEY) {
            None => super::ANON_USER,
            Some(v) => v
                .to_str()
                .map_err(|_| Status::invalid_argument("invalid axon-user metadata"))?,
        };

        if self.auth.allowed(user, perm) {
            Ok(())
        } else {
            Err(Status::permission_denied(format!(
                "user {:?} lacks {}",
                user, perm
            )))
        }
    }
}

fn parse_digest(digest: bytes::Bytes) -> Result<Sha256Digest, Status> {
    digest
        .try_into()
        .map_err(|_| Status::invalid_argument("invalid digest length"))
}

/// Re-slice a storage chunk into wire-sized frames.
fn frames_of(mut byts: bytes::Bytes) -> Vec<bytes::Bytes> {
    let mut frames = Vec::with_capacity(byts.len().div_ceil(super::RPC_CHUNK_SIZE).max(1));
    while byts.len() > super::RPC_CHUNK_SIZE {
        frames.push(byts.split_to(super::RPC_CHUNK_SIZE));
    }
    frames.push(byts);
    frames
}

#[async_trait]
impl super::axon_service_server::AxonService for GRPCAxonServiceWrapper {
    // https://github.com/tokio-rs/tokio/issues/2723#issuecomment-1534723933
    type GetStream =
        Pin<Box<dyn futures::Stream<Item = Result<super::BlobChunk, Status>> + Send + 'static>>;
    type HashesStream =
        Pin<Box<dyn futures::Stream<Item = Result<super::SyncEntry, Status>> + Send + 'static>>;
    type HistoryStream =
        Pin<Box<dyn futures::Stream<Item = Result<super::HistoryEntry, Status>> + Send + 'static>>;

    #[instrument(skip_all)]
    async fn get(
        &self,
        request: Request<super::GetBlobRequest>,
    ) -> Result<Response<Self::GetStream>, Status> {
        self.allowed(&request, PERM_GET)?;

        let digest = parse_digest(request.into_inner().digest)?;
        let chunks = self.axon.get(&digest).await.map_err(Status::from)?;

        let frames = chunks
            .map(|item| item.map_err(Status::from))
            .map_ok(|byts| futures::stream::iter(frames_of(byts).into_iter().map(Ok)))
            .try_flatten()
            .map_ok(|data| super::BlobChunk { data });

        Ok(Response::new(Box::pin(frames)))
    }

    #[instrument(skip_all)]
    async fn has(
        &self,
        request: Request<super::HasBlobRequest>,
    ) -> Result<Response<super::HasBlobResponse>, Status> {
        self.allowed(&request, PERM_HAS)?;

        let digest = parse_digest(request.into_inner().digest)?;
        let has = self.axon.has(&digest).await.map_err(Status::from)?;

        Ok(Response::new(super::HasBlobResponse { has }))
    }

    #[instrument(skip_all)]
    async fn wants(
        &self,
        request: Request<super::WantsRequest>,
    ) -> Result<Response<super::WantsResponse>, Status> {
        self.allowed(&request, PERM_HAS)?;

        let digests = request
            .into_inner()
            .digests
            .into_iter()
            .map(parse_digest)
            .collect::<Result<Vec<_>, _>>()?;

        let missing = self.axon.wants(digests).await.map_err(Status::from)?;

        Ok(Response::new(super::WantsResponse {
            digests: missing.into_iter().map(Into::into).collect(),
        }))
    }

    #[instrument(skip_all)]
    async fn put(
        &self,
        request: Request<Streaming<super::BlobChunk>>,
    ) -> Result<Response<super::PutBlobResponse>, Status> {
        self.allowed(&request, PERM_UPLOAD)?;

        let mut frames = request.into_inner();

        // Dropping the session (e.g. on client disconnect) releases its
        // spool on every exit path.
        let mut upload = UploadSession::new(self.axon.clone());
        while let Some(chunk) = frames.message().await? {
            upload.write(&chunk.data).await.map_err(Status::from)?;
        }

        let (size, digest) = upload.save().await.map_err(Status::from)?;

        Ok(Response::new(super::PutBlobResponse {
            digest: digest.into(),
            size,
        }))
    }

    #[instrument(skip_all)]
    async fn hashes(
        &self,
        request: Request<super::HashesRequest>,
    ) -> Result<Response<Self::HashesStream>, Status> {
        self.allowed(&request, PERM_HAS)?;

        let offs = request.into_inner().offset;
        let entries = self.axon.hashes(offs).await.map_err(Status::from)?;

        let frames = entries.map(|item| {
            item.map(|entry| super::SyncEntry {
                offset: entry.offset,
                digest: entry.digest.into(),
                size: entry.size,
            })
            .map_err(Status::from)
        });

        Ok(Response::new(Box::pin(frames)))
    }

    #[instrument(skip_all)]
    async fn history(
        &self,
        request: Request<super::HistoryRequest>,
    ) -> Result<Response<Self::HistoryStream>, Status> {
        self.allowed(&request, PERM_HAS)?;

        let rq = request.into_inner();
        let entries = self
            .axon
            .history(rq.tick, rq.tock)
            .await
            .map_err(Status::from)?;

        let frames = entries.map(|item| {
            item.map(|entry| super::HistoryEntry {
                time: entry.time,
                digest: entry.digest.into(),
                size: entry.size,
            })
            .map_err(Status::from)
        });

        Ok(Response::new(Box::pin(frames)))
    }

    #[instrument(skip_all)]
    async fn metrics(
        &self,
        request: Request<super::MetricsRequest>,
    ) -> Result<Response<super::MetricsResponse>, Status> {
        self.allowed(&request, PERM_HAS)?;

        let snapshot = self.axon.metrics().await.map_err(Status::from)?;

        Ok(Response::new(super::MetricsResponse {
            file_count: snapshot.file_count,
            size_bytes: snapshot.size_bytes,
        }))
    }
}
