use std::cmp;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::async_trait;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::Channel;
use tracing::instrument;

use super::{AxonService, ChunkStream, HistoryEntry, MetricsSnapshot, SyncEntry};
use crate::proto::{self, axon_service_client::AxonServiceClient};
use crate::{Error, Sha256Digest};

/// Connects to a (remote) axon daemon over gRPC.
#[derive(Clone)]
pub struct GRPCAxonService {
    /// The internal reference to a gRPC client.
    /// Cloning it is cheap, and it internally handles concurrent requests.
    grpc_client: AxonServiceClient<Channel>,

    /// Identity announced on every call, or None for the server default.
    user: Option<MetadataValue<Ascii>>,
}

impl GRPCAxonService {
    pub fn from_client(grpc_client: AxonServiceClient<Channel>) -> Self {
        Self {
            grpc_client,
            user: None,
        }
    }

    /// Announce the given identity in the request metadata of every call.
    pub fn with_user(self, user: &str) -> Result<Self, Error> {
        let user = user
            .parse()
            .map_err(|_| Error::InvalidRequest(format!("invalid user name: {user:?}")))?;
        Ok(Self {
            user: Some(user),
            ..self
        })
    }

    fn request<T>(&self, message: T) -> tonic::Request<T> {
        let mut request = tonic::Request::new(message);
        if let Some(user) = &self.user {
            request
                .metadata_mut()
                .insert(proto::USER_METADATA_KEY, user.clone());
        }
        request
    }
}

fn invalid_digest(e: crate::digests::Error) -> Error {
    Error::StorageError(format!("invalid digest in response: {}", e))
}

#[async_trait]
impl AxonService for GRPCAxonService {
    #[instrument(skip_all, fields(blob.digest=%digest))]
    async fn has(&self, digest: &Sha256Digest) -> Result<bool, Error> {
        let resp = self
            .grpc_client
            .clone()
            .has(self.request(proto::HasBlobRequest {
                digest: digest.clone().into(),
            }))
            .await?;

        Ok(resp.into_inner().has)
    }

    #[instrument(skip_all, fields(blob.digest=%digest), err)]
    async fn get(
        &self,
        digest: &Sha256Digest,
    ) -> Result<BoxStream<'static, Result<Bytes, Error>>, Error> {
        let resp = self
            .grpc_client
            .clone()
            .get(self.request(proto::GetBlobRequest {
                digest: digest.clone().into(),
            }))
            .await?;

        Ok(Box::pin(resp.into_inner().map(|item| {
            item.map(|chunk| chunk.data).map_err(Error::from)
        })))
    }

    #[instrument(skip_all, fields(digests.len = digests.len()))]
    async fn wants(&self, digests: Vec<Sha256Digest>) -> Result<Vec<Sha256Digest>, Error> {
        let resp = self
            .grpc_client
            .clone()
            .wants(self.request(proto::WantsRequest {
                digests: digests.into_iter().map(Into::into).collect(),
            }))
            .await?;

        resp.into_inner()
            .digests
            .into_iter()
            .map(|d| Sha256Digest::try_from(d).map_err(invalid_digest))
            .collect()
    }

    #[instrument(skip(self))]
    async fn hashes(
        &self,
        offs: u64,
    ) -> Result<BoxStream<'static, Result<SyncEntry, Error>>, Error> {
        let resp = self
            .grpc_client
            .clone()
            .hashes(self.request(proto::HashesRequest { offset: offs }))
            .await?;

        Ok(Box::pin(resp.into_inner().map(|item| {
            let item = item.map_err(Error::from)?;
            Ok(SyncEntry {
                offset: item.offset,
                digest: item.digest.try_into().map_err(invalid_digest)?,
                size: item.size,
            })
        })))
    }

    #[instrument(skip(self))]
    async fn history(
        &self,
        tick: u64,
        tock: Option<u64>,
    ) -> Result<BoxStream<'static, Result<HistoryEntry, Error>>, Error> {
        let resp = self
            .grpc_client
            .clone()
            .history(self.request(proto::HistoryRequest { tick, tock }))
            .await?;

        Ok(Box::pin(resp.into_inner().map(|item| {
            let item = item.map_err(Error::from)?;
            Ok(HistoryEntry {
                time: item.time,
                digest: item.digest.try_into().map_err(invalid_digest)?,
                size: item.size,
            })
        })))
    }

    /// Streams the chunks to the remote `Put`, which hashes and dedups
    /// server-side and answers with the digest it saw.
    #[instrument(skip_all, fields(blob.digest=%digest), err)]
    async fn save(&self, digest: Sha256Digest, mut chunks: ChunkStream) -> Result<u64, Error> {
        let (tx, rx) = mpsc::channel::<proto::BlobChunk>(10);

        // spawn the gRPC put request, which will read from the rx side.
        let task = tokio::spawn({
            let mut grpc_client = self.grpc_client.clone();
            let request = self.request(ReceiverStream::new(rx));
            async move { grpc_client.put(request).await }
        });

        'feed: loop {
            match chunks.try_next().await {
                Ok(None) => break 'feed,
                Ok(Some(mut byts)) => {
                    // tonic buffers whole messages; keep frames well under
                    // its default size limits.
                    while !byts.is_empty() {
                        let frame = byts.split_to(cmp::min(proto::RPC_CHUNK_SIZE, byts.len()));
                        if tx.send(proto::BlobChunk { data: frame }).await.is_err() {
                            // server went away early; surface its error below
                            break 'feed;
                        }
                    }
                }
                Err(e) => {
                    // Abort the call outright, so the server never commits
                    // a truncated blob under the wrong digest.
                    task.abort();
                    let _ = task.await;
                    return Err(e.into());
                }
            }
        }
        drop(tx);

        let resp = task.await?.map_err(Error::from)?.into_inner();

        let got: Sha256Digest = resp.digest.try_into().map_err(invalid_digest)?;
        if got != digest {
            return Err(Error::StorageError(format!(
                "digest mismatch: expected {}, got {}",
                digest, got
            )));
        }

        Ok(resp.size)
    }

    #[instrument(skip(self))]
    async fn metrics(&self) -> Result<MetricsSnapshot, Error> {
        let resp = self
            .grpc_client
            .clone()
            .metrics(self.request(proto::MetricsRequest {}))
            .await?;

        let resp = resp.into_inner();
        Ok(MetricsSnapshot {
            file_count: resp.file_count,
            size_bytes: resp.size_bytes,
        })
    }
}
