use std::io;

use bytes::Bytes;
use futures::stream::BoxStream;
use sha2::{Digest as _, Sha256};
use tonic::async_trait;

use crate::{Error, Sha256Digest};

mod from_addr;
mod grpc;
mod redb;

#[cfg(test)]
mod tests;

pub use self::from_addr::from_addr;
pub use self::grpc::GRPCAxonService;
pub use self::redb::RedbAxonService;

/// A lazy, single-pass sequence of byte chunks feeding a commit.
/// Chunks may be of arbitrary size; the store re-slices them on write.
pub type ChunkStream = BoxStream<'static, io::Result<Bytes>>;

/// One record of the dense append-only sync sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEntry {
    pub offset: u64,
    pub digest: Sha256Digest,
    pub size: u64,
}

/// One record of the time-indexed ingest history.
/// Times are milliseconds since the unix epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub time: u64,
    pub digest: Sha256Digest,
    pub size: u64,
}

/// Snapshot of the persistent counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    #[serde(rename = "file:count")]
    pub file_count: u64,
    #[serde(rename = "size:bytes")]
    pub size_bytes: u64,
}

/// The base trait all Axon services need to implement.
///
/// A blob is identified by the SHA-256 digest of its bytes; storing the same
/// bytes twice stores them once. Every successful ingest appends one entry to
/// the history log and one to the sync sequence, and bumps the counters.
///
/// Capability checks live at the RPC layer, not here.
#[async_trait]
pub trait AxonService: Send + Sync {
    /// Check if the service has the blob, by its content hash.
    async fn has(&self, digest: &Sha256Digest) -> Result<bool, Error>;

    /// Request a blob from the store, as a stream of chunks in blob order.
    /// Fails with [Error::NoSuchFile] if the blob is not stored.
    async fn get(
        &self,
        digest: &Sha256Digest,
    ) -> Result<BoxStream<'static, Result<Bytes, Error>>, Error>;

    /// Out of a list of digests, return the ones not yet stored,
    /// preserving input order.
    async fn wants(&self, digests: Vec<Sha256Digest>) -> Result<Vec<Sha256Digest>, Error> {
        let mut missing = Vec::new();
        for digest in digests {
            if !self.has(&digest).await? {
                missing.push(digest);
            }
        }
        Ok(missing)
    }

    /// Iterate the sync sequence starting at the given offset.
    /// The stream ends at the current tail; callers reissue to catch up.
    async fn hashes(
        &self,
        offs: u64,
    ) -> Result<BoxStream<'static, Result<SyncEntry, Error>>, Error>;

    /// Iterate history entries with `tick <= time` (`< tock`, if given),
    /// in ascending time order.
    async fn history(
        &self,
        tick: u64,
        tock: Option<u64>,
    ) -> Result<BoxStream<'static, Result<HistoryEntry, Error>>, Error>;

    /// Commit a blob under the given digest, consuming the chunk stream.
    /// If the blob is already stored the stream is discarded unread.
    /// Returns the stored size.
    async fn save(&self, digest: Sha256Digest, chunks: ChunkStream) -> Result<u64, Error>;

    /// Store a single in-memory blob, returning its size and digest.
    async fn put(&self, byts: Bytes) -> Result<(u64, Sha256Digest), Error> {
        let digest: Sha256Digest = <[u8; 32]>::from(Sha256::digest(&byts)).into();
        let size = self
            .save(
                digest.clone(),
                Box::pin(futures::stream::once(async move { Ok(byts) })),
            )
            .await?;
        Ok((size, digest))
    }

    /// Store a batch of in-memory blobs; results are positional.
    async fn puts(&self, files: Vec<Bytes>) -> Result<Vec<(u64, Sha256Digest)>, Error> {
        let mut out = Vec::with_capacity(files.len());
        for byts in files {
            out.push(self.put(byts).await?);
        }
        Ok(out)
    }

    /// Snapshot of the persistent counters.
    async fn metrics(&self) -> Result<MetricsSnapshot, Error>;
}
