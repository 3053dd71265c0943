use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::TryStreamExt;
use parking_lot::Mutex;
use redb::{Database, ReadableTable, TableDefinition};
use tonic::async_trait;
use tracing::instrument;

use super::{AxonService, ChunkStream, HistoryEntry, MetricsSnapshot, SyncEntry};
use crate::{Error, Sha256Digest, CHUNK_SIZE, SHA256_LEN};

// axon.redb
const SIZES_TABLE: TableDefinition<[u8; SHA256_LEN], u64> = TableDefinition::new("sizes");
const HISTORY_TABLE: TableDefinition<(u64, u64), ([u8; SHA256_LEN], u64)> =
    TableDefinition::new("history");
const SEQN_TABLE: TableDefinition<u64, ([u8; SHA256_LEN], u64)> = TableDefinition::new("axonseqn");
const METRICS_TABLE: TableDefinition<&str, u64> = TableDefinition::new("metrics");

// blob.redb, keyed digest ∥ bigendian_u64(chunk index)
const BLOBS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("blobs");

const METRIC_FILE_COUNT: &str = "file:count";
const METRIC_SIZE_BYTES: &str = "size:bytes";

/// Entries fetched per blocking section when streaming the history log or
/// the sync sequence.
const SCAN_PAGE_SIZE: usize = 256;

/// The store itself: two redb databases, one for bookkeeping (sizes,
/// history, sync sequence, metrics) and one for the chunked blob payloads.
///
/// All redb work happens inside `spawn_blocking` sections that never span an
/// await point; every chunk boundary during ingest and every streamed item
/// during reads is a suspension point.
#[derive(Clone)]
pub struct RedbAxonService {
    // Wrapped in Arcs so the databases can move into spawn_blocking,
    // as discussed in https://github.com/cberner/redb/issues/789
    axon_db: Arc<Database>,
    blob_db: Arc<Database>,

    /// Commits are serialized per digest, so a concurrent save of the same
    /// blob waits and then dedups instead of double-counting bookkeeping.
    commit_locks: Arc<Mutex<HashMap<[u8; SHA256_LEN], Weak<tokio::sync::Mutex<()>>>>>,
}

impl RedbAxonService {
    /// Opens (or creates) the store inside the given data directory,
    /// using `axon.redb` and `blob.redb` in it.
    pub async fn new(path: PathBuf) -> Result<Self, Error> {
        if path == PathBuf::from("/") {
            return Err(Error::StorageError(
                "cowardly refusing to use / as a data directory".to_string(),
            ));
        }

        let (axon_db, blob_db) = tokio::task::spawn_blocking(move || -> Result<_, Error> {
            std::fs::create_dir_all(&path)?;

            let axon_db = Database::create(path.join("axon.redb"))?;
            create_axon_schema(&axon_db)?;

            let blob_db = Database::create(path.join("blob.redb"))?;
            create_blob_schema(&blob_db)?;

            Ok((axon_db, blob_db))
        })
        .await??;

        Ok(Self {
            axon_db: Arc::new(axon_db),
            blob_db: Arc::new(blob_db),
            commit_locks: Default::default(),
        })
    }

    /// Constructs a throwaway instance on the in-memory backend.
    pub fn new_temporary() -> Result<Self, Error> {
        let axon_db =
            Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        create_axon_schema(&axon_db)?;

        let blob_db =
            Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        create_blob_schema(&blob_db)?;

        Ok(Self {
            axon_db: Arc::new(axon_db),
            blob_db: Arc::new(blob_db),
            commit_locks: Default::default(),
        })
    }

    async fn get_size(&self, digest: &Sha256Digest) -> Result<Option<u64>, Error> {
        let db = self.axon_db.clone();
        let key: [u8; SHA256_LEN] = digest.into();

        tokio::task::spawn_blocking(move || -> Result<Option<u64>, Error> {
            let txn = db.begin_read()?;
            let table = txn.open_table(SIZES_TABLE)?;
            Ok(table.get(key)?.map(|g| g.value()))
        })
        .await?
    }

    /// One chunk, one write transaction. Idempotent: chunk keys are
    /// deterministic in the digest, so re-ingesting the same blob rewrites
    /// identical records.
    async fn put_chunk(
        &self,
        digest: [u8; SHA256_LEN],
        index: u64,
        byts: Bytes,
    ) -> Result<(), Error> {
        let db = self.blob_db.clone();

        tokio::task::spawn_blocking(move || -> Result<(), Error> {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(BLOBS_TABLE)?;
                table.insert(chunk_key(&digest, index).as_slice(), byts.as_ref())?;
            }
            txn.commit()?;
            Ok(())
        })
        .await?
    }

    async fn lock_digest(&self, digest: &Sha256Digest) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.commit_locks.lock();
            locks.retain(|_, weak| weak.strong_count() > 0);

            let key: [u8; SHA256_LEN] = digest.into();
            match locks.get(&key).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(tokio::sync::Mutex::new(()));
                    locks.insert(key, Arc::downgrade(&lock));
                    lock
                }
            }
        };

        lock.lock_owned().await
    }
}

/// Ensures all bookkeeping tables are present.
fn create_axon_schema(db: &Database) -> Result<(), redb::Error> {
    let txn = db.begin_write()?;
    txn.open_table(SIZES_TABLE)?;
    txn.open_table(HISTORY_TABLE)?;
    txn.open_table(SEQN_TABLE)?;
    txn.open_table(METRICS_TABLE)?;
    txn.commit()?;

    Ok(())
}

fn create_blob_schema(db: &Database) -> Result<(), redb::Error> {
    let txn = db.begin_write()?;
    txn.open_table(BLOBS_TABLE)?;
    txn.commit()?;

    Ok(())
}

fn chunk_key(digest: &[u8; SHA256_LEN], index: u64) -> [u8; SHA256_LEN + 8] {
    let mut key = [0u8; SHA256_LEN + 8];
    key[..SHA256_LEN].copy_from_slice(digest);
    key[SHA256_LEN..].copy_from_slice(&index.to_be_bytes());
    key
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Advance a prefix scan over the chunk range `[digest∥from_index, digest∥u64::MAX]`
/// by one record. Restartable: every call opens a fresh read transaction.
fn scan_next(
    db: &Database,
    digest: &[u8; SHA256_LEN],
    from_index: u64,
) -> Result<Option<(u64, Bytes)>, Error> {
    let txn = db.begin_read()?;
    let table = txn.open_table(BLOBS_TABLE)?;

    let lo = chunk_key(digest, from_index);
    let hi = chunk_key(digest, u64::MAX);

    let mut range = table.range::<&[u8]>(lo.as_slice()..=hi.as_slice())?;
    match range.next() {
        None => Ok(None),
        Some(entry) => {
            let (k, v) = entry?;
            let index = k
                .value()
                .get(SHA256_LEN..)
                .and_then(|s| <[u8; 8]>::try_from(s).ok())
                .map(u64::from_be_bytes)
                .ok_or_else(|| Error::StorageError("malformed chunk key".to_string()))?;
            Ok(Some((index, Bytes::copy_from_slice(v.value()))))
        }
    }
}

fn seqn_page(db: &Database, offs: u64, limit: usize) -> Result<Vec<SyncEntry>, Error> {
    let txn = db.begin_read()?;
    let table = txn.open_table(SEQN_TABLE)?;

    let mut page = Vec::new();
    for entry in table.range(offs..)? {
        let (k, v) = entry?;
        let (digest, size) = v.value();
        page.push(SyncEntry {
            offset: k.value(),
            digest: digest.into(),
            size,
        });
        if page.len() >= limit {
            break;
        }
    }

    Ok(page)
}

type HistoryKey = (u64, u64);

fn history_page(
    db: &Database,
    from: HistoryKey,
    tock: Option<u64>,
    limit: usize,
) -> Result<Vec<(HistoryKey, HistoryEntry)>, Error> {
    let txn = db.begin_read()?;
    let table = txn.open_table(HISTORY_TABLE)?;

    let range = match tock {
        Some(tock) => table.range(from..(tock, 0u64))?,
        None => table.range(from..)?,
    };

    let mut page = Vec::new();
    for entry in range {
        let (k, v) = entry?;
        let (time, offset) = k.value();
        let (digest, size) = v.value();
        page.push((
            (time, offset),
            HistoryEntry {
                time,
                digest: digest.into(),
                size,
            },
        ));
        if page.len() >= limit {
            break;
        }
    }

    Ok(page)
}

#[async_trait]
impl AxonService for RedbAxonService {
    #[instrument(skip_all, ret, err, fields(blob.digest=%digest))]
    async fn has(&self, digest: &Sha256Digest) -> Result<bool, Error> {
        Ok(self.get_size(digest).await?.is_some())
    }

    #[instrument(skip_all, err, fields(blob.digest=%digest))]
    async fn get(
        &self,
        digest: &Sha256Digest,
    ) -> Result<BoxStream<'static, Result<Bytes, Error>>, Error> {
        // The size entry is the authoritative existence signal; chunks for
        // digests without one are invisible leftovers of aborted ingests.
        if self.get_size(digest).await?.is_none() {
            return Err(Error::NoSuchFile(digest.to_hex()));
        }

        let db = self.blob_db.clone();
        let key: [u8; SHA256_LEN] = digest.into();

        Ok(Box::pin(async_stream::try_stream! {
            let mut next = 0u64;
            loop {
                let db = db.clone();
                let item = tokio::task::spawn_blocking(move || scan_next(&db, &key, next))
                    .await
                    .map_err(Error::from)??;

                match item {
                    None => break,
                    Some((index, byts)) => {
                        next = index + 1;
                        yield byts;
                    }
                }
            }
        }))
    }

    #[instrument(skip(self))]
    async fn hashes(
        &self,
        offs: u64,
    ) -> Result<BoxStream<'static, Result<SyncEntry, Error>>, Error> {
        let db = self.axon_db.clone();

        Ok(Box::pin(async_stream::try_stream! {
            let mut next = offs;
            loop {
                let db = db.clone();
                let page = tokio::task::spawn_blocking(move || seqn_page(&db, next, SCAN_PAGE_SIZE))
                    .await
                    .map_err(Error::from)??;

                let n = page.len();
                for entry in page {
                    next = entry.offset + 1;
                    yield entry;
                }
                if n < SCAN_PAGE_SIZE {
                    break;
                }
            }
        }))
    }

    #[instrument(skip(self))]
    async fn history(
        &self,
        tick: u64,
        tock: Option<u64>,
    ) -> Result<BoxStream<'static, Result<HistoryEntry, Error>>, Error> {
        let db = self.axon_db.clone();

        Ok(Box::pin(async_stream::try_stream! {
            let mut from = (tick, 0u64);
            loop {
                let db = db.clone();
                let page = tokio::task::spawn_blocking(move || {
                    history_page(&db, from, tock, SCAN_PAGE_SIZE)
                })
                .await
                .map_err(Error::from)??;

                let n = page.len();
                for ((time, offset), entry) in page {
                    from = (time, offset + 1);
                    yield entry;
                }
                if n < SCAN_PAGE_SIZE {
                    break;
                }
            }
        }))
    }

    #[instrument(skip_all, fields(blob.digest=%digest), err)]
    async fn save(&self, digest: Sha256Digest, mut chunks: ChunkStream) -> Result<u64, Error> {
        if let Some(size) = self.get_size(&digest).await? {
            return Ok(size);
        }

        // Serialize commits per digest, and look again once we hold the
        // lock: the previous holder may have committed this very blob.
        let _guard = self.lock_digest(&digest).await;
        if let Some(size) = self.get_size(&digest).await? {
            return Ok(size);
        }

        let key: [u8; SHA256_LEN] = (&digest).into();
        let mut size = 0u64;
        let mut index = 0u64;
        let mut pending = BytesMut::new();

        while let Some(mut byts) = chunks.try_next().await.map_err(Error::from)? {
            size += byts.len() as u64;

            if !pending.is_empty() {
                let take = std::cmp::min(CHUNK_SIZE - pending.len(), byts.len());
                pending.extend_from_slice(&byts.split_to(take));
                if pending.len() == CHUNK_SIZE {
                    self.put_chunk(key, index, pending.split().freeze()).await?;
                    index += 1;
                }
            }

            while byts.len() >= CHUNK_SIZE {
                self.put_chunk(key, index, byts.split_to(CHUNK_SIZE)).await?;
                index += 1;
            }

            if !byts.is_empty() {
                pending.extend_from_slice(&byts);
            }
        }

        if !pending.is_empty() {
            self.put_chunk(key, index, pending.freeze()).await?;
        }

        // History and sync appends, counter bumps and the size entry commit
        // together. The size entry becomes visible only after all chunks
        // are durable, so `has` can never observe a half-written blob.
        let db = self.axon_db.clone();
        tokio::task::spawn_blocking(move || -> Result<(), Error> {
            let txn = db.begin_write()?;
            {
                let mut seqn = txn.open_table(SEQN_TABLE)?;
                let offset = seqn
                    .last()?
                    .map(|(k, _)| k.value() + 1)
                    .unwrap_or_default();
                seqn.insert(offset, (key, size))?;

                let mut history = txn.open_table(HISTORY_TABLE)?;
                history.insert((now_millis(), offset), (key, size))?;

                let mut metrics = txn.open_table(METRICS_TABLE)?;
                let count = metrics
                    .get(METRIC_FILE_COUNT)?
                    .map(|g| g.value())
                    .unwrap_or_default();
                metrics.insert(METRIC_FILE_COUNT, count + 1)?;
                let total = metrics
                    .get(METRIC_SIZE_BYTES)?
                    .map(|g| g.value())
                    .unwrap_or_default();
                metrics.insert(METRIC_SIZE_BYTES, total + size)?;

                let mut sizes = txn.open_table(SIZES_TABLE)?;
                sizes.insert(key, size)?;
            }
            txn.commit()?;
            Ok(())
        })
        .await??;

        Ok(size)
    }

    #[instrument(skip(self))]
    async fn metrics(&self) -> Result<MetricsSnapshot, Error> {
        let db = self.axon_db.clone();

        tokio::task::spawn_blocking(move || -> Result<MetricsSnapshot, Error> {
            let txn = db.begin_read()?;
            let table = txn.open_table(METRICS_TABLE)?;
            Ok(MetricsSnapshot {
                file_count: table
                    .get(METRIC_FILE_COUNT)?
                    .map(|g| g.value())
                    .unwrap_or_default(),
                size_bytes: table
                    .get(METRIC_SIZE_BYTES)?
                    .map(|g| g.value())
                    .unwrap_or_default(),
            })
        })
        .await?
    }
}
