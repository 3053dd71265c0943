//! Per-client upload sessions.
//!
//! A session stages incoming bytes in a [SpooledBuffer] while keeping a
//! rolling SHA-256, so the digest is known the moment the client commits.
//! If the store already has the digest, commit skips all writes and the
//! client still receives the digest it produced.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::TryStreamExt;
use sha2::{Digest as _, Sha256};
use tracing::instrument;

use crate::service::AxonService;
use crate::spool::SpooledBuffer;
use crate::{Error, Sha256Digest, CHUNK_SIZE};

pub struct UploadSession {
    axon: Arc<dyn AxonService>,

    /// The spooled bytes, or None once saved or closed.
    spool: Option<SpooledBuffer>,

    sha256: Sha256,
    size: u64,

    /// Set on close; observed by the chunk stream between chunks.
    fini: Arc<AtomicBool>,
}

/// A clonable handle that finalizes its session from elsewhere,
/// e.g. when the owning connection goes away.
#[derive(Clone)]
pub struct UploadFinisher(Arc<AtomicBool>);

impl UploadFinisher {
    pub fn fini(&self) {
        self.0.store(true, Ordering::Release);
    }
}

impl UploadSession {
    pub fn new(axon: Arc<dyn AxonService>) -> Self {
        Self {
            axon,
            spool: Some(SpooledBuffer::new()),
            sha256: Sha256::new(),
            size: 0,
            fini: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Bytes written so far.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn finisher(&self) -> UploadFinisher {
        UploadFinisher(self.fini.clone())
    }

    /// Finalize the session without committing. The spool is released.
    pub fn close(&mut self) {
        self.fini.store(true, Ordering::Release);
        self.spool = None;
    }

    /// Append bytes to the session.
    pub async fn write(&mut self, byts: &[u8]) -> Result<(), Error> {
        if self.fini.load(Ordering::Acquire) {
            return Err(Error::UploadFinished);
        }
        let spool = self
            .spool
            .as_mut()
            .ok_or_else(|| Error::InvalidRequest("upload already saved".to_string()))?;

        self.size += byts.len() as u64;
        self.sha256.update(byts);
        spool.write(byts).await?;

        Ok(())
    }

    /// Commit the session, at most once. Returns the session size and the
    /// digest of the written bytes. If the store already has the digest,
    /// nothing is written.
    #[instrument(skip(self), fields(upload.size = self.size))]
    pub async fn save(&mut self) -> Result<(u64, Sha256Digest), Error> {
        let spool = self
            .spool
            .take()
            .ok_or_else(|| Error::InvalidRequest("upload already saved".to_string()))?;
        if self.fini.load(Ordering::Acquire) {
            return Err(Error::UploadFinished);
        }

        let digest: Sha256Digest = <[u8; 32]>::from(self.sha256.clone().finalize()).into();
        let size = self.size;

        if self.axon.has(&digest).await? {
            return Ok((size, digest));
        }

        let fini = self.fini.clone();
        let inner = spool.into_chunks(CHUNK_SIZE);
        let chunks = Box::pin(async_stream::try_stream! {
            futures::pin_mut!(inner);
            while let Some(byts) = inner.try_next().await? {
                if fini.load(Ordering::Acquire) {
                    Err(io::Error::new(
                        io::ErrorKind::Interrupted,
                        "upload session is finalized",
                    ))?;
                }
                yield byts;
            }
        });

        self.axon.save(digest.clone(), chunks).await?;

        Ok((size, digest))
    }
}
