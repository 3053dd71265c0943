//! A write buffer that keeps small payloads in memory and transparently
//! spills to a temporary file once they grow past [SPOOL_MAX_SIZE].
//!
//! Upload sessions stage their bytes here until the digest is known; the
//! temporary file is deleted when the buffer is dropped, on every exit path.

use std::io;

use bytes::Bytes;
use futures::stream::BoxStream;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Spill threshold: buffers larger than this move to a temporary file.
pub const SPOOL_MAX_SIZE: usize = 10 * 1024 * 1024;

enum Backing {
    Memory(Vec<u8>),
    File(async_tempfile::TempFile),
}

pub struct SpooledBuffer {
    backing: Backing,
    size: u64,
}

impl Default for SpooledBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl SpooledBuffer {
    pub fn new() -> Self {
        Self {
            backing: Backing::Memory(Vec::new()),
            size: 0,
        }
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Whether the buffer has moved to its temporary file.
    pub fn is_spilled(&self) -> bool {
        matches!(self.backing, Backing::File(_))
    }

    /// Append bytes, spilling to a temporary file when the in-memory buffer
    /// exceeds [SPOOL_MAX_SIZE].
    pub async fn write(&mut self, byts: &[u8]) -> io::Result<()> {
        self.size += byts.len() as u64;

        match &mut self.backing {
            Backing::Memory(buf) => {
                buf.extend_from_slice(byts);
                if buf.len() > SPOOL_MAX_SIZE {
                    let mut fd = async_tempfile::TempFile::new()
                        .await
                        .map_err(tempfile_error)?;
                    fd.write_all(buf).await?;
                    self.backing = Backing::File(fd);
                }
                Ok(())
            }
            Backing::File(fd) => fd.write_all(byts).await,
        }
    }

    /// Consume the buffer and return its contents as a stream of chunks of
    /// at most `chunk_size` bytes, in write order.
    pub fn into_chunks(self, chunk_size: usize) -> BoxStream<'static, io::Result<Bytes>> {
        match self.backing {
            Backing::Memory(buf) => {
                let mut byts = Bytes::from(buf);
                Box::pin(async_stream::try_stream! {
                    while !byts.is_empty() {
                        let take = std::cmp::min(chunk_size, byts.len());
                        yield byts.split_to(take);
                    }
                })
            }
            Backing::File(mut fd) => Box::pin(async_stream::try_stream! {
                fd.rewind().await?;
                let mut buf = vec![0u8; chunk_size];
                loop {
                    let n = read_full(&mut fd, &mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    yield Bytes::copy_from_slice(&buf[..n]);
                }
            }),
        }
    }
}

/// Fill `buf` from the reader, stopping early only at EOF.
/// Returns the number of bytes read.
async fn read_full<R: AsyncRead + Unpin>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut n = 0;
    while n < buf.len() {
        let m = r.read(&mut buf[n..]).await?;
        if m == 0 {
            break;
        }
        n += m;
    }
    Ok(n)
}

fn tempfile_error(e: async_tempfile::Error) -> io::Error {
    match e {
        async_tempfile::Error::Io(io_error) => io_error,
        async_tempfile::Error::InvalidFile => {
            io::Error::new(io::ErrorKind::NotFound, "invalid or missing file specified")
        }
        async_tempfile::Error::InvalidDirectory => io::Error::new(
            io::ErrorKind::NotFound,
            "invalid or missing directory specified",
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::{SpooledBuffer, SPOOL_MAX_SIZE};
    use futures::TryStreamExt;

    async fn collect(spool: SpooledBuffer, chunk_size: usize) -> Vec<bytes::Bytes> {
        spool
            .into_chunks(chunk_size)
            .try_collect()
            .await
            .expect("stream must not fail")
    }

    #[tokio::test]
    async fn empty_yields_no_chunks() {
        let spool = SpooledBuffer::new();
        assert!(spool.is_empty());
        assert!(collect(spool, 1024).await.is_empty());
    }

    #[tokio::test]
    async fn small_stays_in_memory() {
        let mut spool = SpooledBuffer::new();
        spool.write(b"hello world").await.expect("write must succeed");

        assert!(!spool.is_spilled());
        assert_eq!(spool.len(), 11);

        let chunks = collect(spool, 4).await;
        assert!(chunks.iter().all(|c| c.len() <= 4));
        assert_eq!(chunks.concat(), b"hello world");
    }

    #[tokio::test]
    async fn large_spills_to_disk() {
        let slice = vec![0xa5u8; 1024 * 1024];

        let mut spool = SpooledBuffer::new();
        for _ in 0..11 {
            spool.write(&slice).await.expect("write must succeed");
        }

        assert!(spool.is_spilled());
        assert_eq!(spool.len() as usize, 11 * 1024 * 1024);

        let chunks = collect(spool, 4 * 1024 * 1024).await;
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 4 * 1024 * 1024);
        assert_eq!(chunks[2].len(), 3 * 1024 * 1024);
        assert!(chunks.concat().iter().all(|b| *b == 0xa5));
    }

    #[tokio::test]
    async fn spills_exactly_past_threshold() {
        let mut spool = SpooledBuffer::new();
        spool.write(&vec![0u8; SPOOL_MAX_SIZE]).await.expect("write must succeed");
        assert!(!spool.is_spilled());

        spool.write(b"x").await.expect("write must succeed");
        assert!(spool.is_spilled());
    }
}
