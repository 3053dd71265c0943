#[cfg(test)]
use rstest_reuse;

mod digests;
mod errors;

pub mod channel;
pub mod fixtures;
pub mod perms;
pub mod proto;
pub mod service;
pub mod spool;
pub mod upload;

pub use digests::{Sha256Digest, SHA256_LEN};
pub use errors::Error;

/// Maximum size of a single chunk record in the blob database.
/// Blobs larger than this are split; only the final chunk may be shorter.
pub const CHUNK_SIZE: usize = 16 * 1024 * 1024;
