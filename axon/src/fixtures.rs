use std::sync::LazyLock;

use bytes::Bytes;
use sha2::{Digest as _, Sha256};

use crate::Sha256Digest;

fn sha256(byts: &[u8]) -> Sha256Digest {
    <[u8; 32]>::from(Sha256::digest(byts)).into()
}

// 5 bytes
pub static BLOB_A: LazyLock<Bytes> = LazyLock::new(|| Bytes::from_static(b"hello"));
pub static BLOB_A_DIGEST: LazyLock<Sha256Digest> = LazyLock::new(|| sha256(&BLOB_A));

// 1 MiB
pub static BLOB_B: LazyLock<Bytes> =
    LazyLock::new(|| (0..=255).collect::<Vec<u8>>().repeat(4 * 1024).into());
pub static BLOB_B_DIGEST: LazyLock<Sha256Digest> = LazyLock::new(|| sha256(&BLOB_B));

/// All-zeroes, not the digest of anything we store.
pub static DUMMY_DIGEST: LazyLock<Sha256Digest> = LazyLock::new(|| [0u8; 32].into());
