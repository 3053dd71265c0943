use bytes::Bytes;
use data_encoding::HEXLOWER;
use thiserror::Error;

/// A SHA-256 digest, the primary key of every stored blob.
/// Compared byte-wise; rendered as lowercase hex.
#[derive(PartialEq, Eq, Hash)]
pub struct Sha256Digest(Bytes);

#[derive(Error, Debug, PartialEq)]
pub enum Error {
    #[error("invalid digest length: {0}")]
    InvalidDigestLen(usize),
}

pub const SHA256_LEN: usize = 32;

impl Sha256Digest {
    pub fn as_slice(&self) -> &[u8] {
        &self.0[..]
    }

    pub fn to_hex(&self) -> String {
        HEXLOWER.encode(&self.0)
    }
}

impl From<Sha256Digest> for bytes::Bytes {
    fn from(val: Sha256Digest) -> Self {
        val.0
    }
}

impl TryFrom<Vec<u8>> for Sha256Digest {
    type Error = Error;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        if value.len() != SHA256_LEN {
            Err(Error::InvalidDigestLen(value.len()))
        } else {
            Ok(Self(value.into()))
        }
    }
}

impl TryFrom<bytes::Bytes> for Sha256Digest {
    type Error = Error;

    fn try_from(value: bytes::Bytes) -> Result<Self, Self::Error> {
        if value.len() != SHA256_LEN {
            Err(Error::InvalidDigestLen(value.len()))
        } else {
            Ok(Self(value))
        }
    }
}

impl From<[u8; SHA256_LEN]> for Sha256Digest {
    fn from(value: [u8; SHA256_LEN]) -> Self {
        Self(value.to_vec().into())
    }
}

impl From<&[u8; SHA256_LEN]> for Sha256Digest {
    fn from(value: &[u8; SHA256_LEN]) -> Self {
        Self(value.to_vec().into())
    }
}

impl From<Sha256Digest> for [u8; SHA256_LEN] {
    fn from(value: Sha256Digest) -> Self {
        value.0.to_vec().try_into().unwrap()
    }
}

impl From<&Sha256Digest> for [u8; SHA256_LEN] {
    fn from(value: &Sha256Digest) -> Self {
        value.0.to_vec().try_into().unwrap()
    }
}

impl Clone for Sha256Digest {
    fn clone(&self) -> Self {
        Self(self.0.to_owned())
    }
}

impl std::fmt::Display for Sha256Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", HEXLOWER.encode(&self.0))
    }
}

impl std::fmt::Debug for Sha256Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sha256:{}", HEXLOWER.encode(&self.0))
    }
}
