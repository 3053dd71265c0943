use thiserror::Error;
use tokio::task::JoinError;
use tonic::{Code, Status};

/// Errors surfaced by the store and its RPC wrapper.
#[derive(Debug, Error, PartialEq)]
pub enum Error {
    /// The requested digest has no size entry.
    #[error("no such file: sha256:{0}")]
    NoSuchFile(String),

    /// The calling identity lacks the required capability.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// An upload session was finalized while its chunk stream was
    /// still being drained.
    #[error("upload session is finalized")]
    UploadFinished,

    #[error("internal storage error: {0}")]
    StorageError(String),
}

impl From<crate::digests::Error> for Error {
    fn from(value: crate::digests::Error) -> Self {
        Error::InvalidRequest(value.to_string())
    }
}

impl From<JoinError> for Error {
    fn from(value: JoinError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<Error> for Status {
    fn from(value: Error) -> Self {
        match value {
            Error::NoSuchFile(msg) => Status::not_found(format!("no such file: sha256:{}", msg)),
            Error::Unauthorized(msg) => Status::permission_denied(msg),
            Error::InvalidRequest(msg) => Status::invalid_argument(msg),
            Error::UploadFinished => Status::aborted("upload session is finalized"),
            Error::StorageError(msg) => Status::data_loss(format!("storage error: {}", msg)),
        }
    }
}

impl From<Status> for Error {
    fn from(value: Status) -> Self {
        match value.code() {
            Code::NotFound => {
                let msg = value.message();
                Error::NoSuchFile(
                    msg.strip_prefix("no such file: sha256:")
                        .unwrap_or(msg)
                        .to_string(),
                )
            }
            Code::PermissionDenied => Error::Unauthorized(value.message().to_string()),
            Code::InvalidArgument => Error::InvalidRequest(value.message().to_string()),
            Code::Aborted => Error::UploadFinished,
            _ => Error::StorageError(value.to_string()),
        }
    }
}

impl From<crate::channel::Error> for Error {
    fn from(value: crate::channel::Error) -> Self {
        Self::StorageError(value.to_string())
    }
}

impl From<redb::Error> for Error {
    fn from(value: redb::Error) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(value: redb::DatabaseError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::TableError> for Error {
    fn from(value: redb::TableError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::TransactionError> for Error {
    fn from(value: redb::TransactionError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::StorageError> for Error {
    fn from(value: redb::StorageError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::CommitError> for Error {
    fn from(value: redb::CommitError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        match value.kind() {
            std::io::ErrorKind::InvalidInput => Error::InvalidRequest(value.to_string()),
            std::io::ErrorKind::Interrupted => Error::UploadFinished,
            _ => Error::StorageError(value.to_string()),
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::NoSuchFile(msg) => Self::new(std::io::ErrorKind::NotFound, msg),
            Error::Unauthorized(msg) => Self::new(std::io::ErrorKind::PermissionDenied, msg),
            Error::InvalidRequest(msg) => Self::new(std::io::ErrorKind::InvalidInput, msg),
            Error::UploadFinished => {
                Self::new(std::io::ErrorKind::Interrupted, "upload session is finalized")
            }
            Error::StorageError(msg) => Self::new(std::io::ErrorKind::Other, msg),
        }
    }
}
