//! Error codes for repository directory operations.
//!
//! Every directory operation returns a code from this closed enumeration.
//! I/O failures on the memory pool or the journal are not represented here:
//! they are fatal, and the affected subsystem panics so the process can be
//! restarted from the last checkpoint plus journal.

/// Operation result codes, as seen by the RPC boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    #[error("name not found")]
    NotFound,

    #[error("permission denied")]
    NoPermission,

    #[error("name in use")]
    NameInUse,

    #[error("inappropriate operation for this directory kind")]
    Inappropriate,

    #[error("would violate the replication agreement")]
    NotMaster,

    #[error("name component too long")]
    NameTooLong,

    #[error("remote evaluator unreachable")]
    RpcFailure,

    #[error("not a directory")]
    NotADirectory,

    #[error("is a directory")]
    IsADirectory,

    #[error("invalid arguments")]
    InvalidArgs,

    #[error("name would exceed the 32-byte longid envelope")]
    LongIdOverflow,

    #[error("out of space")]
    OutOfSpace,
}

pub type Result<T> = std::result::Result<T, RepositoryError>;
