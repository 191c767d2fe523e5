use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("key not found")]
    KeyNotFound,

    #[error("not in transaction")]
    NotInTransaction,

    #[error("write failed: {0}")]
    WriteFailed(#[source] rocksdb::Error),

    #[error("document not found during flush")]
    DocNotFound,

    #[error("storage busy, re-queue the batch")]
    Busy,

    #[error("destroy failed: {0}")]
    DestroyFailed(String),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("corrupt seqno index: {0}")]
    CorruptIndex(String),

    #[error("unknown stat: {0}")]
    UnknownStat(String),

    #[error("out of memory reported by callback")]
    OutOfMemory,

    #[error("failed to open database: {0}")]
    Open(#[source] rocksdb::Error),

    #[error("read failed: {0}")]
    Read(#[source] rocksdb::Error),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
