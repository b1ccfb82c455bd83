use thiserror::Error;

#[derive(Error, Debug)]
pub enum Pws3Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Authentication failed: passphrase does not match stored verification hash")]
    AuthenticationFailed,

    #[error("Corrupt header: {0}")]
    CorruptHeader(String),

    #[error("Unsupported version: {0}")]
    UnsupportedVersion(String),

    /// Control signal: the end-of-stream sentinel was reached. Not a fault;
    /// callers stop requesting blocks when they see this.
    #[error("End of record stream")]
    EndOfStream,

    #[error("Integrity check failed: HMAC trailer does not match record stream")]
    IntegrityCheckFailed,

    #[error("Invalid buffer length: {0}. Must be a positive multiple of 16")]
    InvalidBufferLength(usize),

    #[error("Storage was modified externally since the container was opened")]
    ConcurrentModification,

    #[error("Container was opened read-only")]
    ReadOnlyViolation,

    #[error("Invalid state: {0}")]
    InvalidState(&'static str),
}

pub type Result<T> = std::result::Result<T, Pws3Error>;
