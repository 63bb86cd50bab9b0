use thiserror::Error;

use crate::types::EntityId;

pub type CfsResult<T> = Result<T, CfsError>;

/// Reasons a header (or tail) failed validation.
///
/// These never reach an application as a hard failure: a file whose header
/// does not validate is treated as a plain, unencrypted file.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
    #[error("bad magic: {found:#010x}")]
    BadMagic { found: u32 },

    #[error("unsupported header version {0}")]
    UnsupportedVersion(u32),

    #[error("header block size {block_size} out of bounds (payload {payload_size})")]
    BlockSize { block_size: u32, payload_size: u32 },

    #[error("payload CRC mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    PayloadCrc { stored: u32, computed: u32 },

    #[error("buffer too short: {len} bytes, need {needed}")]
    Truncated { len: usize, needed: usize },

    #[error("tail marker invalid")]
    TailMarker,

    #[error("file layout inconsistent: {0}")]
    Layout(String),
}

#[derive(Debug, Error)]
pub enum CfsError {
    #[error("integrity error: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("key broker did not answer within {timeout_ms} ms")]
    PolicyTimeout { timeout_ms: u64 },

    #[error("key broker busy after {attempts} attempts")]
    KeyBrokerBusy { attempts: u32 },

    #[error("no key agent connected")]
    KeyBrokerUnavailable,

    #[error("key response cookie {got} does not match in-flight request {expected}")]
    StaleCookie { expected: u32, got: u32 },

    #[error("key request rejected: {0}")]
    KeyRejected(String),

    #[error("migration failed (committed: {committed}): {reason}")]
    Migration { committed: bool, reason: String },

    #[error("handle revoked: policy for entity {from} was removed")]
    Doomed { from: EntityId },

    #[error("alignment violation: {0}")]
    Alignment(String),

    #[error("on-disk policy does not match the entity policy")]
    PolicyMismatch,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid handle {0}")]
    InvalidHandle(u64),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("engine is shutting down")]
    ShuttingDown,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CfsError {
    /// True for errors that indicate the file simply is not encrypted.
    pub fn is_integrity(&self) -> bool {
        matches!(self, CfsError::Integrity(_))
    }

    /// True for the terminal error returned on I/O against a revoked handle.
    pub fn is_doomed(&self) -> bool {
        matches!(self, CfsError::Doomed { .. })
    }
}
