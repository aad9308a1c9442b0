use thiserror::Error;

/// Errors surfaced across the node runtime.
///
/// Session-fatal kinds (`UntrustedPeer`, `IdentityMismatch`, `BadSequence`,
/// `InvalidFrame`, `Timeout`) close the session they occur on; the mesh
/// reconnects with backoff where that makes sense. `NotFound` is returned as
/// a sentinel by lookups and never aborts anything.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("address already in use on port {0}")]
    AddressInUse(u16),

    #[error("malformed pairing payload: {0}")]
    MalformedPairing(String),

    #[error("pairing nonce mismatch")]
    NonceMismatch,

    #[error("peer {0} is not trusted")]
    UntrustedPeer(String),

    #[error("hello peer id does not match the handshake identity")]
    IdentityMismatch,

    #[error("bad sequence: got {got}, expected above {expected_above}")]
    BadSequence { expected_above: u64, got: u64 },

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("handshake failed: {0}")]
    Handshake(&'static str),

    #[error("timed out during {0}")]
    Timeout(&'static str),

    #[error("not found")]
    NotFound,

    #[error("operation cancelled")]
    Cancelled,

    #[error("corrupt file: {0}")]
    CorruptFile(String),
}

pub type Result<T> = std::result::Result<T, NodeError>;
