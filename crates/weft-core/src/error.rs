//! Error types for weft.
//!
//! Error kinds map onto how the fabric reacts: crypto failures and
//! invariant violations tear down a session without reconnect, timeouts
//! and transport errors tear down and trigger reconnection, policy
//! rejects surface synchronously to the caller.

use thiserror::Error;

/// Core error type for weft operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Secure-channel failure: handshake, PSK mismatch, untrusted identity.
    #[error("cryptographic operation failed: {0}")]
    Crypto(String),

    /// Malformed wire data or an unrecognised on-disk snapshot version.
    #[error("parse error: {0}")]
    Parse(String),

    /// A bounded wait elapsed (stream read, frame feed).
    #[error("operation timed out")]
    Timeout,

    /// Raw I/O failure on a transport connection.
    #[error("transport error: {0}")]
    Transport(String),

    /// Synchronous rejection: LAN-only filter, duplicate network id,
    /// message too large, port already in use.
    #[error("policy reject: {0}")]
    Policy(String),

    /// Unexpected remote identity or protocol state; the session is torn
    /// down without reconnect.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Message store operation failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// No live session to the peer.
    #[error("no active session")]
    NoSession,
}

/// Result type alias using weft's Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether losing a session to this error should trigger a reconnect
    /// attempt to the same endpoint.
    pub fn should_reconnect(&self) -> bool {
        matches!(self, Error::Timeout | Error::Transport(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Parse(e.to_string())
    }
}
