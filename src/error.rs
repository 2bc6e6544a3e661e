//! Error types for the tunnel.

use thiserror::Error;

/// Result type alias for tunnel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while establishing or running a tunnel session.
///
/// Every variant is fatal to the session that produced it and to nothing
/// else: the owner closes both connections and moves on.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed, truncated or undecryptable handshake frame
    #[error("handshake error: {0}")]
    Handshake(String),

    /// Outbound connection to the declared target failed or timed out
    #[error("target {target} unreachable: {reason}")]
    TargetUnreachable {
        /// The `host:port` the peer asked for
        target: String,
        /// Why the connect attempt failed
        reason: String,
    },

    /// Token failed authentication, was malformed, or fell outside the freshness window
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// Read/write failure or reset on an established connection
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// A bounded wait elapsed
    #[error("timed out after {0}ms")]
    Timeout(u64),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// The local application spoke broken or unsupported SOCKS5
    #[error("SOCKS5 error: {0}")]
    Socks5(String),
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Handshake,
    TargetUnreachable,
    Integrity,
    Transport,
    Config,
    Socks5,
}

/// SOCKS5 reply: general SOCKS server failure.
pub const SOCKS5_REPLY_GENERAL_FAILURE: u8 = 0x01;

/// SOCKS5 reply: host unreachable.
pub const SOCKS5_REPLY_HOST_UNREACHABLE: u8 = 0x04;

impl Error {
    /// Create a new handshake error
    pub fn handshake(msg: impl Into<String>) -> Self {
        Error::Handshake(msg.into())
    }

    /// Create a new integrity error
    pub fn integrity(msg: impl Into<String>) -> Self {
        Error::Integrity(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new SOCKS5 negotiation error
    pub fn socks5(msg: impl Into<String>) -> Self {
        Error::Socks5(msg.into())
    }

    /// Create a target-unreachable error
    pub fn unreachable(target: impl ToString, reason: impl ToString) -> Self {
        Error::TargetUnreachable {
            target: target.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Classify this error. Timeouts count as transport failures.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Handshake(_) => ErrorKind::Handshake,
            Error::TargetUnreachable { .. } => ErrorKind::TargetUnreachable,
            Error::Integrity(_) => ErrorKind::Integrity,
            Error::Transport(_) | Error::Timeout(_) => ErrorKind::Transport,
            Error::Config(_) => ErrorKind::Config,
            Error::Socks5(_) => ErrorKind::Socks5,
        }
    }

    /// SOCKS5 reply code to send the local application when a tunnel
    /// could not be opened because of this error.
    pub fn socks5_reply(&self) -> u8 {
        match self {
            Error::TargetUnreachable { .. } | Error::Timeout(_) => SOCKS5_REPLY_HOST_UNREACHABLE,
            _ => SOCKS5_REPLY_GENERAL_FAILURE,
        }
    }

    /// Check if this error indicates tampering or a key mismatch
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, Error::Integrity(_))
    }
}
