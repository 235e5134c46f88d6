//! Error types for the IRC client library.
//!
//! This module defines the crate-wide error taxonomy: codec failures,
//! transport faults, protocol violations, and lifecycle errors.

use thiserror::Error;

/// Convenience type alias for Results using [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Top-level client errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Raw wire text failed the message grammar.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Codec or configuration inputs violate structural rules.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A serialized command part or tag part exceeds its length budget.
    #[error("command too long: {part} is {len} bytes, budget {budget}")]
    CommandTooLong {
        /// Which serialized fragment overflowed ("command" or "tags").
        part: &'static str,
        /// Actual serialized length in bytes.
        len: usize,
        /// The applicable budget in bytes.
        budget: usize,
    },

    /// Socket, TLS, or pipe-level failure.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The peer broke the protocol in a way that cannot be recovered from.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Cooperative cancellation was observed.
    #[error("operation cancelled")]
    Cancelled,

    /// Every configured server was tried `1 + connect_retries` times.
    #[error("connection attempts exhausted after {attempts} tries")]
    ConnectExhausted {
        /// Total number of per-server attempts made.
        attempts: usize,
    },

    /// The rate limiter declined to issue a lease.
    #[error("rate limit rejected: {reason}")]
    RateLimitRejected {
        /// Limiter-supplied reason phrase.
        reason: String,
    },

    /// An invariant violation was detected in the state store.
    #[error("bad state: {0}")]
    BadState(String),

    /// The client was used after `dispose`.
    #[error("client has been disposed")]
    Disposed,
}

impl Error {
    /// True for errors that indicate the connection can no longer be trusted.
    pub fn is_fatal_for_connection(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::ProtocolViolation(_) | Error::BadState(_)
        )
    }
}
