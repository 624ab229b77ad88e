//! Error taxonomy shared by the event engine, relay plumbing and order sessions.

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the core.
///
/// The type is `Clone` because a single transport failure is broadcast to every
/// subscription and session that depends on the connection.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum Error {
    /// Malformed filter, tag, frame argument or order payload.
    #[error("validation error: {0}")]
    Validation(String),

    /// Signing or verification failure, or missing/malformed key material.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Connection-level failure. Terminates the affected connection.
    #[error("transport error: {0}")]
    Transport(String),

    /// Frame that does not match any recognized type or arity.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No confirmation arrived within the budget.
    #[error("no confirmation within {0:?}")]
    Timeout(Duration),

    /// Send attempted on a connection that is closing, closed or errored.
    #[error("relay connection is not open")]
    NotConnected,

    /// The relay answered `OK false` for a published event.
    #[error("relay rejected event {event_id}: {reason}")]
    Rejected { event_id: String, reason: String },

    /// The caller cancelled the order session.
    #[error("order session cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub(crate) fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }
}

impl From<secp256k1::Error> for Error {
    fn from(e: secp256k1::Error) -> Self {
        Error::Crypto(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Transport(e.to_string())
    }
}
