use thiserror::Error;
use xchg_core::CallStatus;

/// Result type for peer operations.
pub type Result<T> = std::result::Result<T, PeerError>;

/// One error value per failed call; no partial payloads.
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("call timed out")]
    Timeout,

    /// Every configured transport was unavailable or failed to send.
    #[error("no transport could deliver the call: {0}")]
    NoTransport(String),

    #[error("auth failed: {0}")]
    AuthFailed(String),

    /// Wrong session or rejected counter; the session has been dropped.
    #[error("session rejected: {0}")]
    Session(String),

    #[error("remote error ({status:?}): {message}")]
    Remote { status: CallStatus, message: String },

    #[error("remote key does not match the called address")]
    AddressMismatch,

    #[error("malformed response: {0}")]
    Protocol(String),

    #[error("peer is shutting down")]
    Shutdown,

    #[error(transparent)]
    Call(#[from] xchg_core::call::CallError),

    #[error(transparent)]
    Crypto(#[from] xchg_core::CryptoError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http relay: {0}")]
    Http(#[from] reqwest::Error),
}

impl PeerError {
    /// Remote application error text, if the callee's processor failed.
    pub fn remote_message(&self) -> Option<&str> {
        match self {
            Self::Remote { message, .. } => Some(message),
            _ => None,
        }
    }
}
