use thiserror::Error;

/// Result type for router operations.
pub type Result<T> = std::result::Result<T, RouterError>;

/// Router errors. Routing errors go back to the immediate caller in an `Error` frame.
#[derive(Error, Debug)]
pub enum RouterError {
    #[error("no route to peer")]
    NoRoute,

    #[error("address not found")]
    AddressNotFound,

    #[error("connection not found")]
    ConnectionNotFound,

    #[error("invalid address: {0}")]
    InvalidAddress(#[from] xchg_core::AddressError),

    #[error("key error: {0}")]
    Key(#[from] xchg_core::CryptoError),

    #[error("router is already running")]
    AlreadyRunning,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RouterError {
    /// Errors reported to a peer over the wire (as opposed to local failures).
    #[must_use]
    pub const fn is_routing_error(&self) -> bool {
        matches!(
            self,
            Self::NoRoute | Self::AddressNotFound | Self::ConnectionNotFound | Self::InvalidAddress(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_messages() {
        assert_eq!(RouterError::NoRoute.to_string(), "no route to peer");
        assert!(RouterError::AddressNotFound.is_routing_error());
        let io = RouterError::from(std::io::Error::new(std::io::ErrorKind::Other, "x"));
        assert!(!io.is_routing_error());
    }
}
