//! Self-certifying node address: SHA-256 of the DER public key, truncated to 30 bytes.

use std::fmt;
use std::str::FromStr;

use data_encoding::BASE32_NOPAD;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Length of an address in bytes.
pub const ADDRESS_LEN: usize = 30;

/// Routable identity of a node. Text form is lowercase base32 without padding (48 chars).
#[derive(Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Address([u8; ADDRESS_LEN]);

impl Address {
    /// Derive an address from a DER-encoded (PKCS#1) RSA public key.
    pub fn from_public_key_der(der: &[u8]) -> Self {
        let digest = Sha256::digest(der);
        let mut out = [0u8; ADDRESS_LEN];
        out.copy_from_slice(&digest[..ADDRESS_LEN]);
        Address(out)
    }

    pub fn from_bytes(bytes: [u8; ADDRESS_LEN]) -> Self {
        Address(bytes)
    }

    /// Parse raw bytes (e.g. the head of an HTTP envelope).
    pub fn from_slice(bytes: &[u8]) -> Result<Self, AddressError> {
        let arr: [u8; ADDRESS_LEN] = bytes.try_into().map_err(|_| AddressError::Length)?;
        Ok(Address(arr))
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&BASE32_NOPAD.encode(&self.0).to_ascii_lowercase())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    /// Accepts the text form with or without a leading `#`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let s = s.strip_prefix('#').unwrap_or(s);
        let bytes = BASE32_NOPAD
            .decode(s.to_ascii_uppercase().as_bytes())
            .map_err(|_| AddressError::Encoding)?;
        Self::from_slice(&bytes)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    #[error("address is not valid base32")]
    Encoding,
    #[error("address must be {ADDRESS_LEN} bytes")]
    Length,
}
