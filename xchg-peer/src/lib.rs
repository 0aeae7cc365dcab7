//! xchg peer: serve an RSA-derived address and call functions on other addresses over
//! UDP, an HTTP relay mailbox or a TCP router.

pub mod config;
pub mod error;
pub mod network;
pub mod peer;
pub mod remote_peer;
pub mod session;
pub mod transport;

pub use config::{PeerConfig, TransportKind};
pub use error::{PeerError, Result};
pub use network::{NetworkProvider, StaticNetwork};
pub use peer::Peer;
pub use remote_peer::RemotePeer;
