//! xchg router: authenticates peers over TCP, relays calls between them, and
//! keeps per-address mailboxes for peers that can only speak HTTP.

pub mod config;
pub mod connection;
pub mod error;
pub mod http;
pub mod mailbox;
pub mod router;

pub use config::RouterConfig;
pub use connection::RouterConnection;
pub use error::{Result, RouterError};
pub use router::{Router, RouterStatus};
