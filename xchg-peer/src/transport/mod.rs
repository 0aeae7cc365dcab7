//! Ways to move Call Frames between peers.
//!
//! Shared per-node endpoints (`UdpNode`, `HttpRelay`, `RouterLink`) feed every received
//! frame into one channel as an [`Inbound`]. Per-destination [`Transport`] values wrap a
//! shared endpoint plus whatever was learned about one remote (endpoint, SID).

pub mod http;
pub mod router;
pub mod udp;

use std::net::SocketAddr;
use std::sync::Arc;

use xchg_core::{Address, CallFrame};

use crate::config::TransportKind;
use crate::error::Result;

pub use http::{HttpRelay, HttpTransport};
pub use router::{RouterLink, RouterTransport};
pub use udp::{UdpNode, UdpTransport};

/// Frame received by any endpoint, with the way back to its sender.
pub struct Inbound {
    pub frame: CallFrame,
    pub reply: ReplyPath,
}

/// Route for responses: back the way the request came.
#[derive(Clone)]
pub enum ReplyPath {
    Udp(SocketAddr),
    Router {
        link: Arc<RouterLink>,
        /// Router-assigned transaction id of the relayed call.
        relay_id: u64,
    },
    Http {
        relay: Arc<HttpRelay>,
        from: Address,
    },
}

/// Reassembly key component naming the sender of a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Source {
    Udp(SocketAddr),
    Router { link: usize, relay_id: u64 },
    Http(Address),
}

impl ReplyPath {
    pub fn source(&self) -> Source {
        match self {
            Self::Udp(addr) => Source::Udp(*addr),
            Self::Router { link, relay_id } => Source::Router {
                link: link.index(),
                relay_id: *relay_id,
            },
            Self::Http { from, .. } => Source::Http(*from),
        }
    }

    /// Send response chunks back to the caller.
    pub async fn send(&self, udp: Option<&UdpNode>, frames: &[CallFrame]) -> Result<()> {
        match self {
            Self::Udp(addr) => match udp {
                Some(node) => node.send_frames(*addr, frames).await,
                None => Err(crate::error::PeerError::NoTransport("udp disabled".into())),
            },
            Self::Router { link, relay_id } => link.send_response(*relay_id, frames).await,
            Self::Http { relay, from } => relay.post(from, frames).await,
        }
    }
}

/// Result of [`Transport::readiness`].
pub enum Readiness {
    Ready,
    Unavailable,
    /// Nothing known yet; run the lookup, then hand its result to [`Transport::learn`].
    Lookup(Lookup),
}

/// Discovery or resolution for one remote. Holds only shared handles, so it can run
/// without the transport borrowed.
pub enum Lookup {
    Udp(Arc<UdpNode>, Address),
    Router(Arc<[Arc<RouterLink>]>, Address),
}

impl Lookup {
    pub async fn run(self) -> Option<Route> {
        match self {
            Self::Udp(node, target) => node.discover(target).await.map(Route::Udp),
            Self::Router(links, target) => router::find_route(&links, &target)
                .await
                .map(|(link, sid)| Route::Router { link, sid }),
        }
    }
}

/// What a successful lookup learned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Udp(SocketAddr),
    Router { link: usize, sid: u64 },
}

/// One way of reaching one remote peer.
pub enum Transport {
    Udp(UdpTransport),
    Http(HttpTransport),
    Router(RouterTransport),
}

impl Transport {
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Udp(_) => TransportKind::Udp,
            Self::Http(_) => TransportKind::Http,
            Self::Router(_) => TransportKind::Router,
        }
    }

    /// Quick look at what is already known about the remote.
    pub async fn readiness(&mut self) -> Readiness {
        match self {
            Self::Udp(t) => t.readiness(),
            Self::Http(t) if t.check() => Readiness::Ready,
            Self::Http(_) => Readiness::Unavailable,
            Self::Router(t) => t.readiness().await,
        }
    }

    /// Store the outcome of a [`Lookup`]. `None` records a failure.
    pub fn learn(&mut self, route: Option<Route>) {
        match (self, route) {
            (Self::Udp(t), Some(Route::Udp(endpoint))) => t.learn(Some(endpoint)),
            (Self::Udp(t), None) => t.learn(None),
            (Self::Router(t), Some(Route::Router { link, sid })) => t.learn(Some((link, sid))),
            (Self::Router(t), None) => t.learn(None),
            _ => {}
        }
    }

    /// Whether `send` can be attempted now. May discover or resolve.
    pub async fn check(&mut self) -> bool {
        match self.readiness().await {
            Readiness::Ready => true,
            Readiness::Unavailable => false,
            Readiness::Lookup(lookup) => {
                let route = lookup.run().await;
                let found = route.is_some();
                self.learn(route);
                found
            }
        }
    }

    /// Send every chunk of one transaction.
    pub async fn send(&mut self, frames: &[CallFrame]) -> Result<()> {
        match self {
            Self::Udp(t) => t.send(frames).await,
            Self::Http(t) => t.send(frames).await,
            Self::Router(t) => t.send(frames).await,
        }
    }

    /// Forget whatever was learned about the remote (endpoint, SID).
    pub async fn declare_error(&mut self) {
        match self {
            Self::Udp(t) => t.declare_error(),
            Self::Http(_) => {}
            Self::Router(t) => t.declare_error().await,
        }
    }
}
