//! UDP endpoint: LAN discovery by broadcast plus direct Call Frame datagrams.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;
use tracing::{debug, trace};
use xchg_core::wire::{decode_datagram, encode_datagram};
use xchg_core::{Address, CallFrame, Keypair, Message, PublicKey, PROTOCOL_VERSION};

use super::{Inbound, Lookup, Readiness, ReplyPath};
use crate::config::PeerConfig;
use crate::error::{PeerError, Result};

/// A failed discovery is not repeated for this long.
pub const DISCOVERY_RETRY: Duration = Duration::from_secs(5);

const MAX_DATAGRAM: usize = 65536;

type Resolving = HashMap<[u8; 16], (Address, oneshot::Sender<SocketAddr>)>;

pub struct UdpNode {
    socket: UdpSocket,
    port: u16,
    keypair: Arc<Keypair>,
    port_start: u16,
    port_end: u16,
    broadcast: IpAddr,
    discovery_timeout: Duration,
    /// Outstanding discovery nonces.
    resolving: Mutex<Resolving>,
}

impl UdpNode {
    /// Bind the first free port of the configured range.
    pub async fn bind(config: &PeerConfig, keypair: Arc<Keypair>) -> Result<Self> {
        let broadcast: IpAddr = config.broadcast_addr.parse().map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, e)
        })?;
        let socket = bind_in_range(config.udp_port_start, config.udp_port_end).await?;
        socket.set_broadcast(true)?;
        let port = socket.local_addr()?.port();
        debug!(port, "udp bound");
        Ok(Self {
            socket,
            port,
            keypair,
            port_start: config.udp_port_start,
            port_end: config.udp_port_end,
            broadcast,
            discovery_timeout: config.discovery_timeout(),
            resolving: Mutex::new(HashMap::new()),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Receive loop: Call Frames go to `inbound`; discovery requests for our address are answered.
    /// Signing and verification run in their own tasks so the loop only decodes.
    pub async fn run(self: Arc<Self>, inbound: mpsc::UnboundedSender<Inbound>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let me = self.keypair.address();
        loop {
            let (n, from) = match self.socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    // ICMP port-unreachable from an earlier send surfaces here.
                    trace!(error = %e, "udp receive error");
                    continue;
                }
            };
            let data = &buf[..n];
            if CallFrame::looks_like(data) {
                match CallFrame::decode(data) {
                    Ok(frame) => {
                        if inbound
                            .send(Inbound {
                                frame,
                                reply: ReplyPath::Udp(from),
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => debug!(%from, error = %e, "malformed call frame"),
                }
                continue;
            }
            match decode_datagram(data) {
                Ok(Message::ResolveRequest {
                    protocol_version,
                    target,
                    nonce,
                }) => {
                    if protocol_version == PROTOCOL_VERSION && target == me {
                        let node = self.clone();
                        tokio::spawn(async move { node.answer(from, nonce).await });
                    }
                }
                Ok(Message::ResolveResponse {
                    protocol_version,
                    address,
                    public_key,
                    nonce,
                    signature,
                }) => {
                    if protocol_version == PROTOCOL_VERSION {
                        let node = self.clone();
                        tokio::spawn(async move {
                            node.on_resolved(from, address, &public_key, nonce, &signature)
                                .await
                        });
                    }
                }
                Err(e) => trace!(%from, error = %e, "ignoring datagram"),
            }
        }
    }

    async fn answer(&self, to: SocketAddr, nonce: [u8; 16]) {
        let signature = match self.keypair.sign(&nonce) {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, "cannot sign discovery nonce");
                return;
            }
        };
        let msg = Message::ResolveResponse {
            protocol_version: PROTOCOL_VERSION,
            address: self.keypair.address(),
            public_key: self.keypair.public_key().as_der().to_vec(),
            nonce,
            signature,
        };
        if let Ok(bytes) = encode_datagram(&msg) {
            let _ = self.socket.send_to(&bytes, to).await;
            trace!(%to, "answered discovery");
        }
    }

    async fn on_resolved(
        &self,
        from: SocketAddr,
        address: Address,
        public_key: &[u8],
        nonce: [u8; 16],
        signature: &[u8],
    ) {
        let Ok(key) = PublicKey::from_der(public_key) else {
            debug!(%from, "discovery answer with bad key");
            return;
        };
        if key.address() != address || !key.verify(&nonce, signature) {
            debug!(%from, %address, "discovery answer failed verification");
            return;
        }
        let mut resolving = self.resolving.lock().await;
        if !matches!(resolving.get(&nonce), Some((target, _)) if *target == address) {
            return;
        }
        if let Some((_, tx)) = resolving.remove(&nonce) {
            let _ = tx.send(from);
        }
    }

    /// Broadcast a request for `target` across the port range; wait for a verified answer.
    pub async fn discover(&self, target: Address) -> Option<SocketAddr> {
        let nonce: [u8; 16] = rand::random();
        let bytes = encode_datagram(&Message::ResolveRequest {
            protocol_version: PROTOCOL_VERSION,
            target,
            nonce,
        })
        .ok()?;
        let (tx, rx) = oneshot::channel();
        self.resolving.lock().await.insert(nonce, (target, tx));
        for port in self.port_start..=self.port_end {
            if port == self.port {
                continue;
            }
            let _ = self.socket.send_to(&bytes, (self.broadcast, port)).await;
        }
        let found = timeout(self.discovery_timeout, rx).await;
        self.resolving.lock().await.remove(&nonce);
        match found {
            Ok(Ok(endpoint)) => {
                debug!(%target, %endpoint, "discovered");
                Some(endpoint)
            }
            _ => None,
        }
    }

    pub async fn send_frames(&self, to: SocketAddr, frames: &[CallFrame]) -> Result<()> {
        for f in frames {
            self.socket.send_to(&f.encode(), to).await?;
        }
        Ok(())
    }
}

async fn bind_in_range(start: u16, end: u16) -> std::io::Result<UdpSocket> {
    let mut last = None;
    for port in start..=end {
        match UdpSocket::bind(("0.0.0.0", port)).await {
            Ok(s) => return Ok(s),
            Err(e) => last = Some(e),
        }
    }
    Err(last.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "empty udp port range")
    }))
}

/// Direct UDP to one remote, endpoint learned by discovery.
pub struct UdpTransport {
    node: Arc<UdpNode>,
    target: Address,
    endpoint: Option<SocketAddr>,
    failed_at: Option<Instant>,
}

impl UdpTransport {
    pub fn new(node: Arc<UdpNode>, target: Address) -> Self {
        Self {
            node,
            target,
            endpoint: None,
            failed_at: None,
        }
    }

    pub fn endpoint(&self) -> Option<SocketAddr> {
        self.endpoint
    }

    pub(crate) fn readiness(&self) -> Readiness {
        if self.endpoint.is_some() {
            return Readiness::Ready;
        }
        if self.failed_at.map_or(false, |t| t.elapsed() < DISCOVERY_RETRY) {
            return Readiness::Unavailable;
        }
        Readiness::Lookup(Lookup::Udp(self.node.clone(), self.target))
    }

    pub(crate) fn learn(&mut self, endpoint: Option<SocketAddr>) {
        match endpoint {
            Some(endpoint) => {
                self.endpoint = Some(endpoint);
                self.failed_at = None;
            }
            None => self.failed_at = Some(Instant::now()),
        }
    }

    pub(crate) async fn send(&mut self, frames: &[CallFrame]) -> Result<()> {
        let endpoint = self
            .endpoint
            .ok_or_else(|| PeerError::NoTransport("no udp endpoint".into()))?;
        self.node.send_frames(endpoint, frames).await
    }

    pub(crate) fn declare_error(&mut self) {
        self.endpoint = None;
    }
}
