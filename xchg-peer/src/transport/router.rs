//! TCP link to one router: initiator handshake, address resolution, relayed frames.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::time::timeout;
use tracing::{debug, info, trace};
use xchg_core::{Address, CallFrame, FrameError, Handshake, Keypair, RelayFrame, RelayFrameType};

use super::{Inbound, Lookup, Readiness, ReplyPath};
use crate::error::{PeerError, Result};

/// Connect + Init1..Init6 must finish within this.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
pub const RESOLVE_TIMEOUT: Duration = Duration::from_secs(3);

const MIN_BACKOFF: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_secs(5);
const READ_BUF: usize = 64 * 1024;
/// Resolve request ids live in the upper half so they never collide with call ids.
const RESOLVE_ID_BASE: u64 = 1 << 63;

#[derive(Default)]
struct LinkState {
    connecting: bool,
    /// Set once the handshake completed.
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    sid: Option<u64>,
    resolves: HashMap<u64, oneshot::Sender<Option<u64>>>,
    resolved: HashMap<Address, u64>,
}

pub struct RouterLink {
    index: usize,
    host: String,
    keypair: Arc<Keypair>,
    state: Mutex<LinkState>,
    ready: Notify,
    next_request: AtomicU64,
}

impl RouterLink {
    pub fn new(index: usize, host: String, keypair: Arc<Keypair>) -> Self {
        Self {
            index,
            host,
            keypair,
            // `run` is expected to start right away.
            state: Mutex::new(LinkState {
                connecting: true,
                ..LinkState::default()
            }),
            ready: Notify::new(),
            next_request: AtomicU64::new(RESOLVE_ID_BASE),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub async fn is_established(&self) -> bool {
        self.state.lock().await.tx.is_some()
    }

    /// Our SID on the router, once established.
    pub async fn sid(&self) -> Option<u64> {
        self.state.lock().await.sid
    }

    /// Wait while a connection attempt is in flight. True if the link is usable.
    pub async fn wait_established(&self, wait: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.ready.notified();
            {
                let st = self.state.lock().await;
                if st.tx.is_some() {
                    return true;
                }
                if !st.connecting {
                    return false;
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.is_established().await;
            }
        }
    }

    /// SID of the connection serving `address` on this router.
    pub async fn resolve(&self, address: &Address) -> Option<u64> {
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut st = self.state.lock().await;
            if let Some(sid) = st.resolved.get(address) {
                return Some(*sid);
            }
            let tx = st.tx.clone()?;
            st.resolves.insert(id, reply_tx);
            let frame = RelayFrame::new(
                RelayFrameType::ResolveAddress,
                0,
                id,
                address.to_string().into_bytes(),
            );
            if tx.send(frame.encode()).is_err() {
                st.resolves.remove(&id);
                return None;
            }
        }
        let sid = match timeout(RESOLVE_TIMEOUT, reply_rx).await {
            Ok(Ok(sid)) => sid,
            _ => None,
        };
        let mut st = self.state.lock().await;
        st.resolves.remove(&id);
        if let Some(sid) = sid {
            st.resolved.insert(*address, sid);
        }
        sid
    }

    pub async fn forget(&self, address: &Address) {
        self.state.lock().await.resolved.remove(address);
    }

    pub async fn send_call(&self, sid: u64, frames: &[CallFrame]) -> Result<()> {
        self.send_relayed(RelayFrameType::Call, sid, None, frames).await
    }

    /// Response chunks for a relayed call, keyed by the router's transaction id.
    pub async fn send_response(&self, relay_id: u64, frames: &[CallFrame]) -> Result<()> {
        let sid = self.sid().await.unwrap_or(0);
        self.send_relayed(RelayFrameType::Response, sid, Some(relay_id), frames)
            .await
    }

    async fn send_relayed(
        &self,
        frame_type: RelayFrameType,
        sid: u64,
        relay_id: Option<u64>,
        frames: &[CallFrame],
    ) -> Result<()> {
        let tx = self
            .state
            .lock()
            .await
            .tx
            .clone()
            .ok_or_else(|| PeerError::NoTransport(format!("router {} not connected", self.host)))?;
        for f in frames {
            let mut relay = RelayFrame::new(
                frame_type,
                sid,
                relay_id.unwrap_or(f.transaction_id),
                f.encode(),
            );
            relay.session_id = f.session_id;
            tx.send(relay.encode())
                .map_err(|_| PeerError::NoTransport(format!("router {} link closed", self.host)))?;
        }
        Ok(())
    }

    /// Keep the link up until the inbound channel closes, reconnecting with backoff.
    pub async fn run(self: Arc<Self>, inbound: mpsc::UnboundedSender<Inbound>) {
        let mut backoff = MIN_BACKOFF;
        loop {
            let started = Instant::now();
            match self.connect_once(&inbound).await {
                Ok(()) => debug!(host = %self.host, "router closed the link"),
                Err(e) => debug!(host = %self.host, error = %e, "router link failed"),
            }
            self.mark_down().await;
            if inbound.is_closed() {
                return;
            }
            if started.elapsed() > MAX_BACKOFF {
                backoff = MIN_BACKOFF;
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Release the writer so the socket closes once the `run` task is gone.
    pub async fn disconnect(&self) {
        self.mark_down().await;
    }

    async fn mark_down(&self) {
        let mut st = self.state.lock().await;
        st.connecting = false;
        st.tx = None;
        st.sid = None;
        st.resolved.clear();
        for (_, waiter) in st.resolves.drain() {
            let _ = waiter.send(None);
        }
        drop(st);
        self.ready.notify_waiters();
    }

    async fn connect_once(self: &Arc<Self>, inbound: &mpsc::UnboundedSender<Inbound>) -> Result<()> {
        self.state.lock().await.connecting = true;
        let deadline = tokio::time::Instant::now() + HANDSHAKE_TIMEOUT;
        let stream = tokio::time::timeout_at(deadline, TcpStream::connect(&self.host))
            .await
            .map_err(|_| PeerError::Timeout)??;
        let _ = stream.set_nodelay(true);
        let (mut reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let writer_task = tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                if writer.write_all(&bytes).await.is_err() {
                    break;
                }
            }
        });

        let mut handshake = Handshake::initiator(self.keypair.clone());
        for (t, p) in handshake.start() {
            let _ = tx.send(RelayFrame::new(t, 0, 0, p).encode());
        }
        let mut pending: Vec<u8> = Vec::new();
        let mut buf = vec![0u8; READ_BUF];
        let result = 'read: loop {
            let read = if handshake.is_established() {
                reader.read(&mut buf).await
            } else {
                match tokio::time::timeout_at(deadline, reader.read(&mut buf)).await {
                    Ok(r) => r,
                    Err(_) => break 'read Err(PeerError::Timeout),
                }
            };
            let n = match read {
                Ok(0) => break 'read Ok(()),
                Ok(n) => n,
                Err(e) => break 'read Err(e.into()),
            };
            pending.extend_from_slice(&buf[..n]);
            loop {
                match RelayFrame::decode(&pending) {
                    Ok((frame, used)) => {
                        pending.drain(..used);
                        if let Err(e) = self.on_frame(&mut handshake, &tx, frame, inbound).await {
                            break 'read Err(e);
                        }
                    }
                    Err(FrameError::NeedMore) => break,
                    Err(e) => break 'read Err(PeerError::Protocol(e.to_string())),
                }
            }
        };
        writer_task.abort();
        result
    }

    async fn on_frame(
        self: &Arc<Self>,
        handshake: &mut Handshake,
        tx: &mpsc::UnboundedSender<Vec<u8>>,
        frame: RelayFrame,
        inbound: &mpsc::UnboundedSender<Inbound>,
    ) -> Result<()> {
        if frame.frame_type.is_handshake() {
            if handshake.is_established() {
                return Ok(());
            }
            let out = handshake
                .on_frame(frame.frame_type, &frame.payload)
                .map_err(|e| PeerError::Protocol(e.to_string()))?;
            for (t, p) in out {
                let _ = tx.send(RelayFrame::new(t, 0, 0, p).encode());
            }
            if handshake.is_established() {
                let mut st = self.state.lock().await;
                st.connecting = false;
                st.tx = Some(tx.clone());
                st.sid = Some(frame.sid);
                drop(st);
                self.ready.notify_waiters();
                info!(host = %self.host, sid = frame.sid, "router link established");
            }
            return Ok(());
        }
        if !handshake.is_established() {
            trace!(host = %self.host, frame_type = ?frame.frame_type, "frame before handshake ignored");
            return Ok(());
        }
        match frame.frame_type {
            RelayFrameType::ResolvedAddress => {
                if let Some(waiter) = self.state.lock().await.resolves.remove(&frame.transaction_id) {
                    let _ = waiter.send(Some(frame.sid));
                }
            }
            RelayFrameType::Error => {
                let message = String::from_utf8_lossy(&frame.payload).into_owned();
                let mut st = self.state.lock().await;
                if let Some(waiter) = st.resolves.remove(&frame.transaction_id) {
                    let _ = waiter.send(None);
                } else {
                    // A relayed call failed; the cached SID may be stale.
                    debug!(host = %self.host, txid = frame.transaction_id, %message, "router error");
                    st.resolved.clear();
                }
            }
            RelayFrameType::Call | RelayFrameType::Response => {
                match CallFrame::decode(&frame.payload) {
                    Ok(call) => {
                        let reply = ReplyPath::Router {
                            link: self.clone(),
                            relay_id: frame.transaction_id,
                        };
                        let _ = inbound.send(Inbound { frame: call, reply });
                    }
                    Err(e) => debug!(host = %self.host, error = %e, "malformed relayed frame"),
                }
            }
            other => trace!(host = %self.host, frame_type = ?other, "ignored frame"),
        }
        Ok(())
    }
}

/// Relay through whichever router knows the remote.
pub struct RouterTransport {
    links: Arc<[Arc<RouterLink>]>,
    target: Address,
    /// (link index, remote SID)
    route: Option<(usize, u64)>,
}

impl RouterTransport {
    pub fn new(links: Arc<[Arc<RouterLink>]>, target: Address) -> Self {
        Self {
            links,
            target,
            route: None,
        }
    }

    pub(crate) async fn readiness(&mut self) -> Readiness {
        if let Some((i, _)) = self.route {
            if self.links[i].is_established().await {
                return Readiness::Ready;
            }
            self.route = None;
        }
        Readiness::Lookup(Lookup::Router(self.links.clone(), self.target))
    }

    pub(crate) fn learn(&mut self, route: Option<(usize, u64)>) {
        self.route = route;
    }

    pub(crate) async fn send(&mut self, frames: &[CallFrame]) -> Result<()> {
        let (i, sid) = self
            .route
            .ok_or_else(|| PeerError::NoTransport("remote not resolved on any router".into()))?;
        self.links[i].send_call(sid, frames).await
    }

    pub(crate) async fn declare_error(&mut self) {
        if let Some((i, _)) = self.route.take() {
            self.links[i].forget(&self.target).await;
        }
    }
}

/// First link that is up and knows `target`, with the remote SID.
pub(crate) async fn find_route(links: &[Arc<RouterLink>], target: &Address) -> Option<(usize, u64)> {
    for link in links {
        if !link.wait_established(HANDSHAKE_TIMEOUT).await {
            continue;
        }
        if let Some(sid) = link.resolve(target).await {
            return Some((link.index(), sid));
        }
    }
    None
}
