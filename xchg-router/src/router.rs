//! Relay hub: authenticated connections, address index, pending-transaction remapping, sweep.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};
use xchg_core::{Address, CallFrame, Keypair, RelayFrame, RelayFrameType};

use crate::config::RouterConfig;
use crate::connection::{run_connection, RouterConnection};
use crate::error::{Result, RouterError};
use crate::http;
use crate::mailbox::Mailbox;

/// A relayed call waiting for the rest of its response.
#[derive(Debug)]
struct PendingTransaction {
    original_id: u64,
    origin: u64,
    target: u64,
    created: Instant,
    /// Offsets of response chunks already relayed, and their byte total.
    relayed_offsets: HashSet<u32>,
    relayed_bytes: usize,
}

impl PendingTransaction {
    /// Count one response chunk; true once the whole response went through.
    fn record(&mut self, chunk: &CallFrame) -> bool {
        if self.relayed_offsets.insert(chunk.offset) {
            self.relayed_bytes += chunk.payload.len();
        }
        self.relayed_bytes >= chunk.total_size as usize
    }
}

#[derive(Default)]
struct RouterState {
    connections: HashMap<u64, Arc<RouterConnection>>,
    /// Confirmed links only.
    confirmed: HashMap<u64, Address>,
    by_address: HashMap<Address, u64>,
    pending: HashMap<u64, PendingTransaction>,
    /// (origin SID, original txid) -> router txid, so every chunk of a call shares one id.
    remapped: HashMap<(u64, u64), u64>,
}

impl RouterState {
    fn remove(&mut self, id: u64) -> Option<Arc<RouterConnection>> {
        if let Some(address) = self.confirmed.remove(&id) {
            if self.by_address.get(&address) == Some(&id) {
                self.by_address.remove(&address);
            }
        }
        self.connections.remove(&id)
    }

    fn forget_pending(&mut self, router_id: u64) {
        if let Some(p) = self.pending.remove(&router_id) {
            self.remapped.remove(&(p.origin, p.original_id));
        }
    }
}

/// Snapshot served on `GET /api/status`.
#[derive(Debug, Clone, Serialize)]
pub struct RouterStatus {
    pub address: String,
    pub connections: usize,
    pub confirmed: usize,
    pub pending: usize,
    pub mailboxes: usize,
}

struct Listeners {
    tcp: TcpListener,
    http: TcpListener,
}

/// Aborts the helper tasks when `run` returns or is dropped.
struct TaskGuard(Vec<JoinHandle<()>>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        for t in &self.0 {
            t.abort();
        }
    }
}

pub struct Router {
    keypair: Arc<Keypair>,
    config: RouterConfig,
    tcp_addr: SocketAddr,
    http_addr: SocketAddr,
    listeners: Mutex<Option<Listeners>>,
    state: Mutex<RouterState>,
    mailbox: Mailbox,
    next_connection_id: AtomicU64,
    next_transaction_id: AtomicU64,
}

impl Router {
    /// Bind the TCP relay and HTTP listeners. Nothing is served until `run`/`spawn`.
    pub async fn bind(config: RouterConfig, keypair: Arc<Keypair>) -> Result<Arc<Self>> {
        let tcp = TcpListener::bind((config.bind_host.as_str(), config.tcp_port)).await?;
        let http = TcpListener::bind((config.bind_host.as_str(), config.http_port)).await?;
        let tcp_addr = tcp.local_addr()?;
        let http_addr = http.local_addr()?;
        info!(address = %keypair.address(), %tcp_addr, %http_addr, "router bound");
        Ok(Arc::new(Self {
            mailbox: Mailbox::new(config.mailbox_ttl()),
            keypair,
            config,
            tcp_addr,
            http_addr,
            listeners: Mutex::new(Some(Listeners { tcp, http })),
            state: Mutex::new(RouterState::default()),
            next_connection_id: AtomicU64::new(1),
            next_transaction_id: AtomicU64::new(1),
        }))
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn address(&self) -> Address {
        self.keypair.address()
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub(crate) fn keypair(&self) -> Arc<Keypair> {
        self.keypair.clone()
    }

    pub(crate) fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    /// Accept connections until the listener fails. Serves HTTP and runs the sweep alongside.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let Listeners { tcp, http } = self
            .listeners
            .lock()
            .await
            .take()
            .ok_or(RouterError::AlreadyRunning)?;
        let _tasks = TaskGuard(vec![
            tokio::spawn(http::serve(self.clone(), http)),
            tokio::spawn(sweep_loop(self.clone())),
        ]);
        loop {
            let (stream, remote) = tcp.accept().await?;
            tokio::spawn(run_connection(self.clone(), stream, remote));
        }
    }

    /// `run` on a background task.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<Result<()>> {
        tokio::spawn(self.clone().run())
    }

    pub(crate) fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) async fn register(&self, conn: Arc<RouterConnection>) {
        self.state.lock().await.connections.insert(conn.id(), conn);
    }

    /// Publish the handshake-proven address of `conn`. A newer link for the same address wins.
    pub(crate) async fn confirm(&self, conn: &Arc<RouterConnection>, address: Address) {
        conn.set_address(address).await;
        let mut st = self.state.lock().await;
        if !st.connections.contains_key(&conn.id()) {
            return;
        }
        if let Some(old) = st.by_address.insert(address, conn.id()) {
            if old != conn.id() {
                st.confirmed.remove(&old);
                debug!(%address, old, new = conn.id(), "address moved to a newer connection");
            }
        }
        st.confirmed.insert(conn.id(), address);
        info!(sid = conn.id(), %address, remote = %conn.remote(), "peer confirmed");
    }

    pub(crate) async fn remove_connection(&self, id: u64) {
        self.state.lock().await.remove(id);
    }

    /// SID of the confirmed connection for `address`.
    pub async fn resolve_address(&self, address: &Address) -> Result<u64> {
        let st = self.state.lock().await;
        st.by_address
            .get(address)
            .copied()
            .filter(|id| st.connections.get(id).map_or(false, |c| !c.is_closed()))
            .ok_or(RouterError::AddressNotFound)
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn status(&self) -> RouterStatus {
        let (connections, confirmed, pending) = {
            let st = self.state.lock().await;
            (st.connections.len(), st.confirmed.len(), st.pending.len())
        };
        RouterStatus {
            address: self.address().to_string(),
            connections,
            confirmed,
            pending,
            mailboxes: self.mailbox.len().await,
        }
    }

    /// Handle one frame from a confirmed connection.
    pub(crate) async fn dispatch(&self, conn: &RouterConnection, frame: RelayFrame) {
        match frame.frame_type {
            RelayFrameType::ResolveAddress => {
                let reply = match self.resolve_payload(&frame.payload).await {
                    Ok(sid) => RelayFrame::new(
                        RelayFrameType::ResolvedAddress,
                        sid,
                        frame.transaction_id,
                        frame.payload,
                    ),
                    Err(e) => RelayFrame::error(frame.sid, frame.transaction_id, &e.to_string()),
                };
                conn.send(&reply);
            }
            RelayFrameType::Call => {
                let (sid, txid) = (frame.sid, frame.transaction_id);
                if let Err(e) = self.relay_call(conn.id(), frame).await {
                    debug!(from = conn.id(), to = sid, error = %e, "call not relayed");
                    conn.send(&RelayFrame::error(sid, txid, &e.to_string()));
                }
            }
            RelayFrameType::Response => self.relay_response(conn.id(), frame).await,
            other => trace!(sid = conn.id(), frame_type = ?other, "ignored frame"),
        }
    }

    async fn resolve_payload(&self, payload: &[u8]) -> Result<u64> {
        let text = std::str::from_utf8(payload).map_err(|_| RouterError::AddressNotFound)?;
        let address: Address = text.trim().parse()?;
        self.resolve_address(&address).await
    }

    async fn relay_call(&self, from: u64, frame: RelayFrame) -> Result<()> {
        let (target, router_id) = {
            let mut guard = self.state.lock().await;
            let st = &mut *guard;
            let target = st
                .connections
                .get(&frame.sid)
                .filter(|c| st.confirmed.contains_key(&frame.sid) && !c.is_closed())
                .cloned()
                .ok_or(RouterError::NoRoute)?;
            let key = (from, frame.transaction_id);
            let router_id = match st.remapped.get(&key) {
                Some(id) => *id,
                None => {
                    let id = self.next_transaction_id.fetch_add(1, Ordering::Relaxed);
                    st.remapped.insert(key, id);
                    st.pending.insert(
                        id,
                        PendingTransaction {
                            original_id: frame.transaction_id,
                            origin: from,
                            target: frame.sid,
                            created: Instant::now(),
                            relayed_offsets: HashSet::new(),
                            relayed_bytes: 0,
                        },
                    );
                    id
                }
            };
            (target, router_id)
        };
        let forwarded = RelayFrame {
            transaction_id: router_id,
            ..frame
        };
        trace!(from, to = target.id(), router_id, "relaying call");
        if target.send(&forwarded) {
            Ok(())
        } else {
            self.state.lock().await.forget_pending(router_id);
            Err(RouterError::ConnectionNotFound)
        }
    }

    async fn relay_response(&self, from: u64, frame: RelayFrame) {
        let (origin, original_id) = {
            let mut st = self.state.lock().await;
            let Some(p) = st.pending.get_mut(&frame.transaction_id) else {
                trace!(from, txid = frame.transaction_id, "response for unknown transaction dropped");
                return;
            };
            if p.target != from {
                debug!(from, expected = p.target, "response from wrong connection dropped");
                return;
            }
            let (origin, original_id) = (p.origin, p.original_id);
            let complete = CallFrame::decode(&frame.payload).map_or(true, |cf| p.record(&cf));
            if complete {
                st.forget_pending(frame.transaction_id);
            }
            (st.connections.get(&origin).cloned(), original_id)
        };
        let Some(origin) = origin else {
            debug!(from, "originating connection gone, response dropped");
            return;
        };
        origin.send(&RelayFrame {
            transaction_id: original_id,
            ..frame
        });
    }

    /// Drop dead and stalled connections and expired transactions.
    pub async fn sweep(&self, now: Instant) {
        let handshake_timeout = self.config.handshake_timeout();
        let transaction_timeout = self.config.transaction_timeout();
        let (stale, expired) = {
            let mut guard = self.state.lock().await;
            let st = &mut *guard;
            let stale: Vec<u64> = st
                .connections
                .values()
                .filter(|c| {
                    c.is_closed()
                        || (!st.confirmed.contains_key(&c.id())
                            && now.saturating_duration_since(c.created()) > handshake_timeout)
                })
                .map(|c| c.id())
                .collect();
            let stale: Vec<Arc<RouterConnection>> =
                stale.into_iter().filter_map(|id| st.remove(id)).collect();
            let expired: Vec<u64> = st
                .pending
                .iter()
                .filter(|(_, p)| now.saturating_duration_since(p.created) > transaction_timeout)
                .map(|(id, _)| *id)
                .collect();
            for id in &expired {
                st.forget_pending(*id);
            }
            (stale, expired.len())
        };
        for conn in &stale {
            debug!(sid = conn.id(), remote = %conn.remote(), "dropping stale connection");
            conn.close();
        }
        if expired > 0 {
            debug!(expired, "pending transactions timed out");
        }
        let dropped = self.mailbox.purge(now).await;
        if dropped > 0 {
            debug!(dropped, "mailbox envelopes expired");
        }
    }
}

async fn sweep_loop(router: Arc<Router>) {
    let mut tick = tokio::time::interval(router.config.sweep_interval());
    loop {
        tick.tick().await;
        router.sweep(Instant::now()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xchg_core::{split_into_chunks, CallFrameType, CallStatus};

    fn pending() -> PendingTransaction {
        PendingTransaction {
            original_id: 1,
            origin: 1,
            target: 2,
            created: Instant::now(),
            relayed_offsets: HashSet::new(),
            relayed_bytes: 0,
        }
    }

    #[test]
    fn response_completes_on_bytes_not_on_tail_chunk() {
        let chunks = split_into_chunks(CallFrameType::Response, CallStatus::Ok, 1, 0, &[0; 2500], 1024);
        let mut p = pending();
        assert!(!p.record(&chunks[2]));
        assert!(!p.record(&chunks[0]));
        assert!(!p.record(&chunks[0]), "a repeated chunk is counted once");
        assert!(p.record(&chunks[1]));
    }

    #[test]
    fn empty_response_completes_at_once() {
        let chunks = split_into_chunks(CallFrameType::Response, CallStatus::Ok, 1, 0, &[], 1024);
        assert!(pending().record(&chunks[0]));
    }
}
