//! A peer node: serves its own address and calls others by address.
//!
//! Every endpoint (UDP socket, router links, HTTP mailboxes) feeds one inbound channel.
//! The dispatcher reassembles chunks per sender, runs calls through the
//! [`ServerProcessor`] and hands responses to the waiting [`RemotePeer`].

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};
use xchg_core::call::{
    decode_auth_request, decode_plain_call, decode_session_call, encode_auth_response,
};
use xchg_core::identity::{generate_session_key, open, seal};
use xchg_core::nonce::DEFAULT_NONCE_POOL_SIZE;
use xchg_core::protocol::{is_reserved_function, FN_AUTH, FN_GET_NONCE};
use xchg_core::{
    split_into_chunks, Address, CallFrame, CallFrameType, CallStatus, ChunkReceiveResult,
    Keypair, Nonces, Reassembler, ServerProcessor, DEFAULT_CHUNK_SIZE,
};

use crate::config::{PeerConfig, TransportKind};
use crate::error::Result;
use crate::network::{NetworkProvider, StaticNetwork};
use crate::remote_peer::{RemotePeer, Waiters};
use crate::session::{SessionError, Sessions};
use crate::transport::{
    HttpRelay, HttpTransport, Inbound, ReplyPath, RouterLink, RouterTransport, Source, Transport,
    UdpNode, UdpTransport,
};

const PURGE_INTERVAL: Duration = Duration::from_secs(5);

struct PeerState {
    sessions: Sessions,
    nonces: Nonces,
    calls: Reassembler<Source>,
    responses: Reassembler<Source>,
}

struct PeerInner {
    config: PeerConfig,
    keypair: Arc<Keypair>,
    processor: Arc<dyn ServerProcessor>,
    udp: Option<Arc<UdpNode>>,
    http: Arc<HttpRelay>,
    links: Arc<[Arc<RouterLink>]>,
    waiters: Arc<Waiters>,
    next_transaction_id: Arc<AtomicU64>,
    state: Mutex<PeerState>,
    remotes: Mutex<HashMap<Address, Arc<RemotePeer>>>,
}

pub struct Peer {
    inner: Arc<PeerInner>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Peer {
    /// Start a peer whose HTTP relays come from `config.http_relays`.
    pub async fn start(
        config: PeerConfig,
        keypair: Arc<Keypair>,
        processor: Arc<dyn ServerProcessor>,
    ) -> Result<Self> {
        let network = Arc::new(StaticNetwork::new(config.http_relays.clone()));
        Self::start_with_network(config, keypair, processor, network).await
    }

    pub async fn start_with_network(
        config: PeerConfig,
        keypair: Arc<Keypair>,
        processor: Arc<dyn ServerProcessor>,
        network: Arc<dyn NetworkProvider>,
    ) -> Result<Self> {
        let udp = if config.udp_enabled {
            Some(Arc::new(UdpNode::bind(&config, keypair.clone()).await?))
        } else {
            None
        };
        let http = Arc::new(HttpRelay::new(network, keypair.address())?);
        let links: Arc<[Arc<RouterLink>]> = config
            .routers
            .iter()
            .enumerate()
            .map(|(i, host)| Arc::new(RouterLink::new(i, host.clone(), keypair.clone())))
            .collect();

        let inner = Arc::new(PeerInner {
            config,
            keypair,
            processor,
            udp,
            http,
            links,
            waiters: Arc::new(Waiters::default()),
            next_transaction_id: Arc::new(AtomicU64::new(1)),
            state: Mutex::new(PeerState {
                sessions: Sessions::default(),
                nonces: Nonces::new(DEFAULT_NONCE_POOL_SIZE),
                calls: Reassembler::new(),
                responses: Reassembler::new(),
            }),
            remotes: Mutex::new(HashMap::new()),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let mut tasks = Vec::new();
        if let Some(udp) = &inner.udp {
            tasks.push(tokio::spawn(udp.clone().run(tx.clone())));
        }
        for link in inner.links.iter() {
            tasks.push(tokio::spawn(link.clone().run(tx.clone())));
        }
        tasks.push(tokio::spawn(inner.http.clone().run(tx)));
        tasks.push(tokio::spawn(dispatch_loop(inner.clone(), rx)));
        tasks.push(tokio::spawn(purge_loop(inner.clone())));

        info!(
            address = %inner.keypair.address(),
            udp_port = ?inner.udp.as_ref().map(|u| u.port()),
            routers = inner.links.len(),
            "peer started"
        );
        Ok(Self {
            inner,
            tasks: std::sync::Mutex::new(tasks),
        })
    }

    pub fn address(&self) -> Address {
        self.inner.keypair.address()
    }

    pub fn udp_port(&self) -> Option<u16> {
        self.inner.udp.as_ref().map(|u| u.port())
    }

    /// Call `function` on the peer at `address`. Authenticates with `auth` when no session exists.
    pub async fn call(
        &self,
        address: &Address,
        auth: &[u8],
        function: &str,
        data: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let remote = self.inner.remote_peer(address).await;
        remote.call(function, data, auth, timeout).await
    }

    /// Client state for `address`, created on first use.
    pub async fn remote_peer(&self, address: &Address) -> Arc<RemotePeer> {
        self.inner.remote_peer(address).await
    }

    /// Server sessions currently open on this peer.
    pub async fn session_count(&self) -> usize {
        self.inner.state.lock().await.sessions.len()
    }

    /// Stop every task, drop router connections and fail pending calls.
    pub async fn shutdown(&self) {
        let tasks = match self.tasks.lock() {
            Ok(mut t) => std::mem::take(&mut *t),
            Err(_) => Vec::new(),
        };
        for t in tasks {
            t.abort();
        }
        for link in self.inner.links.iter() {
            link.disconnect().await;
        }
        self.inner.waiters.clear().await;
        info!(address = %self.address(), "peer stopped");
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        if let Ok(tasks) = self.tasks.get_mut() {
            for t in tasks.drain(..) {
                t.abort();
            }
        }
    }
}

impl PeerInner {
    async fn remote_peer(&self, address: &Address) -> Arc<RemotePeer> {
        let mut remotes = self.remotes.lock().await;
        remotes
            .entry(*address)
            .or_insert_with(|| {
                Arc::new(RemotePeer::new(
                    *address,
                    self.keypair.clone(),
                    self.transports_for(*address),
                    self.waiters.clone(),
                    self.next_transaction_id.clone(),
                ))
            })
            .clone()
    }

    /// Transports in configured order; kinds without an endpoint are skipped.
    fn transports_for(&self, target: Address) -> Vec<Transport> {
        let mut out = Vec::new();
        for kind in &self.config.transports {
            match kind {
                TransportKind::Udp => {
                    if let Some(udp) = &self.udp {
                        out.push(Transport::Udp(UdpTransport::new(udp.clone(), target)));
                    }
                }
                TransportKind::Http => {
                    out.push(Transport::Http(HttpTransport::new(self.http.clone(), target)));
                }
                TransportKind::Router => {
                    if !self.links.is_empty() {
                        out.push(Transport::Router(RouterTransport::new(
                            self.links.clone(),
                            target,
                        )));
                    }
                }
            }
        }
        out
    }

    async fn on_inbound(&self, inbound: Inbound) {
        let Inbound { frame, reply } = inbound;
        let is_call = frame.frame_type == CallFrameType::Call;
        let source = reply.source();
        let now = Instant::now();
        let result = {
            let mut st = self.state.lock().await;
            if is_call {
                st.calls.push(source, frame, now)
            } else {
                st.responses.push(source, frame, now)
            }
        };
        match result {
            ChunkReceiveResult::Complete(frame) if is_call => self.serve(frame, reply).await,
            ChunkReceiveResult::Complete(frame) => {
                let transaction_id = frame.transaction_id;
                if !self.waiters.complete(frame).await {
                    trace!(transaction_id, "response without a waiting call");
                }
            }
            ChunkReceiveResult::InProgress => {}
            ChunkReceiveResult::Rejected => debug!("inconsistent chunk dropped"),
        }
    }

    async fn serve(&self, frame: CallFrame, reply: ReplyPath) {
        let (status, payload) = self.execute(&frame).await;
        let frames = split_into_chunks(
            CallFrameType::Response,
            status,
            frame.transaction_id,
            frame.session_id,
            &payload,
            DEFAULT_CHUNK_SIZE,
        );
        if let Err(e) = reply.send(self.udp.as_deref(), &frames).await {
            debug!(transaction_id = frame.transaction_id, error = %e, "response not delivered");
        }
    }

    async fn execute(&self, frame: &CallFrame) -> (CallStatus, Vec<u8>) {
        if frame.session_id == 0 {
            return self.execute_plain(&frame.payload).await;
        }
        let session_id = frame.session_id;
        let key = self
            .state
            .lock()
            .await
            .sessions
            .touch(session_id, Instant::now());
        let Some(key) = key else {
            return fail(CallStatus::WrongSession, "unknown session");
        };
        let Ok(plain) = open(&key, &frame.payload) else {
            return fail(CallStatus::WrongSession, "cannot decrypt call");
        };
        let (counter, function, params) = match decode_session_call(&plain) {
            Ok(c) => c,
            Err(e) => return fail(CallStatus::BadRequest, e),
        };
        if is_reserved_function(&function) {
            return fail(CallStatus::BadRequest, "reserved function inside a session");
        }
        if let Err(e) = self.state.lock().await.sessions.declare(session_id, counter) {
            return match e {
                SessionError::Unknown => fail(CallStatus::WrongSession, e),
                SessionError::Replay(_) => fail(CallStatus::NonceRejected, e),
            };
        }

        trace!(session = session_id, %function, "call");
        let processor = self.processor.clone();
        let params = params.to_vec();
        match tokio::task::spawn_blocking(move || processor.call(&function, &params)).await {
            Ok(Ok(result)) => match seal(&key, &result) {
                Ok(sealed) => (CallStatus::Ok, sealed),
                Err(e) => fail(CallStatus::Error, e),
            },
            // Processor errors stay inside the session like results do.
            Ok(Err(message)) => match seal(&key, message.as_bytes()) {
                Ok(sealed) => (CallStatus::Error, sealed),
                Err(e) => fail(CallStatus::Error, e),
            },
            Err(_) => fail(CallStatus::Error, "processor panicked"),
        }
    }

    /// Session-less calls: only the reserved auth functions.
    async fn execute_plain(&self, payload: &[u8]) -> (CallStatus, Vec<u8>) {
        let (function, params) = match decode_plain_call(payload) {
            Ok(c) => c,
            Err(e) => return fail(CallStatus::BadRequest, e),
        };
        match function.as_str() {
            FN_GET_NONCE => {
                let nonce = self.state.lock().await.nonces.next();
                let mut out = nonce.to_vec();
                out.extend_from_slice(self.keypair.public_key().as_der());
                (CallStatus::Ok, out)
            }
            FN_AUTH => self.authenticate(params).await,
            _ => fail(CallStatus::WrongSession, "function requires a session"),
        }
    }

    async fn authenticate(&self, params: &[u8]) -> (CallStatus, Vec<u8>) {
        let request = match decode_auth_request(params, &self.keypair) {
            Ok(r) => r,
            Err(e) => return fail(CallStatus::AuthFailed, format!("bad auth request: {e}")),
        };
        if !self.state.lock().await.nonces.check(&request.nonce) {
            return fail(CallStatus::AuthFailed, "nonce rejected");
        }
        let processor = self.processor.clone();
        let auth_data = request.auth_data.clone();
        match tokio::task::spawn_blocking(move || processor.auth(&auth_data)).await {
            Ok(Ok(())) => {}
            Ok(Err(message)) => {
                debug!(caller = %request.caller.address(), "auth rejected");
                return (CallStatus::AuthFailed, message.into_bytes());
            }
            Err(_) => return fail(CallStatus::AuthFailed, "auth check panicked"),
        }

        let key = generate_session_key();
        let caller = request.caller.address();
        let id = self
            .state
            .lock()
            .await
            .sessions
            .insert(key, caller, Instant::now());
        match encode_auth_response(id, &key, &request.caller) {
            Ok(response) => {
                info!(%caller, session = id, "session opened");
                (CallStatus::Ok, response)
            }
            Err(e) => {
                self.state.lock().await.sessions.remove(id);
                fail(CallStatus::Error, e)
            }
        }
    }

    fn purge(&self, st: &mut PeerState, now: Instant) {
        let sessions = st.sessions.purge(now, self.config.session_idle());
        let partial = st.calls.purge(now) + st.responses.purge(now);
        if sessions + partial > 0 {
            debug!(sessions, partial, "purged idle state");
        }
    }
}

fn fail(status: CallStatus, message: impl ToString) -> (CallStatus, Vec<u8>) {
    (status, message.to_string().into_bytes())
}

async fn dispatch_loop(inner: Arc<PeerInner>, mut rx: mpsc::UnboundedReceiver<Inbound>) {
    while let Some(inbound) = rx.recv().await {
        let inner = inner.clone();
        tokio::spawn(async move { inner.on_inbound(inbound).await });
    }
}

async fn purge_loop(inner: Arc<PeerInner>) {
    let mut tick = tokio::time::interval(PURGE_INTERVAL);
    loop {
        tick.tick().await;
        let mut st = inner.state.lock().await;
        inner.purge(&mut st, Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xchg_core::call::{
        decode_auth_response, encode_auth_request, encode_plain_call, encode_session_call,
    };
    use xchg_core::nonce::NONCE_LEN;

    struct Echo;

    impl ServerProcessor for Echo {
        fn auth(&self, auth_data: &[u8]) -> std::result::Result<(), String> {
            if auth_data == b"pass" {
                Ok(())
            } else {
                Err("bad password".into())
            }
        }

        fn call(&self, function: &str, parameter: &[u8]) -> std::result::Result<Vec<u8>, String> {
            match function {
                "fail" => Err("it failed".into()),
                _ => Ok(parameter.to_vec()),
            }
        }
    }

    async fn peer() -> Peer {
        let config = PeerConfig {
            udp_enabled: false,
            transports: Vec::new(),
            ..PeerConfig::default()
        };
        let keypair = Arc::new(Keypair::generate_with_bits(1024).unwrap());
        Peer::start(config, keypair, Arc::new(Echo)).await.unwrap()
    }

    async fn open_session(p: &Peer, caller: &Keypair) -> (u64, xchg_core::SessionKey) {
        let inner = &p.inner;
        let (status, out) = inner
            .execute_plain(&encode_plain_call(FN_GET_NONCE, &[]).unwrap())
            .await;
        assert_eq!(status, CallStatus::Ok);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&out[..NONCE_LEN]);
        let callee = xchg_core::PublicKey::from_der(&out[NONCE_LEN..]).unwrap();
        assert_eq!(callee.address(), p.address());
        let req = encode_auth_request(caller.public_key(), &callee, &nonce, b"pass").unwrap();
        let (status, out) = inner
            .execute_plain(&encode_plain_call(FN_AUTH, &req).unwrap())
            .await;
        assert_eq!(status, CallStatus::Ok);
        decode_auth_response(&out, caller).unwrap()
    }

    fn session_call(id: u64, key: &xchg_core::SessionKey, counter: u64, f: &str) -> CallFrame {
        let sealed = seal(key, &encode_session_call(counter, f, b"hi").unwrap()).unwrap();
        CallFrame::call(1, id, sealed)
    }

    #[tokio::test]
    async fn auth_then_session_call() {
        let p = peer().await;
        let caller = Keypair::generate_with_bits(1024).unwrap();
        let (id, key) = open_session(&p, &caller).await;
        assert_eq!(p.session_count().await, 1);

        let (status, out) = p.inner.execute(&session_call(id, &key, 0, "echo")).await;
        assert_eq!(status, CallStatus::Ok);
        assert_eq!(open(&key, &out).unwrap(), b"hi");

        let (status, out) = p.inner.execute(&session_call(id, &key, 1, "fail")).await;
        assert_eq!(status, CallStatus::Error);
        assert_ne!(out, b"it failed");
        assert_eq!(open(&key, &out).unwrap(), b"it failed");
        p.shutdown().await;
    }

    #[tokio::test]
    async fn replayed_counter_is_rejected() {
        let p = peer().await;
        let caller = Keypair::generate_with_bits(1024).unwrap();
        let (id, key) = open_session(&p, &caller).await;
        let frame = session_call(id, &key, 3, "echo");
        assert_eq!(p.inner.execute(&frame).await.0, CallStatus::Ok);
        assert_eq!(p.inner.execute(&frame).await.0, CallStatus::NonceRejected);
        p.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_session_and_plain_app_call() {
        let p = peer().await;
        let (status, _) = p.inner.execute(&session_call(42, &[1; 32], 0, "echo")).await;
        assert_eq!(status, CallStatus::WrongSession);
        let plain = CallFrame::call(1, 0, encode_plain_call("echo", b"x").unwrap());
        assert_eq!(p.inner.execute(&plain).await.0, CallStatus::WrongSession);
        p.shutdown().await;
    }

    #[tokio::test]
    async fn nonce_is_single_use() {
        let p = peer().await;
        let caller = Keypair::generate_with_bits(1024).unwrap();
        let (_, out) = p
            .inner
            .execute_plain(&encode_plain_call(FN_GET_NONCE, &[]).unwrap())
            .await;
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&out[..NONCE_LEN]);
        let callee = xchg_core::PublicKey::from_der(&out[NONCE_LEN..]).unwrap();
        let req = encode_auth_request(caller.public_key(), &callee, &nonce, b"pass").unwrap();
        let call = encode_plain_call(FN_AUTH, &req).unwrap();
        assert_eq!(p.inner.execute_plain(&call).await.0, CallStatus::Ok);
        assert_eq!(p.inner.execute_plain(&call).await.0, CallStatus::AuthFailed);
        p.shutdown().await;
    }

    #[tokio::test]
    async fn wrong_auth_data_opens_no_session() {
        let p = peer().await;
        let caller = Keypair::generate_with_bits(1024).unwrap();
        let (_, out) = p
            .inner
            .execute_plain(&encode_plain_call(FN_GET_NONCE, &[]).unwrap())
            .await;
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&out[..NONCE_LEN]);
        let callee = xchg_core::PublicKey::from_der(&out[NONCE_LEN..]).unwrap();
        let req = encode_auth_request(caller.public_key(), &callee, &nonce, b"nope").unwrap();
        let (status, msg) = p
            .inner
            .execute_plain(&encode_plain_call(FN_AUTH, &req).unwrap())
            .await;
        assert_eq!(status, CallStatus::AuthFailed);
        assert_eq!(msg, b"bad password");
        assert_eq!(p.session_count().await, 0);
        p.shutdown().await;
    }
}
