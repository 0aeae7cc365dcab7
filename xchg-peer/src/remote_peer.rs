//! Client side of one remote address: session auth, transport fallback, response wait.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tracing::{debug, trace};
use xchg_core::call::{
    decode_auth_response, encode_auth_request, encode_plain_call, encode_session_call,
};
use xchg_core::identity::{open, seal};
use xchg_core::nonce::NONCE_LEN;
use xchg_core::protocol::{is_reserved_function, FN_AUTH, FN_GET_NONCE};
use xchg_core::{
    split_into_chunks, Address, CallFrame, CallFrameType, CallStatus, Keypair, PublicKey,
    SessionKey, DEFAULT_CHUNK_SIZE,
};

use crate::error::{PeerError, Result};
use crate::transport::{Readiness, Transport};

/// Callers waiting for a response, by transaction id. At most one waiter per transaction.
#[derive(Default)]
pub struct Waiters {
    map: Mutex<HashMap<u64, oneshot::Sender<CallFrame>>>,
}

impl Waiters {
    async fn register(&self, transaction_id: u64) -> oneshot::Receiver<CallFrame> {
        let (tx, rx) = oneshot::channel();
        self.map.lock().await.insert(transaction_id, tx);
        rx
    }

    async fn cancel(&self, transaction_id: u64) {
        self.map.lock().await.remove(&transaction_id);
    }

    /// Hand a reassembled response to its caller. False if nobody waits for it.
    pub async fn complete(&self, frame: CallFrame) -> bool {
        match self.map.lock().await.remove(&frame.transaction_id) {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    /// Fail every pending call.
    pub async fn clear(&self) {
        self.map.lock().await.clear();
    }
}

#[derive(Default)]
struct ClientSession {
    id: u64,
    key: Option<SessionKey>,
    next_counter: u64,
}

pub struct RemotePeer {
    address: Address,
    keypair: Arc<Keypair>,
    waiters: Arc<Waiters>,
    next_transaction_id: Arc<AtomicU64>,
    session: Mutex<ClientSession>,
    transports: Vec<Mutex<Transport>>,
    /// One auth exchange at a time.
    auth_lock: Mutex<()>,
}

impl RemotePeer {
    pub(crate) fn new(
        address: Address,
        keypair: Arc<Keypair>,
        transports: Vec<Transport>,
        waiters: Arc<Waiters>,
        next_transaction_id: Arc<AtomicU64>,
    ) -> Self {
        Self {
            address,
            keypair,
            waiters,
            next_transaction_id,
            session: Mutex::new(ClientSession::default()),
            transports: transports.into_iter().map(Mutex::new).collect(),
            auth_lock: Mutex::new(()),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub async fn has_session(&self) -> bool {
        self.session.lock().await.key.is_some()
    }

    /// Call `function` on the remote, authenticating with `auth` first if there is no session.
    pub async fn call(
        &self,
        function: &str,
        data: &[u8],
        auth: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        if is_reserved_function(function) {
            return Err(PeerError::Protocol(format!("{function} is reserved")));
        }
        let (session_id, key, counter) = self.ensure_session(auth, timeout).await?;
        let sealed = seal(&key, &encode_session_call(counter, function, data)?)?;
        let response = self
            .transact(session_id, &sealed, timeout, Some(&key))
            .await?;
        match response.status {
            CallStatus::Ok => match open(&key, &response.payload) {
                Ok(plain) => Ok(plain),
                Err(e) => {
                    self.invalidate(&key).await;
                    Err(e.into())
                }
            },
            status if status.invalidates_session() => {
                self.invalidate(&key).await;
                Err(PeerError::Session(message(&response)))
            }
            CallStatus::AuthFailed => {
                self.invalidate(&key).await;
                Err(PeerError::AuthFailed(message(&response)))
            }
            // Processor errors come sealed; router and transport errors do not.
            status => Err(PeerError::Remote {
                status,
                message: match open(&key, &response.payload) {
                    Ok(plain) => String::from_utf8_lossy(&plain).into_owned(),
                    Err(_) => message(&response),
                },
            }),
        }
    }

    /// Current session (id, key, next counter), authenticating if needed.
    async fn ensure_session(
        &self,
        auth: &[u8],
        timeout: Duration,
    ) -> Result<(u64, SessionKey, u64)> {
        if let Some(s) = self.take_counter().await {
            return Ok(s);
        }
        let _auth = self.auth_lock.lock().await;
        if let Some(s) = self.take_counter().await {
            return Ok(s);
        }
        let (id, key) = self.authenticate(auth, timeout).await?;
        let mut s = self.session.lock().await;
        *s = ClientSession {
            id,
            key: Some(key),
            next_counter: 1,
        };
        debug!(remote = %self.address, session = id, "session established");
        Ok((id, key, 0))
    }

    async fn take_counter(&self) -> Option<(u64, SessionKey, u64)> {
        let mut s = self.session.lock().await;
        let key = s.key?;
        let counter = s.next_counter;
        s.next_counter += 1;
        Some((s.id, key, counter))
    }

    /// `/xchg-get-nonce` then `/xchg-auth`.
    async fn authenticate(&self, auth: &[u8], timeout: Duration) -> Result<(u64, SessionKey)> {
        let response = self
            .transact(0, &encode_plain_call(FN_GET_NONCE, &[])?, timeout, None)
            .await?;
        if response.status != CallStatus::Ok {
            return Err(PeerError::AuthFailed(message(&response)));
        }
        if response.payload.len() <= NONCE_LEN {
            return Err(PeerError::Protocol("short nonce response".into()));
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&response.payload[..NONCE_LEN]);
        let callee = PublicKey::from_der(&response.payload[NONCE_LEN..])?;
        if callee.address() != self.address {
            return Err(PeerError::AddressMismatch);
        }

        let request = encode_auth_request(self.keypair.public_key(), &callee, &nonce, auth)?;
        let response = self
            .transact(0, &encode_plain_call(FN_AUTH, &request)?, timeout, None)
            .await?;
        if response.status != CallStatus::Ok {
            return Err(PeerError::AuthFailed(message(&response)));
        }
        Ok(decode_auth_response(&response.payload, &self.keypair)?)
    }

    /// Send one logical message and wait for its (reassembled) response.
    async fn transact(
        &self,
        session_id: u64,
        payload: &[u8],
        timeout: Duration,
        key: Option<&SessionKey>,
    ) -> Result<CallFrame> {
        let transaction_id = self.next_transaction_id.fetch_add(1, Ordering::Relaxed);
        let frames = split_into_chunks(
            CallFrameType::Call,
            CallStatus::Ok,
            transaction_id,
            session_id,
            payload,
            DEFAULT_CHUNK_SIZE,
        );
        let rx = self.waiters.register(transaction_id).await;
        if let Err(e) = self.send_frames(&frames).await {
            self.waiters.cancel(transaction_id).await;
            return Err(e);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(PeerError::Shutdown),
            Err(_) => {
                self.waiters.cancel(transaction_id).await;
                debug!(remote = %self.address, transaction_id, "call timed out");
                self.on_timeout(key).await;
                Err(PeerError::Timeout)
            }
        }
    }

    /// Try transports in order; all chunks go through the first one that takes them.
    async fn send_frames(&self, frames: &[CallFrame]) -> Result<()> {
        if self.transports.is_empty() {
            return Err(PeerError::NoTransport("no transport configured".into()));
        }
        let mut failures = Vec::new();
        for transport in &self.transports {
            let (kind, readiness) = {
                let mut t = transport.lock().await;
                (t.kind(), t.readiness().await)
            };
            let ready = match readiness {
                Readiness::Ready => true,
                Readiness::Unavailable => false,
                // Discovery and resolution run unlocked; concurrent calls and resets go on.
                Readiness::Lookup(lookup) => {
                    let route = lookup.run().await;
                    let found = route.is_some();
                    transport.lock().await.learn(route);
                    found
                }
            };
            if !ready {
                failures.push(format!("{kind}: unavailable"));
                continue;
            }
            let mut t = transport.lock().await;
            match t.send(frames).await {
                Ok(()) => {
                    trace!(remote = %self.address, %kind, chunks = frames.len(), "sent");
                    return Ok(());
                }
                Err(e) => {
                    debug!(remote = %self.address, %kind, error = %e, "send failed, trying next transport");
                    t.declare_error().await;
                    failures.push(format!("{kind}: {e}"));
                }
            }
        }
        Err(PeerError::NoTransport(failures.join("; ")))
    }

    async fn declare_errors(&self) {
        for transport in &self.transports {
            transport.lock().await.declare_error().await;
        }
    }

    async fn on_timeout(&self, key: Option<&SessionKey>) {
        self.declare_errors().await;
        if let Some(key) = key {
            self.invalidate(key).await;
        }
    }

    /// Drop the session if it still uses `key`.
    async fn invalidate(&self, key: &SessionKey) {
        let mut s = self.session.lock().await;
        if s.key.as_ref() == Some(key) {
            debug!(remote = %self.address, session = s.id, "session dropped");
            *s = ClientSession::default();
        }
    }

    /// Forget the session and every learned route.
    pub async fn reset(&self) {
        *self.session.lock().await = ClientSession::default();
        self.declare_errors().await;
    }
}

fn message(frame: &CallFrame) -> String {
    String::from_utf8_lossy(&frame.payload).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerConfig;
    use crate::transport::{UdpNode, UdpTransport};

    fn remote(transports: Vec<Transport>) -> RemotePeer {
        let keypair = Arc::new(Keypair::generate_with_bits(1024).unwrap());
        RemotePeer::new(
            Address::from_bytes([3; xchg_core::ADDRESS_LEN]),
            keypair,
            transports,
            Arc::new(Waiters::default()),
            Arc::new(AtomicU64::new(1)),
        )
    }

    #[tokio::test]
    async fn no_transport_fails_before_waiting() {
        let r = remote(Vec::new());
        let started = std::time::Instant::now();
        let err = r
            .call("version", b"", b"pass", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::NoTransport(_)));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!r.has_session().await);
    }

    #[tokio::test]
    async fn reserved_names_are_not_callable() {
        let r = remote(Vec::new());
        let err = r
            .call(FN_AUTH, b"", b"", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::Protocol(_)));
    }

    #[tokio::test]
    async fn waiters_deliver_once() {
        let w = Waiters::default();
        let rx = w.register(9).await;
        assert!(w.complete(CallFrame::response(CallStatus::Ok, 9, 0, b"x".to_vec())).await);
        assert!(!w.complete(CallFrame::response(CallStatus::Ok, 9, 0, b"y".to_vec())).await);
        assert_eq!(rx.await.unwrap().payload, b"x");
    }

    #[tokio::test]
    async fn session_counters_increase() {
        let r = remote(Vec::new());
        *r.session.lock().await = ClientSession {
            id: 5,
            key: Some([7; 32]),
            next_counter: 0,
        };
        assert_eq!(r.take_counter().await, Some((5, [7; 32], 0)));
        assert_eq!(r.take_counter().await, Some((5, [7; 32], 1)));
        r.invalidate(&[8; 32]).await;
        assert!(r.has_session().await);
        r.invalidate(&[7; 32]).await;
        assert!(!r.has_session().await);
    }

    #[tokio::test]
    async fn reset_does_not_wait_for_discovery() {
        let config = PeerConfig {
            udp_port_start: 43250,
            udp_port_end: 43254,
            broadcast_addr: "127.0.0.1".to_string(),
            discovery_timeout_ms: 1000,
            ..PeerConfig::default()
        };
        let keypair = Arc::new(Keypair::generate_with_bits(1024).unwrap());
        let node = Arc::new(UdpNode::bind(&config, keypair).await.unwrap());
        let target = Address::from_bytes([3; xchg_core::ADDRESS_LEN]);
        let r = Arc::new(remote(vec![Transport::Udp(UdpTransport::new(node, target))]));

        let calling = tokio::spawn({
            let r = r.clone();
            async move { r.call("version", b"", b"pass", Duration::from_secs(5)).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = std::time::Instant::now();
        r.reset().await;
        assert!(started.elapsed() < Duration::from_millis(300));

        let err = calling.await.unwrap().unwrap_err();
        assert!(matches!(err, PeerError::NoTransport(_)));
    }
}
