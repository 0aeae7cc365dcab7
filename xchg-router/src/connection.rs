//! One accepted TCP link: reader task (owns the handshake), writer task fed by a channel.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, trace};
use xchg_core::{Address, FrameError, Handshake, RelayFrame};

use crate::router::Router;

const READ_BUF: usize = 64 * 1024;

pub struct RouterConnection {
    id: u64,
    remote: SocketAddr,
    created: Instant,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    address: Mutex<Option<Address>>,
    closed: AtomicBool,
    shutdown: Notify,
}

impl RouterConnection {
    fn new(id: u64, remote: SocketAddr, tx: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self {
            id,
            remote,
            created: Instant::now(),
            tx,
            address: Mutex::new(None),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    /// SID: router-local id of this link.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    /// Address proven by the handshake, if it completed.
    pub async fn address(&self) -> Option<Address> {
        *self.address.lock().await
    }

    pub(crate) async fn set_address(&self, address: Address) {
        *self.address.lock().await = Some(address);
    }

    /// Queue a frame for the writer task. False once the link is gone.
    pub fn send(&self, frame: &RelayFrame) -> bool {
        !self.is_closed() && self.tx.send(frame.encode()).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }

    /// Stop the reader; the writer ends when the last handle drops.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shutdown.notify_one();
        }
    }
}

/// Serve one accepted stream until it closes, fails to decode, or is closed by the sweep.
pub(crate) async fn run_connection(router: Arc<Router>, stream: TcpStream, remote: SocketAddr) {
    let _ = stream.set_nodelay(true);
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let conn = Arc::new(RouterConnection::new(router.next_connection_id(), remote, tx));
    router.register(conn.clone()).await;
    debug!(sid = conn.id, %remote, "connection accepted");

    let (mut reader, mut writer) = stream.into_split();
    tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if writer.write_all(&bytes).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut handshake = Handshake::responder(router.keypair());
    let mut pending: Vec<u8> = Vec::new();
    let mut buf = vec![0u8; READ_BUF];
    'read: loop {
        let n = tokio::select! {
            r = reader.read(&mut buf) => match r {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            },
            _ = conn.shutdown.notified() => break,
        };
        pending.extend_from_slice(&buf[..n]);
        loop {
            match RelayFrame::decode(&pending) {
                Ok((frame, used)) => {
                    pending.drain(..used);
                    if !on_frame(&router, &conn, &mut handshake, frame).await {
                        break 'read;
                    }
                }
                Err(FrameError::NeedMore) => break,
                Err(e) => {
                    // A TCP stream cannot resync after a bad header.
                    debug!(sid = conn.id, error = %e, "malformed relay frame, closing");
                    break 'read;
                }
            }
        }
    }

    conn.close();
    router.remove_connection(conn.id).await;
    debug!(sid = conn.id, "connection closed");
}

/// Handle one frame in arrival order. False closes the link.
async fn on_frame(
    router: &Arc<Router>,
    conn: &Arc<RouterConnection>,
    handshake: &mut Handshake,
    frame: RelayFrame,
) -> bool {
    if frame.frame_type.is_handshake() {
        if handshake.is_established() {
            trace!(sid = conn.id, frame_type = ?frame.frame_type, "handshake frame after confirmation");
            return true;
        }
        let out = match handshake.on_frame(frame.frame_type, &frame.payload) {
            Ok(out) => out,
            Err(e) => {
                debug!(sid = conn.id, error = %e, "handshake failed, closing");
                return false;
            }
        };
        // Publish before Init6 leaves so the peer never sees itself unresolvable.
        if handshake.is_established() {
            if let Some(address) = handshake.remote_address() {
                router.confirm(conn, address).await;
            }
        }
        for (t, payload) in out {
            conn.send(&RelayFrame::new(t, conn.id, frame.transaction_id, payload));
        }
        return true;
    }
    if !handshake.is_established() {
        debug!(sid = conn.id, frame_type = ?frame.frame_type, "frame before handshake, dropped");
        return true;
    }
    // Inline so chunks of one transaction reach the router in the order they arrived.
    router.dispatch(conn, frame).await;
    true
}
