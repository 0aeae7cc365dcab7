//! Raw-frame clients against a live router on loopback.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use xchg_core::{
    CallFrame, CallStatus, FrameError, Handshake, Keypair, RelayFrame, RelayFrameType,
};
use xchg_router::{Router, RouterConfig};

fn test_keypair() -> Arc<Keypair> {
    Arc::new(Keypair::generate_with_bits(1024).unwrap())
}

fn local_config() -> RouterConfig {
    RouterConfig {
        bind_host: "127.0.0.1".to_string(),
        tcp_port: 0,
        http_port: 0,
        sweep_interval_ms: 50,
        ..RouterConfig::default()
    }
}

async fn start(config: RouterConfig) -> Arc<Router> {
    let router = Router::bind(config, test_keypair()).await.unwrap();
    router.spawn();
    router
}

struct Client {
    keypair: Arc<Keypair>,
    stream: TcpStream,
    buf: Vec<u8>,
    sid: u64,
}

impl Client {
    async fn raw(addr: SocketAddr) -> Self {
        Self {
            keypair: test_keypair(),
            stream: TcpStream::connect(addr).await.unwrap(),
            buf: Vec::new(),
            sid: 0,
        }
    }

    async fn connect(addr: SocketAddr) -> Self {
        let mut c = Self::raw(addr).await;
        let mut hs = Handshake::initiator(c.keypair.clone());
        for (t, p) in hs.start() {
            c.send(RelayFrame::new(t, 0, 0, p)).await;
        }
        while !hs.is_established() {
            let f = c.recv().await.expect("handshake frame");
            c.sid = f.sid;
            for (t, p) in hs.on_frame(f.frame_type, &f.payload).unwrap() {
                c.send(RelayFrame::new(t, 0, 0, p)).await;
            }
        }
        c
    }

    async fn send(&mut self, frame: RelayFrame) {
        self.stream.write_all(&frame.encode()).await.unwrap();
    }

    /// Several frames in one write, so the router decodes them from one read.
    async fn send_burst(&mut self, frames: &[RelayFrame]) {
        let bytes: Vec<u8> = frames.iter().flat_map(|f| f.encode()).collect();
        self.stream.write_all(&bytes).await.unwrap();
    }

    /// Next frame, or None after one second of silence.
    async fn recv(&mut self) -> Option<RelayFrame> {
        let mut chunk = [0u8; 4096];
        loop {
            match RelayFrame::decode(&self.buf) {
                Ok((frame, used)) => {
                    self.buf.drain(..used);
                    return Some(frame);
                }
                Err(FrameError::NeedMore) => {}
                Err(e) => panic!("bad frame from router: {e}"),
            }
            let n = timeout(Duration::from_secs(1), self.stream.read(&mut chunk))
                .await
                .ok()?
                .ok()?;
            if n == 0 {
                return None;
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn resolve(&mut self, other: &Client) -> RelayFrame {
        let text = other.keypair.address().to_string().into_bytes();
        self.send(RelayFrame::new(RelayFrameType::ResolveAddress, 0, 1, text))
            .await;
        self.recv().await.expect("resolve reply")
    }
}

#[tokio::test]
async fn call_and_response_are_relayed_with_original_id() {
    let router = start(local_config()).await;
    let mut a = Client::connect(router.tcp_addr()).await;
    let mut b = Client::connect(router.tcp_addr()).await;

    let resolved = a.resolve(&b).await;
    assert_eq!(resolved.frame_type, RelayFrameType::ResolvedAddress);
    assert_eq!(resolved.sid, b.sid);

    let payload = CallFrame::call(77, 0, b"\x07version".to_vec()).encode();
    let mut call = RelayFrame::new(RelayFrameType::Call, b.sid, 77, payload.clone());
    call.session_id = 9;
    a.send(call).await;

    let got = b.recv().await.expect("relayed call");
    assert_eq!(got.frame_type, RelayFrameType::Call);
    assert_eq!(got.payload, payload);
    assert_eq!(got.session_id, 9);
    assert_eq!(router.pending_count().await, 1);

    let response = CallFrame::response(CallStatus::Ok, 77, 0, b"1.0".to_vec()).encode();
    b.send(RelayFrame::new(
        RelayFrameType::Response,
        a.sid,
        got.transaction_id,
        response.clone(),
    ))
    .await;

    let back = a.recv().await.expect("relayed response");
    assert_eq!(back.frame_type, RelayFrameType::Response);
    assert_eq!(back.transaction_id, 77);
    assert_eq!(back.payload, response);
    assert_eq!(router.pending_count().await, 0);
}

#[tokio::test]
async fn chunks_share_one_router_id_until_final_response() {
    let router = start(local_config()).await;
    let mut a = Client::connect(router.tcp_addr()).await;
    let mut b = Client::connect(router.tcp_addr()).await;
    let sid = a.resolve(&b).await.sid;

    let chunks = xchg_core::split_into_chunks(
        xchg_core::CallFrameType::Call,
        CallStatus::Ok,
        5,
        0,
        &[1u8; 3000],
        1024,
    );
    assert_eq!(chunks.len(), 3);
    for c in &chunks {
        a.send(RelayFrame::new(RelayFrameType::Call, sid, 5, c.encode()))
            .await;
    }
    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(b.recv().await.unwrap().transaction_id);
    }
    assert!(ids.iter().all(|id| *id == ids[0]));

    let reply = xchg_core::split_into_chunks(
        xchg_core::CallFrameType::Response,
        CallStatus::Ok,
        5,
        0,
        &[2u8; 2000],
        1024,
    );
    b.send(RelayFrame::new(RelayFrameType::Response, 0, ids[0], reply[0].encode()))
        .await;
    assert_eq!(a.recv().await.unwrap().transaction_id, 5);
    assert_eq!(router.pending_count().await, 1);
    b.send(RelayFrame::new(RelayFrameType::Response, 0, ids[0], reply[1].encode()))
        .await;
    assert_eq!(a.recv().await.unwrap().transaction_id, 5);
    assert_eq!(router.pending_count().await, 0);
}

/// Relay one call from `a` to `b` and return the router id `b` sees.
async fn relayed_call(a: &mut Client, b: &mut Client, sid: u64, txid: u64) -> u64 {
    let payload = CallFrame::call(txid, 0, b"\x04echo".to_vec()).encode();
    a.send(RelayFrame::new(RelayFrameType::Call, sid, txid, payload))
        .await;
    b.recv().await.expect("relayed call").transaction_id
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn burst_of_response_chunks_reaches_caller_whole() {
    let router = start(local_config()).await;
    let mut a = Client::connect(router.tcp_addr()).await;
    let mut b = Client::connect(router.tcp_addr()).await;
    let sid = a.resolve(&b).await.sid;

    let body: Vec<u8> = (0..8000u32).map(|i| i as u8).collect();
    for txid in 1..=20u64 {
        let router_id = relayed_call(&mut a, &mut b, sid, txid).await;
        let reply = xchg_core::split_into_chunks(
            xchg_core::CallFrameType::Response,
            CallStatus::Ok,
            txid,
            0,
            &body,
            1024,
        );
        assert_eq!(reply.len(), 8);
        let frames: Vec<RelayFrame> = reply
            .iter()
            .map(|c| RelayFrame::new(RelayFrameType::Response, 0, router_id, c.encode()))
            .collect();
        b.send_burst(&frames).await;

        let mut reassembler = xchg_core::Reassembler::new();
        let mut whole = None;
        for _ in 0..8 {
            let f = a.recv().await.expect("response chunk");
            assert_eq!(f.transaction_id, txid);
            let chunk = CallFrame::decode(&f.payload).unwrap();
            if let xchg_core::ChunkReceiveResult::Complete(done) =
                reassembler.push((), chunk, std::time::Instant::now())
            {
                whole = Some(done.payload);
            }
        }
        assert_eq!(whole.as_deref(), Some(body.as_slice()));
    }
    assert_eq!(router.pending_count().await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn final_chunk_first_keeps_transaction_open() {
    let router = start(local_config()).await;
    let mut a = Client::connect(router.tcp_addr()).await;
    let mut b = Client::connect(router.tcp_addr()).await;
    let sid = a.resolve(&b).await.sid;
    let router_id = relayed_call(&mut a, &mut b, sid, 9).await;

    let reply = xchg_core::split_into_chunks(
        xchg_core::CallFrameType::Response,
        CallStatus::Ok,
        9,
        0,
        &[3u8; 2500],
        1024,
    );
    assert_eq!(reply.len(), 3);
    let frames: Vec<RelayFrame> = [&reply[2], &reply[0], &reply[1]]
        .iter()
        .map(|c| RelayFrame::new(RelayFrameType::Response, 0, router_id, c.encode()))
        .collect();
    b.send_burst(&frames).await;

    let mut offsets = Vec::new();
    for _ in 0..3 {
        let f = a.recv().await.expect("response chunk");
        offsets.push(CallFrame::decode(&f.payload).unwrap().offset);
    }
    assert_eq!(offsets, vec![2048, 0, 1024]);
    assert_eq!(router.pending_count().await, 0);
}

#[tokio::test]
async fn failed_handshake_closes_the_link() {
    let router = start(local_config()).await;
    let mut c = Client::raw(router.tcp_addr()).await;
    c.send(RelayFrame::new(RelayFrameType::Init5, 0, 0, vec![1; 16]))
        .await;
    assert!(c.recv().await.is_none());
    let mut closed = false;
    for _ in 0..50 {
        if router.connection_count().await == 0 {
            closed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(closed, "router must drop a link whose handshake failed");
}

#[tokio::test]
async fn routing_errors_come_back_as_error_frames() {
    let router = start(local_config()).await;
    let mut a = Client::connect(router.tcp_addr()).await;
    let stranger = Client::raw(router.tcp_addr()).await;

    let reply = a.resolve(&stranger).await;
    assert_eq!(reply.frame_type, RelayFrameType::Error);
    assert_eq!(reply.payload, b"address not found");

    a.send(RelayFrame::new(RelayFrameType::Call, 999, 3, b"x".to_vec()))
        .await;
    let reply = a.recv().await.unwrap();
    assert_eq!(reply.frame_type, RelayFrameType::Error);
    assert_eq!(reply.transaction_id, 3);
    assert_eq!(reply.payload, b"no route to peer");
}

#[tokio::test]
async fn unconfirmed_connections_cannot_route_and_are_swept() {
    let config = RouterConfig {
        handshake_timeout_ms: 200,
        ..local_config()
    };
    let router = start(config).await;
    let b = Client::connect(router.tcp_addr()).await;
    let mut idle = Client::raw(router.tcp_addr()).await;

    idle.send(RelayFrame::new(RelayFrameType::Call, b.sid, 1, b"x".to_vec()))
        .await;
    assert!(idle.recv().await.is_none(), "stalled link must be closed without a reply");
    assert_eq!(router.connection_count().await, 1);
}

#[tokio::test]
async fn late_response_is_dropped_after_pending_timeout() {
    let config = RouterConfig {
        transaction_timeout_ms: 200,
        ..local_config()
    };
    let router = start(config).await;
    let mut a = Client::connect(router.tcp_addr()).await;
    let mut b = Client::connect(router.tcp_addr()).await;
    let sid = a.resolve(&b).await.sid;

    let payload = CallFrame::call(11, 0, b"\x04slow".to_vec()).encode();
    a.send(RelayFrame::new(RelayFrameType::Call, sid, 11, payload))
        .await;
    let got = b.recv().await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(router.pending_count().await, 0);

    let late = CallFrame::response(CallStatus::Ok, 11, 0, b"late".to_vec()).encode();
    b.send(RelayFrame::new(RelayFrameType::Response, 0, got.transaction_id, late))
        .await;
    assert!(a.recv().await.is_none(), "late response must not reach the caller");

    // The router keeps working.
    let payload = CallFrame::call(12, 0, b"\x04fast".to_vec()).encode();
    a.send(RelayFrame::new(RelayFrameType::Call, sid, 12, payload.clone()))
        .await;
    assert_eq!(b.recv().await.unwrap().payload, payload);
}

#[tokio::test]
async fn status_and_mailbox_over_http() {
    let router = start(local_config()).await;
    let _a = Client::connect(router.tcp_addr()).await;
    let target = test_keypair().address();

    let status = http(router.http_addr(), "GET /api/status HTTP/1.1\r\nHost: r\r\n\r\n", b"").await;
    let json: serde_json::Value = serde_json::from_slice(&status).unwrap();
    assert_eq!(json["address"], router.address().to_string());
    assert_eq!(json["confirmed"], 1);

    let envelope = xchg_core::envelope::encode_envelope(
        &test_keypair().address(),
        &CallFrame::call(1, 0, b"\x01x".to_vec()),
    );
    let head = format!(
        "POST /api/w?a={} HTTP/1.1\r\nHost: r\r\nContent-Length: {}\r\n\r\n",
        target,
        envelope.len()
    );
    assert_eq!(http(router.http_addr(), &head, &envelope).await, b"ok");

    let head = format!("GET /api/r?a={}&t=100 HTTP/1.1\r\nHost: r\r\n\r\n", target);
    let body = http(router.http_addr(), &head, b"").await;
    assert_eq!(xchg_core::envelope::decode_envelope_stream(&body), vec![envelope]);
}

async fn http(addr: SocketAddr, head: &str, body: &[u8]) -> Vec<u8> {
    let mut s = TcpStream::connect(addr).await.unwrap();
    s.write_all(head.as_bytes()).await.unwrap();
    s.write_all(body).await.unwrap();
    let mut out = Vec::new();
    s.read_to_end(&mut out).await.unwrap();
    let split = out.windows(4).position(|w| w == b"\r\n\r\n").unwrap();
    out[split + 4..].to_vec()
}
