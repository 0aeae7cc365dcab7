//! Minimal HTTP/1.1 endpoint: status JSON and the mailbox used by the HTTP-relay transport.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, trace};
use xchg_core::frame::MAX_FRAME_LEN;
use xchg_core::envelope::encode_envelope_stream;
use xchg_core::{Address, ADDRESS_LEN, CALL_HEADER_LEN};

use crate::router::Router;

/// Longest long-poll a reader may ask for.
pub const MAX_POLL: Duration = Duration::from_secs(30);

const MAX_HEADER: usize = 16 * 1024;

pub(crate) async fn serve(router: Arc<Router>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let router = router.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, router).await {
                        trace!(error = %e, "http client error");
                    }
                });
            }
            Err(e) => {
                debug!(error = %e, "http accept failed");
                break;
            }
        }
    }
}

struct Request {
    method: String,
    path: String,
    query: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Request {
    fn param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Parse head; None until the head is complete. Returns (request without body, head length, content length).
fn parse_head(buf: &[u8]) -> Result<Option<(Request, usize, usize)>, &'static str> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);
    let status = req.parse(buf).map_err(|_| "bad request")?;
    let head_len = match status {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Ok(None),
    };
    let method = req.method.ok_or("bad request")?.to_string();
    let target = req.path.ok_or("bad request")?;
    let mut content_length = 0usize;
    for h in req.headers.iter() {
        if h.name.eq_ignore_ascii_case("Content-Length") {
            content_length = std::str::from_utf8(h.value)
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .ok_or("bad content length")?;
        }
    }
    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p, parse_query(q)),
        None => (target, Vec::new()),
    };
    Ok(Some((
        Request {
            method,
            path: path.to_string(),
            query,
            body: Vec::new(),
        },
        head_len,
        content_length,
    )))
}

fn parse_query(q: &str) -> Vec<(String, String)> {
    q.split('&')
        .filter(|kv| !kv.is_empty())
        .map(|kv| match kv.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (kv.to_string(), String::new()),
        })
        .collect()
}

async fn read_request(client: &mut TcpStream) -> std::io::Result<Option<Request>> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = vec![0u8; 8192];
    loop {
        let n = client.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
        match parse_head(&buf) {
            Ok(Some((mut req, head_len, content_length))) => {
                if content_length > MAX_FRAME_LEN + ADDRESS_LEN {
                    return Err(invalid("body too large"));
                }
                while buf.len() < head_len + content_length {
                    let n = client.read(&mut chunk).await?;
                    if n == 0 {
                        return Err(invalid("truncated body"));
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }
                req.body = buf[head_len..head_len + content_length].to_vec();
                return Ok(Some(req));
            }
            Ok(None) if buf.len() > MAX_HEADER => return Err(invalid("header too large")),
            Ok(None) => {}
            Err(e) => return Err(invalid(e)),
        }
    }
}

fn invalid(msg: &'static str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg)
}

async fn handle_client(mut client: TcpStream, router: Arc<Router>) -> std::io::Result<()> {
    let req = match read_request(&mut client).await {
        Ok(Some(r)) => r,
        Ok(None) => return Ok(()),
        Err(e) => {
            write_response(&mut client, 400, "text/plain", e.to_string().as_bytes()).await?;
            return Ok(());
        }
    };
    let (code, content_type, body) = route(&router, req).await;
    write_response(&mut client, code, content_type, &body).await
}

async fn route(router: &Router, req: Request) -> (u16, &'static str, Vec<u8>) {
    match (req.method.as_str(), req.path.as_str()) {
        ("GET", "/api/status") => match serde_json::to_vec(&router.status().await) {
            Ok(json) => (200, "application/json", json),
            Err(e) => (500, "text/plain", e.to_string().into_bytes()),
        },
        ("POST", "/api/w") => {
            let Some(to) = req.param("a").and_then(|a| a.parse::<Address>().ok()) else {
                return (400, "text/plain", b"bad address".to_vec());
            };
            if req.body.len() < ADDRESS_LEN + CALL_HEADER_LEN {
                return (400, "text/plain", b"bad envelope".to_vec());
            }
            router.mailbox().push(to, req.body).await;
            (200, "text/plain", b"ok".to_vec())
        }
        ("GET", "/api/r") => {
            let Some(to) = req.param("a").and_then(|a| a.parse::<Address>().ok()) else {
                return (400, "text/plain", b"bad address".to_vec());
            };
            let wait = req
                .param("t")
                .and_then(|t| t.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(Duration::ZERO)
                .min(MAX_POLL);
            let envelopes = router.mailbox().pull(to, wait).await;
            (200, "application/octet-stream", encode_envelope_stream(&envelopes))
        }
        _ => (404, "text/plain", b"not found".to_vec()),
    }
}

async fn write_response(
    client: &mut TcpStream,
    code: u16,
    content_type: &str,
    body: &[u8],
) -> std::io::Result<()> {
    let reason = match code {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        _ => "Internal Server Error",
    };
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        code,
        reason,
        content_type,
        body.len()
    );
    client.write_all(head.as_bytes()).await?;
    client.write_all(body).await?;
    client.flush().await?;
    client.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_with_query_and_body_length() {
        let raw = b"POST /api/w?a=abc&x HTTP/1.1\r\nHost: r\r\nContent-Length: 5\r\n\r\nhello";
        let (req, head_len, len) = parse_head(raw).unwrap().unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/api/w");
        assert_eq!(req.param("a"), Some("abc"));
        assert_eq!(req.param("x"), Some(""));
        assert_eq!(len, 5);
        assert_eq!(&raw[head_len..], b"hello");
    }

    #[test]
    fn partial_head_needs_more() {
        assert!(parse_head(b"GET /api/status HTTP/1.1\r\nHo").unwrap().is_none());
    }
}
