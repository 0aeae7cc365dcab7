//! HTTP relay: post envelopes into a router mailbox, long-poll our own mailbox.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, trace};
use xchg_core::envelope::{decode_envelope, decode_envelope_stream, encode_envelope};
use xchg_core::{Address, CallFrame};

use super::{Inbound, ReplyPath};
use crate::error::{PeerError, Result};
use crate::network::NetworkProvider;

/// How long one mailbox read may wait on the relay.
pub const POLL_WAIT: Duration = Duration::from_secs(10);

const RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct HttpRelay {
    client: reqwest::Client,
    network: Arc<dyn NetworkProvider>,
    own: Address,
}

impl HttpRelay {
    pub fn new(network: Arc<dyn NetworkProvider>, own: Address) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(POLL_WAIT + Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            network,
            own,
        })
    }

    pub fn hosts(&self, address: &Address) -> Vec<String> {
        self.network.nodes_for_address(address)
    }

    /// Post every chunk to the first relay that accepts all of them.
    pub async fn post(&self, to: &Address, frames: &[CallFrame]) -> Result<()> {
        let mut last = None;
        'hosts: for host in self.hosts(to) {
            let url = format!("http://{}/api/w?a={}", host, to);
            for f in frames {
                let sent = self
                    .client
                    .post(&url)
                    .body(encode_envelope(&self.own, f))
                    .send()
                    .await
                    .and_then(|r| r.error_for_status());
                if let Err(e) = sent {
                    debug!(%host, error = %e, "http relay rejected envelope");
                    last = Some(e);
                    continue 'hosts;
                }
            }
            return Ok(());
        }
        Err(match last {
            Some(e) => e.into(),
            None => PeerError::NoTransport("no http relay".into()),
        })
    }

    /// Read our mailbox on every relay until the inbound channel closes.
    pub async fn run(self: Arc<Self>, inbound: mpsc::UnboundedSender<Inbound>) {
        // Dropping the set (when this task is aborted) stops every poller.
        let mut pollers = JoinSet::new();
        for host in self.hosts(&self.own) {
            pollers.spawn(self.clone().pull_loop(host, inbound.clone()));
        }
        while pollers.join_next().await.is_some() {}
    }

    async fn pull_loop(self: Arc<Self>, host: String, inbound: mpsc::UnboundedSender<Inbound>) {
        loop {
            match self.pull(&host).await {
                Ok(envelopes) => {
                    for e in envelopes {
                        let (from, frame) = match decode_envelope(&e) {
                            Ok(x) => x,
                            Err(err) => {
                                debug!(%host, error = %err, "malformed envelope");
                                continue;
                            }
                        };
                        let reply = ReplyPath::Http {
                            relay: self.clone(),
                            from,
                        };
                        if inbound.send(Inbound { frame, reply }).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    trace!(%host, error = %e, "mailbox read failed");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
            if inbound.is_closed() {
                return;
            }
        }
    }

    async fn pull(&self, host: &str) -> Result<Vec<Vec<u8>>> {
        let url = format!(
            "http://{}/api/r?a={}&t={}",
            host,
            self.own,
            POLL_WAIT.as_millis()
        );
        let body = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        Ok(decode_envelope_stream(&body))
    }
}

/// Mailbox delivery to one remote.
pub struct HttpTransport {
    relay: Arc<HttpRelay>,
    target: Address,
}

impl HttpTransport {
    pub fn new(relay: Arc<HttpRelay>, target: Address) -> Self {
        Self { relay, target }
    }

    pub(crate) fn check(&self) -> bool {
        !self.relay.hosts(&self.target).is_empty()
    }

    pub(crate) async fn send(&self, frames: &[CallFrame]) -> Result<()> {
        self.relay.post(&self.target, frames).await
    }
}
