//! Per-address store-and-forward queues behind the HTTP relay endpoints.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};
use xchg_core::Address;

/// Envelopes kept per address; the oldest is dropped past this.
pub const MAX_QUEUED: usize = 1024;

#[derive(Default)]
struct Queue {
    items: VecDeque<(Instant, Vec<u8>)>,
    notify: Arc<Notify>,
}

pub struct Mailbox {
    queues: Mutex<HashMap<Address, Queue>>,
    ttl: Duration,
}

impl Mailbox {
    pub fn new(ttl: Duration) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Queue one envelope for `to` and wake a waiting reader.
    pub async fn push(&self, to: Address, envelope: Vec<u8>) {
        let mut queues = self.queues.lock().await;
        let q = queues.entry(to).or_default();
        if q.items.len() >= MAX_QUEUED {
            q.items.pop_front();
        }
        q.items.push_back((Instant::now(), envelope));
        q.notify.notify_one();
    }

    /// Take everything queued for `to`, waiting up to `wait` for the first envelope.
    pub async fn pull(&self, to: Address, wait: Duration) -> Vec<Vec<u8>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notify = {
                let mut queues = self.queues.lock().await;
                let q = queues.entry(to).or_default();
                if !q.items.is_empty() {
                    return q.items.drain(..).map(|(_, e)| e).collect();
                }
                q.notify.clone()
            };
            if tokio::time::timeout_at(deadline, notify.notified())
                .await
                .is_err()
            {
                return Vec::new();
            }
        }
    }

    /// Drop expired envelopes and empty queues. Returns envelopes dropped.
    pub async fn purge(&self, now: Instant) -> usize {
        let mut queues = self.queues.lock().await;
        let mut dropped = 0;
        for q in queues.values_mut() {
            let before = q.items.len();
            q.items
                .retain(|(at, _)| now.saturating_duration_since(*at) < self.ttl);
            dropped += before - q.items.len();
        }
        // A queue whose notify is shared is being waited on.
        queues.retain(|_, q| !q.items.is_empty() || Arc::strong_count(&q.notify) > 1);
        dropped
    }

    /// Addresses with a live queue.
    pub async fn len(&self) -> usize {
        self.queues.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(b: u8) -> Address {
        Address::from_bytes([b; xchg_core::ADDRESS_LEN])
    }

    #[tokio::test]
    async fn pull_returns_queued_in_order() {
        let m = Mailbox::new(Duration::from_secs(30));
        m.push(addr(1), b"a".to_vec()).await;
        m.push(addr(1), b"b".to_vec()).await;
        m.push(addr(2), b"c".to_vec()).await;
        let got = m.pull(addr(1), Duration::from_millis(10)).await;
        assert_eq!(got, vec![b"a".to_vec(), b"b".to_vec()]);
        assert!(m.pull(addr(1), Duration::from_millis(10)).await.is_empty());
    }

    #[tokio::test]
    async fn long_poll_wakes_on_push() {
        let m = Arc::new(Mailbox::new(Duration::from_secs(30)));
        let reader = {
            let m = m.clone();
            tokio::spawn(async move { m.pull(addr(3), Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        m.push(addr(3), b"x".to_vec()).await;
        let got = reader.await.unwrap();
        assert_eq!(got, vec![b"x".to_vec()]);
    }

    #[tokio::test]
    async fn purge_drops_expired() {
        let m = Mailbox::new(Duration::from_millis(100));
        m.push(addr(4), b"old".to_vec()).await;
        assert_eq!(m.purge(Instant::now()).await, 0);
        let later = Instant::now() + Duration::from_millis(200);
        assert_eq!(m.purge(later).await, 1);
        assert_eq!(m.len().await, 0);
    }
}
