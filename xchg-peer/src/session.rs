//! Server-side sessions created by a successful `/xchg-auth`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use xchg_core::nonce::DEFAULT_SNAKE_WINDOW;
use xchg_core::{Address, NonceError, SessionKey, SnakeCounter};

pub struct ServerSession {
    pub key: SessionKey,
    pub caller: Address,
    pub last_access: Instant,
    counter: SnakeCounter,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("unknown session")]
    Unknown,
    #[error(transparent)]
    Replay(#[from] NonceError),
}

#[derive(Default)]
pub struct Sessions {
    map: HashMap<u64, ServerSession>,
}

impl Sessions {
    /// Register a session under a fresh random non-zero id.
    pub fn insert(&mut self, key: SessionKey, caller: Address, now: Instant) -> u64 {
        let id = loop {
            let id: u64 = rand::random();
            if id != 0 && !self.map.contains_key(&id) {
                break id;
            }
        };
        self.map.insert(
            id,
            ServerSession {
                key,
                caller,
                last_access: now,
                counter: SnakeCounter::new(DEFAULT_SNAKE_WINDOW, -1),
            },
        );
        id
    }

    /// Key of a live session; refreshes its idle timer.
    pub fn touch(&mut self, id: u64, now: Instant) -> Option<SessionKey> {
        let s = self.map.get_mut(&id)?;
        s.last_access = now;
        Some(s.key)
    }

    /// Accept `counter` once for session `id`.
    pub fn declare(&mut self, id: u64, counter: u64) -> Result<(), SessionError> {
        let s = self.map.get_mut(&id).ok_or(SessionError::Unknown)?;
        s.counter.test_and_declare(counter)?;
        Ok(())
    }

    pub fn remove(&mut self, id: u64) -> Option<ServerSession> {
        self.map.remove(&id)
    }

    pub fn get(&self, id: u64) -> Option<&ServerSession> {
        self.map.get(&id)
    }

    /// Drop sessions idle for `idle` or longer. Returns how many were dropped.
    pub fn purge(&mut self, now: Instant, idle: Duration) -> usize {
        let before = self.map.len();
        self.map
            .retain(|_, s| now.saturating_duration_since(s.last_access) < idle);
        before - self.map.len()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caller() -> Address {
        Address::from_bytes([5; xchg_core::ADDRESS_LEN])
    }

    #[test]
    fn counters_are_per_session() {
        let mut s = Sessions::default();
        let now = Instant::now();
        let a = s.insert([1; 32], caller(), now);
        let b = s.insert([2; 32], caller(), now);
        assert_ne!(a, 0);
        assert_ne!(a, b);
        s.declare(a, 0).unwrap();
        s.declare(b, 0).unwrap();
        assert!(matches!(s.declare(a, 0), Err(SessionError::Replay(_))));
        assert!(matches!(s.declare(7, 0), Err(SessionError::Unknown)));
        assert_eq!(s.touch(b, now), Some([2; 32]));
    }

    #[test]
    fn idle_sessions_are_purged() {
        let mut s = Sessions::default();
        let start = Instant::now();
        let old = s.insert([1; 32], caller(), start);
        let fresh = s.insert([2; 32], caller(), start);
        s.touch(fresh, start + Duration::from_secs(50));
        assert_eq!(s.purge(start + Duration::from_secs(61), Duration::from_secs(60)), 1);
        assert!(s.get(old).is_none());
        assert!(s.get(fresh).is_some());
    }
}
