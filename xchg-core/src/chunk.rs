//! Chunk manager: split a logical call/response into Call Frames, reassemble on receive.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::time::{Duration, Instant};

use crate::frame::CallFrame;
use crate::protocol::{CallFrameType, CallStatus};

/// Data bytes per chunk. Header + chunk stays well below common MTU-safe datagram sizes.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Incomplete messages are discarded after this long without completion.
pub const DEFAULT_INCOMING_TIMEOUT: Duration = Duration::from_secs(10);

/// Split `data` into consecutive chunks sharing `transaction_id`. Empty data yields one empty chunk.
pub fn split_into_chunks(
    frame_type: CallFrameType,
    status: CallStatus,
    transaction_id: u64,
    session_id: u64,
    data: &[u8],
    chunk_size: usize,
) -> Vec<CallFrame> {
    let size = if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    };
    let total_size = data.len() as u32;
    let mut out = Vec::with_capacity(data.len() / size + 1);
    let mut offset = 0usize;
    loop {
        let end = (offset + size).min(data.len());
        out.push(CallFrame {
            frame_type,
            status,
            transaction_id,
            session_id,
            offset: offset as u32,
            total_size,
            payload: data[offset..end].to_vec(),
        });
        offset = end;
        if offset >= data.len() {
            break;
        }
    }
    out
}

/// Result of feeding one chunk into the reassembler.
#[derive(Debug)]
pub enum ChunkReceiveResult {
    /// Message complete; frame carries the whole payload at offset 0.
    Complete(CallFrame),
    /// Chunk stored; message not yet complete.
    InProgress,
    /// Chunk inconsistent with the message being assembled (different total size or type).
    Rejected,
}

struct Incoming {
    frame_type: CallFrameType,
    status: CallStatus,
    session_id: u64,
    total: usize,
    /// Received chunks by offset; memory follows what arrived, not the declared size.
    chunks: BTreeMap<u32, Vec<u8>>,
    received: usize,
    started: Instant,
}

/// Incomplete messages one source may have at a time.
pub const DEFAULT_MAX_PER_SOURCE: usize = 64;

/// Bytes held across every incomplete message.
pub const DEFAULT_MAX_BUFFERED: usize = 64 * 1024 * 1024;

/// Per-source reassembly of chunked messages, keyed by `(source, transaction_id)`.
pub struct Reassembler<K> {
    incoming: HashMap<(K, u64), Incoming>,
    per_source: HashMap<K, usize>,
    buffered: usize,
    timeout: Duration,
    max_per_source: usize,
    max_buffered: usize,
}

impl<K: Hash + Eq + Clone> Reassembler<K> {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_INCOMING_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_limits(timeout, DEFAULT_MAX_PER_SOURCE, DEFAULT_MAX_BUFFERED)
    }

    pub fn with_limits(timeout: Duration, max_per_source: usize, max_buffered: usize) -> Self {
        Self {
            incoming: HashMap::new(),
            per_source: HashMap::new(),
            buffered: 0,
            timeout,
            max_per_source,
            max_buffered,
        }
    }

    /// Store a chunk. Chunks may arrive in any order; a repeated offset is ignored.
    /// Chunks beyond the per-source or total limits are rejected.
    pub fn push(&mut self, source: K, chunk: CallFrame, now: Instant) -> ChunkReceiveResult {
        let total = chunk.total_size as usize;
        let key = (source, chunk.transaction_id);
        if chunk.offset == 0 && chunk.payload.len() >= total {
            if let Some(stale) = self.incoming.remove(&key) {
                self.release(&key.0, &stale);
            }
            return ChunkReceiveResult::Complete(chunk);
        }
        let len = chunk.payload.len();
        if len == 0 || chunk.offset as usize + len > total {
            return ChunkReceiveResult::Rejected;
        }
        if self.buffered + len > self.max_buffered {
            return ChunkReceiveResult::Rejected;
        }
        if !self.incoming.contains_key(&key) {
            let count = self.per_source.get(&key.0).copied().unwrap_or(0);
            if count >= self.max_per_source {
                return ChunkReceiveResult::Rejected;
            }
            self.per_source.insert(key.0.clone(), count + 1);
            self.incoming.insert(
                key.clone(),
                Incoming {
                    frame_type: chunk.frame_type,
                    status: chunk.status,
                    session_id: chunk.session_id,
                    total,
                    chunks: BTreeMap::new(),
                    received: 0,
                    started: now,
                },
            );
        }
        let Some(entry) = self.incoming.get_mut(&key) else {
            return ChunkReceiveResult::Rejected;
        };
        if entry.total != total || entry.frame_type != chunk.frame_type {
            return ChunkReceiveResult::Rejected;
        }
        if entry.chunks.contains_key(&chunk.offset) {
            return ChunkReceiveResult::InProgress;
        }
        entry.received += len;
        entry.chunks.insert(chunk.offset, chunk.payload);
        self.buffered += len;
        if entry.received < total {
            return ChunkReceiveResult::InProgress;
        }
        let Some(done) = self.incoming.remove(&key) else {
            return ChunkReceiveResult::Rejected;
        };
        self.release(&key.0, &done);
        let mut payload = vec![0u8; total];
        for (offset, data) in &done.chunks {
            let at = *offset as usize;
            payload[at..at + data.len()].copy_from_slice(data);
        }
        ChunkReceiveResult::Complete(CallFrame {
            frame_type: done.frame_type,
            status: done.status,
            transaction_id: key.1,
            session_id: done.session_id,
            offset: 0,
            total_size: total as u32,
            payload,
        })
    }

    fn release(&mut self, source: &K, done: &Incoming) {
        self.buffered = self.buffered.saturating_sub(done.received);
        if let Some(n) = self.per_source.get_mut(source) {
            *n -= 1;
            if *n == 0 {
                self.per_source.remove(source);
            }
        }
    }

    /// Drop incomplete messages older than the timeout. Returns how many were dropped.
    pub fn purge(&mut self, now: Instant) -> usize {
        let timeout = self.timeout;
        let expired: Vec<(K, u64)> = self
            .incoming
            .iter()
            .filter(|(_, inc)| now.saturating_duration_since(inc.started) >= timeout)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            if let Some(inc) = self.incoming.remove(key) {
                self.release(&key.0, &inc);
            }
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.incoming.len()
    }

    pub fn is_empty(&self) -> bool {
        self.incoming.is_empty()
    }

    /// Payload bytes held by incomplete messages.
    pub fn buffered_bytes(&self) -> usize {
        self.buffered
    }
}

impl<K: Hash + Eq + Clone> Default for Reassembler<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use rand::Rng;

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 256) as u8).collect()
    }

    fn chunks(data: &[u8], size: usize) -> Vec<CallFrame> {
        split_into_chunks(CallFrameType::Call, CallStatus::Ok, 9, 3, data, size)
    }

    #[test]
    fn split_chunks() {
        let c = chunks(&data(100), 30);
        assert_eq!(c.len(), 4);
        assert_eq!(c[0].offset, 0);
        assert_eq!(c[3].offset, 90);
        assert_eq!(c[3].payload.len(), 10);
        assert!(c.iter().all(|f| f.total_size == 100 && f.transaction_id == 9));
        assert!(c[3].is_last_chunk());
        assert!(!c[2].is_last_chunk());
    }

    #[test]
    fn split_empty_yields_one_frame() {
        let c = chunks(&[], 30);
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].total_size, 0);
        let mut r: Reassembler<u8> = Reassembler::new();
        assert!(matches!(
            r.push(1, c[0].clone(), Instant::now()),
            ChunkReceiveResult::Complete(f) if f.payload.is_empty()
        ));
    }

    #[test]
    fn split_zero_chunk_size_uses_default() {
        let c = chunks(&data(DEFAULT_CHUNK_SIZE * 2), 0);
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn reassemble_shuffled_varying_sizes() {
        let original = data(70_000);
        let mut rng = rand::thread_rng();
        let mut frames = Vec::new();
        let mut offset = 0;
        while offset < original.len() {
            let size = rng.gen_range(1..3000).min(original.len() - offset);
            frames.push(CallFrame {
                frame_type: CallFrameType::Response,
                status: CallStatus::Ok,
                transaction_id: 5,
                session_id: 8,
                offset: offset as u32,
                total_size: original.len() as u32,
                payload: original[offset..offset + size].to_vec(),
            });
            offset += size;
        }
        frames.shuffle(&mut rng);
        let last = frames.len() - 1;
        let mut r = Reassembler::new();
        let now = Instant::now();
        for (i, f) in frames.into_iter().enumerate() {
            match r.push("udp:1", f, now) {
                ChunkReceiveResult::Complete(done) => {
                    assert_eq!(i, last);
                    assert_eq!(done.payload, original);
                    assert_eq!(done.session_id, 8);
                    assert_eq!(done.frame_type, CallFrameType::Response);
                }
                ChunkReceiveResult::InProgress => assert!(i < last),
                ChunkReceiveResult::Rejected => panic!("rejected"),
            }
        }
        assert!(r.is_empty());
    }

    #[test]
    fn duplicate_chunk_does_not_complete_early() {
        let original = data(100);
        let c = chunks(&original, 50);
        let mut r = Reassembler::new();
        let now = Instant::now();
        assert!(matches!(r.push(1u8, c[0].clone(), now), ChunkReceiveResult::InProgress));
        assert!(matches!(r.push(1u8, c[0].clone(), now), ChunkReceiveResult::InProgress));
        match r.push(1u8, c[1].clone(), now) {
            ChunkReceiveResult::Complete(done) => assert_eq!(done.payload, original),
            other => panic!("expected complete, got {:?}", other),
        }
    }

    #[test]
    fn sources_are_independent() {
        let c = chunks(&data(100), 50);
        let mut r = Reassembler::new();
        let now = Instant::now();
        assert!(matches!(r.push(1u8, c[0].clone(), now), ChunkReceiveResult::InProgress));
        assert!(matches!(r.push(2u8, c[1].clone(), now), ChunkReceiveResult::InProgress));
        assert_eq!(r.len(), 2);
    }

    #[test]
    fn inconsistent_total_rejected() {
        let c = chunks(&data(100), 50);
        let mut r = Reassembler::new();
        let now = Instant::now();
        r.push(1u8, c[0].clone(), now);
        let mut odd = c[1].clone();
        odd.total_size = 120;
        assert!(matches!(r.push(1u8, odd, now), ChunkReceiveResult::Rejected));
    }

    fn sliver(transaction_id: u64) -> CallFrame {
        CallFrame {
            frame_type: CallFrameType::Call,
            status: CallStatus::Ok,
            transaction_id,
            session_id: 0,
            offset: 1,
            total_size: 16 * 1024 * 1024,
            payload: vec![0],
        }
    }

    #[test]
    fn declared_size_does_not_allocate() {
        let mut r = Reassembler::new();
        let now = Instant::now();
        for id in 0..10 {
            assert!(matches!(r.push(1u8, sliver(id), now), ChunkReceiveResult::InProgress));
        }
        assert_eq!(r.buffered_bytes(), 10);
    }

    #[test]
    fn in_flight_messages_capped_per_source() {
        let mut r = Reassembler::with_limits(Duration::from_secs(10), 4, DEFAULT_MAX_BUFFERED);
        let now = Instant::now();
        for id in 0..4 {
            assert!(matches!(r.push(1u8, sliver(id), now), ChunkReceiveResult::InProgress));
        }
        assert!(matches!(r.push(1u8, sliver(9), now), ChunkReceiveResult::Rejected));
        // More chunks of a message already in flight are still taken.
        let mut next = sliver(0);
        next.offset = 2;
        assert!(matches!(r.push(1u8, next, now), ChunkReceiveResult::InProgress));
        assert!(matches!(r.push(2u8, sliver(9), now), ChunkReceiveResult::InProgress));
        assert_eq!(r.purge(now + Duration::from_secs(11)), 5);
        assert_eq!(r.buffered_bytes(), 0);
        assert!(matches!(r.push(1u8, sliver(9), now), ChunkReceiveResult::InProgress));
    }

    #[test]
    fn buffered_bytes_capped() {
        let mut r = Reassembler::with_limits(Duration::from_secs(10), 64, 120);
        let now = Instant::now();
        let c = chunks(&data(200), 100);
        assert!(matches!(r.push(1u8, c[0].clone(), now), ChunkReceiveResult::InProgress));
        let other = split_into_chunks(CallFrameType::Call, CallStatus::Ok, 10, 0, &data(200), 100);
        assert!(matches!(r.push(2u8, other[0].clone(), now), ChunkReceiveResult::Rejected));
        // Completing a message frees its bytes.
        assert!(matches!(r.push(1u8, c[1].clone(), now), ChunkReceiveResult::Complete(_)));
        assert_eq!(r.buffered_bytes(), 0);
        assert!(matches!(r.push(2u8, other[0].clone(), now), ChunkReceiveResult::InProgress));
    }

    #[test]
    fn stale_messages_purged() {
        let c = chunks(&data(100), 50);
        let mut r = Reassembler::with_timeout(Duration::from_secs(10));
        let start = Instant::now();
        r.push(1u8, c[0].clone(), start);
        assert_eq!(r.purge(start + Duration::from_secs(5)), 0);
        assert_eq!(r.purge(start + Duration::from_secs(11)), 1);
        assert!(r.is_empty());
    }
}
