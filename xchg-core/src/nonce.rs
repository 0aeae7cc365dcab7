//! Anti-replay primitives.
//!
//! * [`Nonces`]: pool of single-use random challenges for `/xchg-auth`.
//! * [`SnakeCounter`]: sliding window over a monotonically issued call counter.

use rand::rngs::OsRng;
use rand::RngCore;

/// Length of an issued nonce: `[index:4 LE][random:12]`.
pub const NONCE_LEN: usize = 16;

/// Default number of outstanding nonces.
pub const DEFAULT_NONCE_POOL_SIZE: usize = 1024;

/// Default reordering window of a session's call counter.
pub const DEFAULT_SNAKE_WINDOW: usize = 1000;

/// Pool of single-use challenges. Issuing rotates over the slots; a slot's value is replaced
/// as soon as it is checked successfully, so each nonce passes [`Nonces::check`] at most once.
pub struct Nonces {
    slots: Vec<[u8; NONCE_LEN]>,
    consumed: Vec<bool>,
    cursor: usize,
}

impl Nonces {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            slots: vec![[0u8; NONCE_LEN]; size],
            consumed: vec![true; size],
            cursor: 0,
        }
    }

    /// Issue the next nonce, overwriting the oldest slot.
    pub fn next(&mut self) -> [u8; NONCE_LEN] {
        let index = self.cursor;
        self.cursor = (self.cursor + 1) % self.slots.len();
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..4].copy_from_slice(&(index as u32).to_le_bytes());
        OsRng.fill_bytes(&mut nonce[4..]);
        self.slots[index] = nonce;
        self.consumed[index] = false;
        nonce
    }

    /// True if `nonce` is exactly the outstanding value of its slot. Consumes the slot on success.
    pub fn check(&mut self, nonce: &[u8]) -> bool {
        if nonce.len() != NONCE_LEN {
            return false;
        }
        let mut idx = [0u8; 4];
        idx.copy_from_slice(&nonce[..4]);
        let index = u32::from_le_bytes(idx) as usize;
        if index >= self.slots.len() || self.consumed[index] {
            return false;
        }
        if self.slots[index][..] != nonce[..] {
            return false;
        }
        self.consumed[index] = true;
        OsRng.fill_bytes(&mut self.slots[index][4..]);
        true
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }
}

impl Default for Nonces {
    fn default() -> Self {
        Self::new(DEFAULT_NONCE_POOL_SIZE)
    }
}

/// Rejection reasons of [`SnakeCounter::test_and_declare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum NonceError {
    #[error("counter {0} is too old")]
    TooOld(u64),
    #[error("counter {0} already used")]
    AlreadyUsed(u64),
}

/// Sliding-window replay filter. Slot `i` of the window records whether
/// `last_processed - i` has been seen.
pub struct SnakeCounter {
    last_processed: i64,
    window: Vec<u8>,
}

impl SnakeCounter {
    /// Fresh counter with `last_processed = initial` (sessions start at -1, so 0 is the first valid counter).
    pub fn new(window_size: usize, initial: i64) -> Self {
        let mut window = vec![0u8; window_size.max(1)];
        window[0] = 1;
        Self {
            last_processed: initial,
            window,
        }
    }

    pub fn last_processed(&self) -> i64 {
        self.last_processed
    }

    /// Accept `counter` if it is fresh; mark it used.
    pub fn test_and_declare(&mut self, counter: u64) -> Result<(), NonceError> {
        let value = i64::try_from(counter).map_err(|_| NonceError::TooOld(counter))?;
        let n = self.window.len();
        if value > self.last_processed {
            let shift = (value - self.last_processed) as u128;
            if shift >= n as u128 {
                self.window.iter_mut().for_each(|slot| *slot = 0);
            } else {
                let shift = shift as usize;
                self.window.copy_within(0..n - shift, shift);
                self.window[..shift].iter_mut().for_each(|slot| *slot = 0);
            }
            self.window[0] = 1;
            self.last_processed = value;
            return Ok(());
        }
        let idx = (self.last_processed - value) as u64;
        if idx >= n as u64 {
            return Err(NonceError::TooOld(counter));
        }
        let slot = &mut self.window[idx as usize];
        if *slot != 0 {
            return Err(NonceError::AlreadyUsed(counter));
        }
        *slot = 1;
        Ok(())
    }
}
