//! Pending-message summary
//!
//! One bit per table slot, set while that connection has messages
//! queued. Schedulers and pollers read the mask without taking any
//! connection lock, so a set bit is a hint to go look, not a promise;
//! the slot lock is the truth.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

const BITS: usize = u32::BITS as usize;

pub struct PendingSet {
    capacity: usize,
    words: Box<[AtomicU32]>,
    /// One past the highest slot index ever allocated. Name and summary
    /// scans stop here instead of walking the whole table.
    limit: AtomicUsize,
}

impl PendingSet {
    pub fn new(capacity: usize) -> Self {
        let n_words = capacity.div_ceil(BITS);
        let words = (0..n_words)
            .map(|_| AtomicU32::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            capacity,
            words,
            limit: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, idx: usize) {
        debug_assert!(idx < self.capacity);
        self.words[idx / BITS].fetch_or(1 << (idx % BITS), Ordering::SeqCst);
    }

    pub fn clear(&self, idx: usize) {
        debug_assert!(idx < self.capacity);
        self.words[idx / BITS].fetch_and(!(1 << (idx % BITS)), Ordering::SeqCst);
    }

    pub fn is_set(&self, idx: usize) -> bool {
        debug_assert!(idx < self.capacity);
        self.words[idx / BITS].load(Ordering::SeqCst) & (1 << (idx % BITS)) != 0
    }

    /// Record that slot `idx` has been handed out at least once.
    pub fn note_index(&self, idx: usize) {
        self.limit.fetch_max(idx + 1, Ordering::SeqCst);
    }

    /// Upper bound for table scans.
    pub fn scan_limit(&self) -> usize {
        self.limit.load(Ordering::SeqCst).min(self.capacity)
    }

    /// Point-in-time copy of the mask for lock-free consumers.
    pub fn snapshot(&self) -> PendingSnapshot {
        let limit = self.scan_limit();
        let words = self.words[..limit.div_ceil(BITS)]
            .iter()
            .map(|w| w.load(Ordering::SeqCst))
            .collect();
        PendingSnapshot { words, limit }
    }
}

/// Frozen copy of the summary mask.
pub struct PendingSnapshot {
    words: Vec<u32>,
    limit: usize,
}

impl PendingSnapshot {
    pub fn is_set(&self, idx: usize) -> bool {
        idx < self.limit && self.words[idx / BITS] & (1 << (idx % BITS)) != 0
    }

    pub fn any(&self) -> bool {
        self.words.iter().any(|w| *w != 0)
    }

    pub fn scan_limit(&self) -> usize {
        self.limit
    }

    /// Raw words, lowest slot in bit 0 of word 0.
    pub fn as_words(&self) -> &[u32] {
        &self.words
    }
}
