//! One-shot wakeup timers
//!
//! Receive timeouts are built the kernel way: arm a one-shot timer whose
//! expiry wakes the connection's wait channel, block, cancel the timer on
//! the way out, and let the blocked path re-check its own deadline
//! against the clock. The queue itself is passive; the platform tick (or
//! the hosted kernel's ticker thread) drives [`TimerQueue::fire_due`].

use alloc::collections::{BTreeSet, BinaryHeap};
use alloc::vec::Vec;
use core::cmp::Ordering as CmpOrdering;

use spin::Mutex;

use super::sched::{CpuSched, WaitChannel};

/// Monotonic time source, in microseconds. Never goes backwards.
pub trait Clock: Send + Sync {
    fn now_us(&self) -> u64;
}

/// Handle for cancelling a pending one-shot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle(u64);

/// A pending wakeup: fire `wakeup(chan)` once `deadline_us` passes.
#[derive(Debug, PartialEq, Eq)]
struct OneShot {
    deadline_us: u64,
    id: u64,
    chan: WaitChannel,
}

impl PartialOrd for OneShot {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for OneShot {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse order for min-heap (earliest deadline first)
        other
            .deadline_us
            .cmp(&self.deadline_us)
            .then_with(|| other.id.cmp(&self.id))
    }
}

#[derive(Debug)]
struct TimerState {
    pending: BinaryHeap<OneShot>,
    /// Ids not yet fired or cancelled. Cancellation is lazy: the heap
    /// entry stays put and is skipped when it surfaces.
    live: BTreeSet<u64>,
    next_id: u64,
}

/// Queue of pending one-shot timers.
#[derive(Debug)]
pub struct TimerQueue {
    inner: Mutex<TimerState>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TimerState {
                pending: BinaryHeap::new(),
                live: BTreeSet::new(),
                next_id: 1,
            }),
        }
    }

    /// Arm a one-shot that wakes `chan` at `deadline_us`.
    pub fn add_oneshot(&self, deadline_us: u64, chan: WaitChannel) -> TimerHandle {
        let mut state = self.inner.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.live.insert(id);
        state.pending.push(OneShot {
            deadline_us,
            id,
            chan,
        });
        TimerHandle(id)
    }

    /// Cancel a pending one-shot. Returns false if it already fired or
    /// was already cancelled.
    pub fn remove(&self, handle: TimerHandle) -> bool {
        self.inner.lock().live.remove(&handle.0)
    }

    /// Earliest pending deadline. May report a cancelled entry that has
    /// not surfaced yet; a driver that wakes for it simply fires nothing.
    pub fn next_deadline(&self) -> Option<u64> {
        self.inner.lock().pending.peek().map(|t| t.deadline_us)
    }

    /// Fire every live timer whose deadline has passed. Wakeups run with
    /// the queue lock dropped. Returns the number fired.
    pub fn fire_due(&self, now_us: u64, sched: &dyn CpuSched) -> usize {
        let mut due: Vec<WaitChannel> = Vec::new();
        {
            let mut state = self.inner.lock();
            while let Some(t) = state.pending.peek() {
                if t.deadline_us > now_us {
                    break;
                }
                let t = match state.pending.pop() {
                    Some(t) => t,
                    None => break,
                };
                if state.live.remove(&t.id) {
                    due.push(t.chan);
                }
            }
        }
        for chan in &due {
            sched.wakeup(*chan);
        }
        due.len()
    }
}
