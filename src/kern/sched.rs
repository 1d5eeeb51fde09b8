//! Scheduler wait/wakeup seam
//!
//! Blocking follows the two-phase discipline: a waiter announces itself
//! with `assert_wait` while still holding the lock that guards the
//! condition it is waiting for, drops the lock, then calls `block`. A
//! `wakeup` issued between the two phases is not lost. Wait channels are
//! keyed by the address of the object being waited on.

use crate::types::WorldId;

/// Key identifying a wait channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WaitChannel(usize);

impl WaitChannel {
    /// Channel keyed by an object's address. The object must stay put for
    /// as long as anyone may wait on it (connection slots do).
    #[inline]
    pub fn from_addr<T>(obj: &T) -> Self {
        WaitChannel(obj as *const T as usize)
    }

    /// Poll-notification channel for a world. Object addresses are
    /// word-aligned, so bit 0 keeps the two namespaces disjoint.
    #[inline]
    pub fn world_poll(world: WorldId) -> Self {
        WaitChannel(((world.0 as usize) << 1) | 1)
    }

    #[inline]
    pub fn raw(self) -> usize {
        self.0
    }
}

/// What a blocked world is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitClass {
    /// Plain RPC receive.
    Rpc,
    /// Semaphore-style connection; wakeups may also come from the
    /// world's action mask.
    Semaphore,
}

/// Outcome of [`CpuSched::block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum WaitStatus {
    /// Normal wakeup, from the channel or a matching action.
    Woken,
    /// The wait was torn up by the scheduler (world dying or signalled).
    Interrupted,
}

/// Per-world action/interrupt bits that can cut a semaphore wait short.
/// Opaque here; the scheduler supplies the mask and matches posted
/// actions against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct ActionMask(pub u32);

impl ActionMask {
    pub const NONE: ActionMask = ActionMask(0);

    #[inline]
    pub fn intersects(self, other: ActionMask) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// The CPU scheduler as seen from the RPC module.
pub trait CpuSched: Send + Sync {
    /// Register the current world as a waiter on `chan`. Called with the
    /// lock guarding the waited-on condition held; the caller drops that
    /// lock before calling [`CpuSched::block`].
    fn assert_wait(&self, chan: WaitChannel, class: WaitClass, actions: ActionMask);

    /// Block until woken. `switch_hint` names a world the scheduler
    /// should prefer to run while this one sleeps (directed yield).
    fn block(&self, switch_hint: Option<WorldId>) -> WaitStatus;

    /// Wake every waiter on `chan`. May be called with spinlocks held.
    fn wakeup(&self, chan: WaitChannel);

    /// Identity of the running world.
    fn current_world(&self) -> WorldId;

    /// Whether the running context may block at all.
    fn is_safe_to_block(&self) -> bool;

    /// The action bits that wake the current world's semaphore waits.
    fn action_wake_mask(&self) -> ActionMask;

    /// Untimed voluntary sleep, used by teardown drain loops.
    fn sleep_ms(&self, ms: u32);
}
