//! Hosted kernel - std-backed seams for tests and tooling
//!
//! Implements every `kern` seam on top of an ordinary OS process: worlds
//! are threads announced with [`HostedKernel::run_as_world`], blocking
//! parks the thread on a condvar, all three buffer kinds are live
//! addresses in this process, and a ticker thread drives the timer
//! queue. Copy faults can be injected to exercise the re-validation
//! paths that real faults would take.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::Cell;
use core::ptr;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use alloc::collections::BTreeMap;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use super::copyio::{BufferKind, CopyFault, CopyIo, CopyResult, VmAddr};
use super::host::HostBridge;
use super::sched::{ActionMask, CpuSched, WaitChannel, WaitClass, WaitStatus};
use super::timer::{Clock, TimerQueue};
use super::KernelHooks;
use crate::types::WorldId;

std::thread_local! {
    static CURRENT_WORLD: Cell<WorldId> = Cell::new(WorldId::INVALID);
    static PARK: Arc<ParkSlot> = Arc::new(ParkSlot::new());
}

/// Std mutexes poison on panic; a poisoned seam should not cascade.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Per-thread parking spot. `armed`/`woken` carry a wakeup across the
/// window between `assert_wait` and `block`.
struct ParkSlot {
    state: Mutex<ParkState>,
    cv: Condvar,
}

struct ParkState {
    armed: bool,
    woken: bool,
    interrupted: bool,
}

impl ParkSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(ParkState {
                armed: false,
                woken: false,
                interrupted: false,
            }),
            cv: Condvar::new(),
        }
    }

    fn fire(&self, interrupted: bool) {
        let mut st = lock(&self.state);
        if interrupted {
            st.interrupted = true;
        } else {
            st.woken = true;
        }
        self.cv.notify_all();
    }
}

struct Waiter {
    chan: WaitChannel,
    world: WorldId,
    class: WaitClass,
    actions: ActionMask,
    slot: Arc<ParkSlot>,
}

/// All four kernel seams over `std`, plus the timer driver.
pub struct HostedKernel {
    waiters: Mutex<Vec<Waiter>>,
    world_actions: Mutex<BTreeMap<WorldId, ActionMask>>,
    epoch: Instant,
    doorbells: AtomicU64,
    fault_arm: AtomicU32,
    timers: Arc<TimerQueue>,
}

impl HostedKernel {
    /// Build the kernel and start its ticker thread. The ticker holds a
    /// weak reference and exits once the last owner drops.
    pub fn new() -> Arc<Self> {
        let kernel = Arc::new(Self {
            waiters: Mutex::new(Vec::new()),
            world_actions: Mutex::new(BTreeMap::new()),
            epoch: Instant::now(),
            doorbells: AtomicU64::new(0),
            fault_arm: AtomicU32::new(0),
            timers: Arc::new(TimerQueue::new()),
        });
        let weak = Arc::downgrade(&kernel);
        thread::Builder::new()
            .name("hosted-tick".into())
            .spawn(move || loop {
                let k = match weak.upgrade() {
                    Some(k) => k,
                    None => break,
                };
                let now = k.now_us();
                k.timers.fire_due(now, &*k);
                drop(k);
                thread::sleep(Duration::from_millis(1));
            })
            .expect("spawn hosted ticker");
        kernel
    }

    /// The seam bundle an `RpcRegistry` is constructed with.
    pub fn hooks(self: &Arc<Self>) -> KernelHooks {
        KernelHooks {
            sched: self.clone(),
            copy: self.clone(),
            clock: self.clone(),
            host: self.clone(),
            timers: self.timers.clone(),
        }
    }

    /// Run `f` with the calling thread identified as `world`.
    pub fn run_as_world<R>(&self, world: WorldId, f: impl FnOnce() -> R) -> R {
        CURRENT_WORLD.with(|c| {
            let prev = c.get();
            c.set(world);
            let r = f();
            c.set(prev);
            r
        })
    }

    /// Configure the action bits that wake `world`'s semaphore waits.
    pub fn set_world_actions(&self, world: WorldId, actions: ActionMask) {
        lock(&self.world_actions).insert(world, actions);
    }

    /// Post action bits to a world. Waits whose mask matches are broken
    /// with an interrupted status, the way action delivery preempts a
    /// semaphore wait.
    pub fn post_action(&self, world: WorldId, actions: ActionMask) {
        let mut fired = Vec::new();
        {
            let mut waiters = lock(&self.waiters);
            waiters.retain(|w| {
                if w.world == world && w.actions.intersects(actions) {
                    fired.push(w.slot.clone());
                    false
                } else {
                    true
                }
            });
        }
        for slot in fired {
            slot.fire(true);
        }
    }

    /// Tear up every wait the world is blocked in.
    pub fn interrupt_world(&self, world: WorldId) {
        let mut fired = Vec::new();
        {
            let mut waiters = lock(&self.waiters);
            waiters.retain(|w| {
                if w.world == world {
                    fired.push(w.slot.clone());
                    false
                } else {
                    true
                }
            });
        }
        for slot in fired {
            slot.fire(true);
        }
    }

    /// Make the next `n` copies fail with a page fault.
    pub fn fail_next_copies(&self, n: u32) {
        self.fault_arm.store(n, Ordering::SeqCst);
    }

    /// Number of host doorbell rings so far.
    pub fn doorbell_count(&self) -> u64 {
        self.doorbells.load(Ordering::SeqCst)
    }

    /// Wait class of `world`'s registered wait, if it is blocked.
    pub fn waiter_class(&self, world: WorldId) -> Option<WaitClass> {
        lock(&self.waiters)
            .iter()
            .find(|w| w.world == world)
            .map(|w| w.class)
    }

    fn take_fault(&self) -> bool {
        let mut cur = self.fault_arm.load(Ordering::SeqCst);
        while cur > 0 {
            match self.fault_arm.compare_exchange(
                cur,
                cur - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(seen) => cur = seen,
            }
        }
        false
    }
}

impl CpuSched for HostedKernel {
    fn assert_wait(&self, chan: WaitChannel, class: WaitClass, actions: ActionMask) {
        let slot = PARK.with(|s| s.clone());
        let world = self.current_world();
        {
            let mut st = lock(&slot.state);
            st.armed = true;
            st.woken = false;
            st.interrupted = false;
        }
        lock(&self.waiters).push(Waiter {
            chan,
            world,
            class,
            actions,
            slot,
        });
    }

    fn block(&self, switch_hint: Option<WorldId>) -> WaitStatus {
        // A hosted process has no run queue to bias.
        let _ = switch_hint;
        let slot = PARK.with(|s| s.clone());
        let mut st = lock(&slot.state);
        debug_assert!(st.armed, "block without assert_wait");
        while !st.woken && !st.interrupted {
            st = slot.cv.wait(st).unwrap_or_else(|e| e.into_inner());
        }
        st.armed = false;
        if st.interrupted {
            st.interrupted = false;
            WaitStatus::Interrupted
        } else {
            st.woken = false;
            WaitStatus::Woken
        }
    }

    fn wakeup(&self, chan: WaitChannel) {
        let mut fired = Vec::new();
        {
            let mut waiters = lock(&self.waiters);
            waiters.retain(|w| {
                if w.chan == chan {
                    fired.push(w.slot.clone());
                    false
                } else {
                    true
                }
            });
        }
        for slot in fired {
            slot.fire(false);
        }
    }

    fn current_world(&self) -> WorldId {
        CURRENT_WORLD.with(|c| c.get())
    }

    fn is_safe_to_block(&self) -> bool {
        true
    }

    fn action_wake_mask(&self) -> ActionMask {
        let world = self.current_world();
        lock(&self.world_actions)
            .get(&world)
            .copied()
            .unwrap_or(ActionMask::NONE)
    }

    fn sleep_ms(&self, ms: u32) {
        thread::sleep(Duration::from_millis(ms as u64));
    }
}

impl CopyIo for HostedKernel {
    fn copy_in(&self, dst: &mut [u8], src: VmAddr, _kind: BufferKind) -> CopyResult {
        if src.is_null() {
            return Err(CopyFault::BadAddress);
        }
        if self.take_fault() {
            return Err(CopyFault::PageFault);
        }
        unsafe {
            ptr::copy_nonoverlapping(src.0 as *const u8, dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    fn copy_out(&self, dst: VmAddr, src: &[u8], _kind: BufferKind) -> CopyResult {
        if dst.is_null() {
            return Err(CopyFault::BadAddress);
        }
        if self.take_fault() {
            return Err(CopyFault::PageFault);
        }
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), dst.0 as *mut u8, src.len());
        }
        Ok(())
    }
}

impl Clock for HostedKernel {
    fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }
}

impl HostBridge for HostedKernel {
    fn interrupt_host(&self) {
        self.doorbells.fetch_add(1, Ordering::SeqCst);
    }
}
