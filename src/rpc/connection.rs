//! Per-connection state
//!
//! Each table slot is a [`CnxSlot`]: a spin lock around either a free
//! marker (carrying the generation the slot will use next) or the live
//! [`CnxState`]. The lock tickets [`CnxRef`] and [`LockedCnx`] make the
//! unlock-around-copy discipline explicit in the types: only a
//! [`LockedCnx`] can touch state, and giving it up hands back a ticket
//! that must be re-locked (and the state re-validated) before use.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use spin::{Mutex, MutexGuard};

use super::message::RpcMessage;
use super::{RpcCnxId, RpcError, RpcResult, RpcToken, RPC_CNX_NAME_LENGTH, RPC_TOKEN_MIN_RESERVED};
use crate::kern::WaitChannel;
use crate::types::WorldId;

bitflags! {
    /// Properties fixed at registration time.
    pub struct CnxOptions: u32 {
        /// Waits on this connection behave like semaphore downs: they
        /// are interruptible by the world's action bits.
        const SEMAPHORE = 0x01;
        /// Ring the host doorbell whenever a message is queued.
        const NOTIFY_HOST = 0x02;
    }
}

/// What occupies a table slot.
pub enum SlotState {
    /// Unused; `generation` seeds the next id minted here.
    Free { generation: u32 },
    Active(CnxState),
}

/// A live connection. Only reachable through a [`LockedCnx`].
pub struct CnxState {
    pub id: RpcCnxId,
    /// Generation the slot reverts to on teardown.
    pub generation: u32,
    /// Set once teardown begins; every new reference is refused and
    /// blocked waiters give up with `Disconnected`.
    pub pending_destroy: bool,
    /// Outstanding references, the registration's own included.
    pub use_count: u32,
    pub name: heapless::String<RPC_CNX_NAME_LENGTH>,
    /// World that registered the connection.
    pub world: WorldId,
    pub options: CnxOptions,
    /// Capacity of every buffer in the pool.
    pub buf_size: u32,
    free_list: VecDeque<Box<RpcMessage>>,
    pub messages: VecDeque<Box<RpcMessage>>,
    pub replies: VecDeque<Box<RpcMessage>>,
    /// Buffers sitting in `messages` plus `replies`.
    pub n_queued: u32,
    next_token: RpcToken,
    /// Worlds to wake on their poll channel when a message arrives.
    pub poll_waiters: Vec<WorldId>,
}

impl CnxState {
    pub fn new(
        id: RpcCnxId,
        generation: u32,
        name: heapless::String<RPC_CNX_NAME_LENGTH>,
        world: WorldId,
        options: CnxOptions,
        buf_size: u32,
        free_list: VecDeque<Box<RpcMessage>>,
    ) -> Self {
        Self {
            id,
            generation,
            pending_destroy: false,
            use_count: 1,
            name,
            world,
            options,
            buf_size,
            free_list,
            messages: VecDeque::new(),
            replies: VecDeque::new(),
            n_queued: 0,
            next_token: 0,
            poll_waiters: Vec::new(),
        }
    }

    /// Allocate the fixed buffer pool for a new connection.
    pub fn build_pool(num_bufs: u32, buf_size: u32) -> RpcResult<VecDeque<Box<RpcMessage>>> {
        let mut pool = VecDeque::new();
        pool.try_reserve_exact(num_bufs as usize)
            .map_err(|_| RpcError::LimitExceeded)?;
        for _ in 0..num_bufs {
            let msg =
                RpcMessage::try_with_capacity(buf_size).map_err(|_| RpcError::LimitExceeded)?;
            pool.push_back(msg);
        }
        Ok(pool)
    }

    /// Take a buffer for a payload of `len` bytes. `None` when the pool
    /// is dry or the payload cannot fit any buffer of this connection.
    pub fn alloc_message(&mut self, len: u32) -> Option<Box<RpcMessage>> {
        if len > self.buf_size {
            log::warn!(
                "rpc {}: payload of {} bytes exceeds {}-byte buffers",
                self.id,
                len,
                self.buf_size
            );
            return None;
        }
        let msg = self.free_list.pop_front();
        if msg.is_none() {
            log::trace!("rpc {}: buffer pool exhausted", self.id);
        }
        msg
    }

    /// Return a buffer to the front of the free list, so the next
    /// allocation reuses the most recently touched one.
    pub fn free_message(&mut self, msg: Box<RpcMessage>) {
        debug_assert_eq!(msg.capacity(), self.buf_size);
        self.free_list.push_front(msg);
    }

    pub fn free_count(&self) -> usize {
        self.free_list.len()
    }

    /// Mint the next request token, skipping the reserved band.
    pub fn next_token(&mut self) -> RpcToken {
        self.next_token = self.next_token.wrapping_add(1);
        if (RPC_TOKEN_MIN_RESERVED..=0).contains(&self.next_token) {
            self.next_token = 1;
        }
        self.next_token
    }

    /// Remember `world` as a poll waiter, once.
    pub fn add_poll_waiter(&mut self, world: WorldId) {
        if !self.poll_waiters.contains(&world) {
            self.poll_waiters.push(world);
        }
    }
}

/// One slot of the connection table.
pub struct CnxSlot {
    /// Advisory copy of the current id, `RpcCnxId::INVALID` when free.
    /// Lets lookups skip dead slots without locking; the locked
    /// re-check is what actually decides.
    id_hint: AtomicU32,
    state: Mutex<SlotState>,
}

impl CnxSlot {
    pub fn new() -> Self {
        Self {
            id_hint: AtomicU32::new(RpcCnxId::INVALID.0),
            state: Mutex::new(SlotState::Free { generation: 0 }),
        }
    }

    pub fn id_hint(&self) -> RpcCnxId {
        RpcCnxId(self.id_hint.load(Ordering::Relaxed))
    }

    pub fn set_id_hint(&self, id: RpcCnxId) {
        self.id_hint.store(id.0, Ordering::Relaxed);
    }

    /// Wait channel for this connection, derived from the slot address.
    /// Slots live as long as the registry, so the channel is stable
    /// across the slot's generations.
    pub fn wait_channel(&self) -> WaitChannel {
        WaitChannel::from_addr(self)
    }

    pub fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock()
    }
}

/// Unlocked ticket to a slot, held across a copy to user memory.
#[derive(Clone, Copy)]
pub struct CnxRef<'r> {
    slot: &'r CnxSlot,
    idx: usize,
}

impl<'r> CnxRef<'r> {
    pub fn new(slot: &'r CnxSlot, idx: usize) -> Self {
        Self { slot, idx }
    }

    /// Re-take the slot lock. The caller must re-validate: the
    /// connection may have entered teardown while unlocked.
    pub fn lock(self) -> LockedCnx<'r> {
        LockedCnx {
            guard: self.slot.lock(),
            r: self,
        }
    }
}

/// A locked slot holding a live connection.
pub struct LockedCnx<'r> {
    r: CnxRef<'r>,
    guard: MutexGuard<'r, SlotState>,
}

impl<'r> LockedCnx<'r> {
    pub fn idx(&self) -> usize {
        self.r.idx
    }

    pub fn slot(&self) -> &'r CnxSlot {
        self.r.slot
    }

    pub fn wait_channel(&self) -> WaitChannel {
        self.r.slot.wait_channel()
    }

    /// Drop the lock but keep the reference; pair with
    /// [`CnxRef::lock`].
    pub fn unlock(self) -> CnxRef<'r> {
        self.r
    }

    pub fn state(&self) -> &CnxState {
        match &*self.guard {
            SlotState::Active(cnx) => cnx,
            // A referenced connection cannot be torn down; use_count
            // pins it.
            SlotState::Free { .. } => panic!("referenced rpc connection is gone"),
        }
    }

    pub fn state_mut(&mut self) -> &mut CnxState {
        match &mut *self.guard {
            SlotState::Active(cnx) => cnx,
            SlotState::Free { .. } => panic!("referenced rpc connection is gone"),
        }
    }

    pub fn raw_state_mut(&mut self) -> &mut SlotState {
        &mut *self.guard
    }
}
