//! Connection table and lifecycle
//!
//! The registry owns a fixed array of slots plus a table lock guarding
//! the name index and per-world bookkeeping. Lock order: a slot lock
//! may be held while taking the table lock, never the other way
//! around. Lookups go through [`RpcRegistry::find_and_lock`], which
//! pins the connection with a use count; teardown waits for that count
//! to drain rather than freeing under a reader.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write;
use core::mem;

use spin::Mutex;

use super::connection::{CnxOptions, CnxRef, CnxSlot, CnxState, LockedCnx, SlotState};
use super::pending::{PendingSet, PendingSnapshot};
use super::stats::{StatsWindow, UserRpcStats};
use super::{RpcCnxId, RpcError, RpcResult, RPC_CNX_NAME_LENGTH, RPC_MAX_CONNECTIONS};
use crate::kern::{KernelHooks, WaitChannel};
use crate::types::WorldId;

/// Name-index mirror of one slot, readable under the table lock alone.
struct SlotMeta {
    allocated: bool,
    pending_destroy: bool,
    name: heapless::String<RPC_CNX_NAME_LENGTH>,
    /// `RpcCnxId::INVALID` while a registration is still in flight.
    id: RpcCnxId,
}

impl SlotMeta {
    fn new() -> Self {
        Self {
            allocated: false,
            pending_destroy: false,
            name: heapless::String::new(),
            id: RpcCnxId::INVALID,
        }
    }

    fn clear(&mut self) {
        self.allocated = false;
        self.pending_destroy = false;
        self.name.clear();
        self.id = RpcCnxId::INVALID;
    }
}

/// Connections registered by one world, plus its call latency rows.
pub(super) struct WorldState {
    pub(super) cnx_ids: Vec<RpcCnxId>,
    pub(super) stats: UserRpcStats,
}

impl WorldState {
    fn new() -> Self {
        Self {
            cnx_ids: Vec::new(),
            stats: UserRpcStats::zeroed(),
        }
    }
}

pub(super) struct TableMeta {
    metas: Box<[SlotMeta]>,
    pub(super) worlds: BTreeMap<WorldId, WorldState>,
}

/// The RPC subsystem: connection table, summary mask, and stats.
pub struct RpcRegistry {
    capacity: usize,
    slots: Box<[CnxSlot]>,
    pub(super) table: Mutex<TableMeta>,
    pub(super) pending: PendingSet,
    pub(super) stats: StatsWindow,
    pub(super) hooks: KernelHooks,
}

impl RpcRegistry {
    pub fn new(hooks: KernelHooks) -> Self {
        Self::with_capacity(RPC_MAX_CONNECTIONS, hooks)
    }

    pub fn with_capacity(capacity: usize, hooks: KernelHooks) -> Self {
        debug_assert!(capacity.is_power_of_two() && capacity < u32::MAX as usize);
        let slots = (0..capacity)
            .map(|_| CnxSlot::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let metas = (0..capacity)
            .map(|_| SlotMeta::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let now = hooks.clock.now_us();
        Self {
            capacity,
            slots,
            table: Mutex::new(TableMeta {
                metas,
                worlds: BTreeMap::new(),
            }),
            pending: PendingSet::new(capacity),
            stats: StatsWindow::new(now),
            hooks,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // ========================================================================
    // REFERENCES
    // ========================================================================

    /// Resolve an id to its locked connection and take a reference.
    /// Stale generations and freed slots fail with `NotFound`; a
    /// connection in teardown refuses new references with
    /// `Disconnected`.
    pub(super) fn find_and_lock(&self, id: RpcCnxId) -> RpcResult<LockedCnx<'_>> {
        if !id.is_valid() {
            return Err(RpcError::NotFound);
        }
        let idx = id.slot_index(self.capacity);
        let slot = &self.slots[idx];
        // Unlocked prefilter; the locked re-check below decides.
        if slot.id_hint() != id {
            return Err(RpcError::NotFound);
        }
        let mut locked = CnxRef::new(slot, idx).lock();
        {
            let cnx = match locked.raw_state_mut() {
                SlotState::Active(cnx) if cnx.id == id => cnx,
                _ => return Err(RpcError::NotFound),
            };
            if cnx.pending_destroy {
                return Err(RpcError::Disconnected);
            }
            debug_assert!(cnx.use_count > 0);
            cnx.use_count += 1;
        }
        Ok(locked)
    }

    /// Drop one reference and the lock. The last reference of a
    /// connection in teardown frees the slot.
    pub(super) fn release_and_unlock(&self, mut locked: LockedCnx<'_>) {
        let teardown = {
            let cnx = locked.state_mut();
            assert!(
                cnx.use_count > 0,
                "rpc {}: release with zero use count",
                cnx.id
            );
            cnx.use_count -= 1;
            if cnx.use_count == 0 {
                debug_assert!(cnx.pending_destroy);
                true
            } else {
                false
            }
        };
        if teardown {
            self.teardown_locked(locked);
        }
    }

    /// Free a drained slot. Caller holds the slot lock and has seen
    /// `use_count` reach zero with `pending_destroy` set.
    fn teardown_locked(&self, mut locked: LockedCnx<'_>) {
        let idx = locked.idx();
        let slot = locked.slot();
        self.pending.clear(idx);
        let (generation, poll_waiters) = {
            let cnx = locked.state_mut();
            debug_assert_eq!(
                cnx.n_queued as usize,
                cnx.messages.len() + cnx.replies.len()
            );
            log::debug!("rpc: tearing down {} ({})", cnx.id, cnx.name.as_str());
            (cnx.generation, mem::take(&mut cnx.poll_waiters))
        };
        {
            let mut table = self.table.lock();
            table.metas[idx].clear();
        }
        slot.set_id_hint(RpcCnxId::INVALID);
        let retired = mem::replace(locked.raw_state_mut(), SlotState::Free { generation });
        drop(locked);
        // Queued messages and the pool go back to the allocator here,
        // outside the slot lock.
        drop(retired);
        for world in poll_waiters {
            self.hooks.sched.wakeup(WaitChannel::world_poll(world));
        }
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Create a named connection for `world` with `num_bufs` buffers of
    /// `buf_size` bytes each. The registration itself holds a
    /// reference until [`RpcRegistry::unregister`].
    pub fn register(
        &self,
        name: &str,
        options: CnxOptions,
        world: WorldId,
        num_bufs: u32,
        buf_size: u32,
    ) -> RpcResult<RpcCnxId> {
        if name.is_empty() || name.len() >= RPC_CNX_NAME_LENGTH || num_bufs == 0 || buf_size == 0 {
            return Err(RpcError::BadParam);
        }
        let mut stored: heapless::String<RPC_CNX_NAME_LENGTH> = heapless::String::new();
        stored.push_str(name).map_err(|_| RpcError::BadParam)?;

        // Claim a slot in the name index.
        let idx = {
            let mut table = self.table.lock();
            if !table.worlds.contains_key(&world) {
                return Err(RpcError::NotFound);
            }
            let limit = self.pending.scan_limit();
            if table.metas[..limit]
                .iter()
                .any(|m| m.allocated && !m.pending_destroy && m.name.as_str() == name)
            {
                return Err(RpcError::NameExists);
            }
            let idx = table
                .metas
                .iter()
                .position(|m| !m.allocated)
                .ok_or(RpcError::OutOfSlots)?;
            let meta = &mut table.metas[idx];
            meta.allocated = true;
            meta.pending_destroy = false;
            meta.name = stored.clone();
            meta.id = RpcCnxId::INVALID;
            self.pending.note_index(idx);
            idx
        };

        // Allocate the pool outside any lock.
        let pool = match CnxState::build_pool(num_bufs, buf_size) {
            Ok(pool) => pool,
            Err(err) => {
                self.table.lock().metas[idx].clear();
                return Err(err);
            }
        };

        let slot = &self.slots[idx];
        let mut locked = CnxRef::new(slot, idx).lock();
        let generation = match locked.raw_state_mut() {
            SlotState::Free { generation } => *generation,
            SlotState::Active(_) => panic!("claimed rpc slot {} is still active", idx),
        };
        let (id, next_gen) = self.mint_id(idx, generation);
        *locked.raw_state_mut() = SlotState::Active(CnxState::new(
            id, next_gen, stored, world, options, buf_size, pool,
        ));
        slot.set_id_hint(id);

        // Publish the id and tie the connection to its world. The slot
        // lock may be held across the table lock, not vice versa.
        {
            let mut table = self.table.lock();
            match table.worlds.get_mut(&world) {
                Some(ws) => {
                    ws.cnx_ids.push(id);
                    table.metas[idx].id = id;
                }
                None => {
                    // World died under us; undo through the normal
                    // teardown path.
                    drop(table);
                    locked.state_mut().pending_destroy = true;
                    self.release_and_unlock(locked);
                    return Err(RpcError::NotFound);
                }
            }
        }
        drop(locked);
        log::debug!("rpc: registered \"{}\" as {} for {}", name, id, world);
        Ok(id)
    }

    /// Slot index plus generation to connection id. One id per slot per
    /// u32 wrap collides with the invalid marker and is skipped.
    fn mint_id(&self, idx: usize, generation: u32) -> (RpcCnxId, u32) {
        let cap = self.capacity as u32;
        let mut generation = generation;
        let mut id = RpcCnxId(generation.wrapping_mul(cap).wrapping_add(idx as u32));
        let mut next_gen = generation.wrapping_add(1);
        if !id.is_valid() {
            generation = next_gen;
            id = RpcCnxId(generation.wrapping_mul(cap).wrapping_add(idx as u32));
            next_gen = generation.wrapping_add(1);
        }
        (id, next_gen)
    }

    /// Begin teardown and wait for other references to drain. With
    /// `world` given, only that world's connection is torn down.
    ///
    /// Must be called from a blockable context: waiters are woken and
    /// given time to leave before the slot is freed.
    pub fn unregister(&self, id: RpcCnxId, world: Option<WorldId>) -> RpcResult<()> {
        debug_assert!(self.hooks.sched.is_safe_to_block());
        let mut locked = self.find_and_lock(id)?;
        let owner = locked.state().world;
        if world.is_some_and(|w| w != owner) {
            self.release_and_unlock(locked);
            return Err(RpcError::NotFound);
        }
        {
            let cnx = locked.state_mut();
            // The registration's reference plus ours.
            debug_assert!(cnx.use_count >= 2);
            cnx.use_count -= 1;
            cnx.pending_destroy = true;
        }
        {
            let mut table = self.table.lock();
            table.metas[locked.idx()].pending_destroy = true;
        }

        // Push blocked waiters out with Disconnected, then give them
        // time to drop their references.
        let chan = locked.wait_channel();
        while locked.state().use_count > 1 {
            self.hooks.sched.wakeup(chan);
            let r = locked.unlock();
            self.hooks.sched.sleep_ms(10);
            locked = r.lock();
        }

        {
            let mut table = self.table.lock();
            if let Some(ws) = table.worlds.get_mut(&owner) {
                ws.cnx_ids.retain(|c| *c != id);
            }
        }
        log::debug!("rpc: unregistering {}", id);
        self.release_and_unlock(locked);
        Ok(())
    }

    /// Look up a connection by name. Entries in teardown are not
    /// matched, same as the register scan, so a name re-registered
    /// while its old slot drains resolves to the live slot.
    pub fn connect(&self, name: &str) -> RpcResult<RpcCnxId> {
        let limit = self.pending.scan_limit();
        let table = self.table.lock();
        for meta in table.metas[..limit].iter() {
            if !meta.allocated || meta.pending_destroy || meta.name.as_str() != name {
                continue;
            }
            if !meta.id.is_valid() {
                // Registration still in flight; not visible yet.
                continue;
            }
            return Ok(meta.id);
        }
        Err(RpcError::NotFound)
    }

    // ========================================================================
    // WORLDS
    // ========================================================================

    /// Make `world` known to the registry. Idempotent.
    pub fn world_init(&self, world: WorldId) {
        let mut table = self.table.lock();
        table.worlds.entry(world).or_insert_with(WorldState::new);
    }

    /// Tear down everything a dying world registered, then forget it.
    pub fn world_cleanup(&self, world: WorldId) {
        debug_assert!(self.hooks.sched.is_safe_to_block());
        loop {
            let next = {
                let table = self.table.lock();
                table
                    .worlds
                    .get(&world)
                    .and_then(|ws| ws.cnx_ids.first().copied())
            };
            let Some(id) = next else { break };
            if let Err(err) = self.unregister(id, Some(world)) {
                // Raced with another teardown of the same connection;
                // it will drop the id from the list.
                log::debug!("rpc: cleanup of {} hit {}; retrying", id, err);
                self.hooks.sched.sleep_ms(1);
            }
        }
        let mut table = self.table.lock();
        table.worlds.remove(&world);
    }

    // ========================================================================
    // INTROSPECTION
    // ========================================================================

    /// Human-readable table dump, one line per live connection.
    pub fn dump_connections(&self) -> String {
        let mut out = String::new();
        let limit = self.pending.scan_limit();
        for (idx, slot) in self.slots[..limit].iter().enumerate() {
            let guard = slot.lock();
            if let SlotState::Active(cnx) = &*guard {
                let _ = writeln!(
                    out,
                    "{:4}: {} \"{}\" use={} pend={} queued={} free={}",
                    idx,
                    cnx.id,
                    cnx.name.as_str(),
                    cnx.use_count,
                    cnx.pending_destroy,
                    cnx.n_queued,
                    cnx.free_count(),
                );
            }
        }
        out
    }

    /// Snapshot of the pending-message summary mask.
    pub fn check_pending_msgs(&self) -> PendingSnapshot {
        self.pending.snapshot()
    }

    /// Wake every connection's wait channel. Shakes loose anything
    /// stuck in a wait; waiters re-check their queues and carry on.
    pub fn stress_wakeup(&self) {
        let limit = self.pending.scan_limit();
        for slot in self.slots[..limit].iter() {
            if slot.id_hint().is_valid() {
                self.hooks.sched.wakeup(slot.wait_channel());
            }
        }
    }
}
