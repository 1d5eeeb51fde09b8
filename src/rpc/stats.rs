//! RPC statistics
//!
//! Two pieces: a global collection window (enabled/disabled with its
//! active time accumulated) and a per-world latency table for user RPC
//! calls, one row per function number in the user call range. Recording
//! is cheap and never fails; a function outside the table is simply not
//! counted.

use alloc::string::String;
use core::fmt::Write;

use spin::Mutex;

use super::registry::RpcRegistry;
use super::{RpcError, RpcResult, RPC_NUM_USER_RPC_CALLS, RPC_USER_CALL_BASE};
use crate::types::WorldId;

// ============================================================================
// COLLECTION WINDOW
// ============================================================================

struct WindowState {
    enabled: bool,
    start_us: u64,
    active_us: u64,
}

/// Tracks whether collection is on and for how long it has been.
pub struct StatsWindow {
    inner: Mutex<WindowState>,
}

impl StatsWindow {
    /// Collection starts enabled.
    pub fn new(now_us: u64) -> Self {
        Self {
            inner: Mutex::new(WindowState {
                enabled: true,
                start_us: now_us,
                active_us: 0,
            }),
        }
    }

    pub fn enable(&self, now_us: u64) {
        let mut w = self.inner.lock();
        if !w.enabled {
            w.enabled = true;
            w.start_us = now_us;
        }
    }

    pub fn disable(&self, now_us: u64) {
        let mut w = self.inner.lock();
        if w.enabled {
            w.enabled = false;
            w.active_us += now_us.saturating_sub(w.start_us);
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().enabled
    }

    /// Total enabled time, the current stretch included.
    pub fn active_us(&self, now_us: u64) -> u64 {
        let w = self.inner.lock();
        let running = if w.enabled {
            now_us.saturating_sub(w.start_us)
        } else {
            0
        };
        w.active_us + running
    }
}

// ============================================================================
// PER-WORLD CALL LATENCIES
// ============================================================================

/// Latency rows for one world, indexed by function number.
pub struct UserRpcStats {
    call_cnt: [u32; RPC_NUM_USER_RPC_CALLS],
    max_us: [u64; RPC_NUM_USER_RPC_CALLS],
    tot_us: [u64; RPC_NUM_USER_RPC_CALLS],
}

impl UserRpcStats {
    pub fn zeroed() -> Self {
        Self {
            call_cnt: [0; RPC_NUM_USER_RPC_CALLS],
            max_us: [0; RPC_NUM_USER_RPC_CALLS],
            tot_us: [0; RPC_NUM_USER_RPC_CALLS],
        }
    }

    fn index_of(function: i32) -> Option<usize> {
        let off = function.wrapping_sub(RPC_USER_CALL_BASE);
        if (0..RPC_NUM_USER_RPC_CALLS as i32).contains(&off) {
            Some(off as usize)
        } else {
            None
        }
    }

    /// Fold one call's latency in. Functions outside the user call
    /// range are not tracked.
    pub fn record(&mut self, function: i32, delta_us: u64) {
        let Some(idx) = Self::index_of(function) else {
            return;
        };
        self.call_cnt[idx] = self.call_cnt[idx].saturating_add(1);
        self.tot_us[idx] = self.tot_us[idx].saturating_add(delta_us);
        if delta_us > self.max_us[idx] {
            self.max_us[idx] = delta_us;
        }
    }

    pub fn reset(&mut self) {
        *self = Self::zeroed();
    }

    /// (count, max, total) for one function, if tracked.
    pub fn row(&self, function: i32) -> Option<(u32, u64, u64)> {
        Self::index_of(function).map(|idx| (self.call_cnt[idx], self.max_us[idx], self.tot_us[idx]))
    }

    /// Nonzero rows, one per line.
    pub fn report(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "func    calls     max_us     tot_us");
        for idx in 0..RPC_NUM_USER_RPC_CALLS {
            if self.call_cnt[idx] == 0 {
                continue;
            }
            let _ = writeln!(
                out,
                "{:4} {:8} {:10} {:10}",
                RPC_USER_CALL_BASE + idx as i32,
                self.call_cnt[idx],
                self.max_us[idx],
                self.tot_us[idx],
            );
        }
        out
    }
}

// ============================================================================
// REGISTRY SURFACE
// ============================================================================

impl RpcRegistry {
    pub fn stats_enable(&self) {
        self.stats.enable(self.hooks.clock.now_us());
    }

    pub fn stats_disable(&self) {
        self.stats.disable(self.hooks.clock.now_us());
    }

    /// Total time stats collection has been enabled.
    pub fn stats_window_us(&self) -> u64 {
        self.stats.active_us(self.hooks.clock.now_us())
    }

    /// Fold a completed call into the calling world's table. A world
    /// the registry does not know is ignored.
    pub(super) fn record_user_call(&self, world: WorldId, function: i32, delta_us: u64) {
        if !self.stats.is_enabled() {
            return;
        }
        let mut table = self.table.lock();
        if let Some(ws) = table.worlds.get_mut(&world) {
            ws.stats.record(function, delta_us);
        }
    }

    /// Text command interface: `enable`, `disable`, or `reset` (clears
    /// `world`'s rows).
    pub fn stats_control(&self, world: WorldId, cmd: &str) -> RpcResult<()> {
        match cmd {
            "enable" => {
                self.stats_enable();
                Ok(())
            }
            "disable" => {
                self.stats_disable();
                Ok(())
            }
            "reset" => {
                let mut table = self.table.lock();
                let ws = table.worlds.get_mut(&world).ok_or(RpcError::NotFound)?;
                ws.stats.reset();
                Ok(())
            }
            other => {
                log::warn!("rpc: unknown stats command \"{}\"", other);
                Err(RpcError::BadParam)
            }
        }
    }

    /// Render `world`'s latency rows, followed by the window state.
    pub fn user_stats_report(&self, world: WorldId) -> RpcResult<String> {
        let table = self.table.lock();
        let ws = table.worlds.get(&world).ok_or(RpcError::NotFound)?;
        let mut out = ws.stats.report();
        let _ = writeln!(
            out,
            "window: {}, {} us active",
            if self.stats.is_enabled() {
                "enabled"
            } else {
                "disabled"
            },
            self.stats.active_us(self.hooks.clock.now_us()),
        );
        Ok(out)
    }

    /// (count, max, total) of one function for `world`, for callers
    /// that want numbers instead of text.
    pub fn user_stats_row(&self, world: WorldId, function: i32) -> RpcResult<(u32, u64, u64)> {
        let table = self.table.lock();
        let ws = table.worlds.get(&world).ok_or(RpcError::NotFound)?;
        ws.stats.row(function).ok_or(RpcError::BadParam)
    }
}
