//! Common types used across vmkrpc
//!
//! This module defines shared types to avoid circular dependencies.

use core::fmt;

/// World identifier - an independently schedulable kernel execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct WorldId(pub u32);

impl WorldId {
    /// Sentinel for "no world".
    pub const INVALID: WorldId = WorldId(u32::MAX);

    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Display for WorldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "world{}", self.0)
        } else {
            f.write_str("world<none>")
        }
    }
}
