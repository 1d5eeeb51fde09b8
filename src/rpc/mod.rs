//! Connection-oriented kernel RPC
//!
//! Worlds exchange fixed-size messages over named connections. A server
//! world registers a connection, clients look it up by name, and both
//! sides move data with send / get-msg / post-reply / get-reply, with
//! tokens correlating each request to its reply. All state lives in a
//! fixed table owned by [`RpcRegistry`]; connection ids carry a
//! generation so stale handles fail instead of aliasing a reused slot.

use core::fmt;

use bitflags::bitflags;
use static_assertions::const_assert;

use crate::kern::{CopyFault, VmAddr};
use crate::types::WorldId;

pub mod connection;
pub mod message;
pub mod ops;
pub mod pending;
pub mod registry;
pub mod stats;

pub use connection::CnxOptions;
pub use pending::PendingSnapshot;
pub use registry::RpcRegistry;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Default size of the connection table.
pub const RPC_MAX_CONNECTIONS: usize = 8192;

/// Maximum connection name length, terminator included.
pub const RPC_CNX_NAME_LENGTH: usize = 32;

/// Payload cap; longer sends are truncated to this.
pub const RPC_MAX_MSG_LENGTH: u32 = 512;

/// Tokens in `RPC_TOKEN_MIN_RESERVED..=0` are never handed out.
pub const RPC_TOKEN_MIN_RESERVED: RpcToken = -10;

/// The "no token" value, from inside the reserved band.
pub const RPC_TOKEN_INVALID: RpcToken = -1;

/// Rows in the per-world user call latency table.
pub const RPC_NUM_USER_RPC_CALLS: usize = 80;

/// First function number the latency table covers.
pub const RPC_USER_CALL_BASE: i32 = 300;

// Slot/generation arithmetic divides the u32 id space into whole
// generations per slot.
const_assert!(RPC_MAX_CONNECTIONS.is_power_of_two());
// The allocator skips the reserved band, so INVALID can never collide
// with a live token.
const_assert!(RPC_TOKEN_MIN_RESERVED <= RPC_TOKEN_INVALID && RPC_TOKEN_INVALID <= 0);

// ============================================================================
// TYPES
// ============================================================================

/// Correlates a request with its reply on one connection.
pub type RpcToken = i32;

bitflags! {
    /// Caller-supplied behavior bits for the message operations.
    pub struct RpcFlags: u32 {
        /// Block instead of returning `WouldBlock` on an empty queue.
        const CAN_BLOCK = 0x01;
        /// Allocate a token for this send; the receiver must reply.
        const REPLY_EXPECTED = 0x02;
        /// Use the caller's token verbatim instead of allocating one.
        const FORCE_TOKEN = 0x08;
        /// Let a pending interrupt break the wait.
        const ALLOW_INTERRUPTIONS = 0x10;
    }
}

bitflags! {
    /// Readiness classes for [`RpcRegistry::poll`].
    pub struct PollEvents: u32 {
        const GET_MSG = 0x01;
        const GET_REPLY = 0x02;
        const SEND_MSG = 0x04;
        const POST_REPLY = 0x08;
        const CALL = 0x10;
    }
}

/// Connection handle: `generation * table_size + slot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RpcCnxId(pub u32);

impl RpcCnxId {
    pub const INVALID: Self = Self(u32::MAX);

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }

    /// Table slot this id refers to, whatever its generation.
    pub fn slot_index(&self, capacity: usize) -> usize {
        self.0 as usize % capacity
    }
}

impl fmt::Display for RpcCnxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "cnx{}", self.0)
        } else {
            write!(f, "cnx<invalid>")
        }
    }
}

/// Receive descriptor passed to get-msg by address. The caller fills in
/// `data`/`data_len` with its buffer; the kernel writes back the token,
/// function, sender world, and actual length.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MsgInfo {
    pub token: RpcToken,
    pub function: i32,
    pub data: VmAddr,
    pub data_len: u32,
    pub world: WorldId,
}

// ============================================================================
// ERRORS
// ============================================================================

/// Why an RPC operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcError {
    /// No connection matches the id or name.
    NotFound,
    /// The connection is being torn down.
    Disconnected,
    /// A live connection already has this name.
    NameExists,
    /// The connection table is full.
    OutOfSlots,
    /// A fixed resource (buffer pool, allocation) is exhausted.
    LimitExceeded,
    /// The caller's buffer is too small; retry with a bigger one.
    NoResources,
    /// Nothing queued and the caller declined to block.
    WouldBlock,
    /// The wait's deadline passed.
    Timeout,
    /// The wait was broken by an interrupt or action.
    WaitInterrupted,
    /// A caller-supplied argument is invalid.
    BadParam,
    /// Copying to or from the caller's buffer faulted.
    CopyFault(CopyFault),
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "no such connection"),
            Self::Disconnected => write!(f, "connection disconnected"),
            Self::NameExists => write!(f, "connection name in use"),
            Self::OutOfSlots => write!(f, "connection table full"),
            Self::LimitExceeded => write!(f, "resource limit exceeded"),
            Self::NoResources => write!(f, "buffer too small"),
            Self::WouldBlock => write!(f, "operation would block"),
            Self::Timeout => write!(f, "timed out"),
            Self::WaitInterrupted => write!(f, "wait interrupted"),
            Self::BadParam => write!(f, "bad parameter"),
            Self::CopyFault(fault) => write!(f, "copy fault ({})", *fault as i32),
        }
    }
}

impl From<CopyFault> for RpcError {
    fn from(fault: CopyFault) -> Self {
        Self::CopyFault(fault)
    }
}

/// Result type for RPC operations.
pub type RpcResult<T> = Result<T, RpcError>;
