//! Message buffers
//!
//! An [`RpcMessage`] is one fixed-capacity buffer plus the header fields
//! that travel with it. Buffers are allocated once when a connection
//! registers and then cycle between the connection's free list and its
//! two queues; `len` says how much of `buf` the current occupant uses.

use alloc::boxed::Box;
use alloc::collections::TryReserveError;
use alloc::vec::Vec;

use super::{RpcToken, RPC_TOKEN_INVALID};
use crate::types::WorldId;

/// One pooled message buffer.
pub struct RpcMessage {
    /// Token correlating this message with its reply, or
    /// `RPC_TOKEN_INVALID` when no reply is expected.
    pub token: RpcToken,
    /// Function number named by the sender; 0 for replies.
    pub function: i32,
    /// World that queued the message.
    pub sender: WorldId,
    /// Bytes of `buf` in use.
    pub len: u32,
    buf: Box<[u8]>,
}

impl RpcMessage {
    /// Allocate one buffer of `capacity` bytes. Fails instead of
    /// aborting when the allocation cannot be satisfied.
    pub fn try_with_capacity(capacity: u32) -> Result<Box<Self>, TryReserveError> {
        let mut bytes: Vec<u8> = Vec::new();
        bytes.try_reserve_exact(capacity as usize)?;
        bytes.resize(capacity as usize, 0);
        Ok(Box::new(Self {
            token: RPC_TOKEN_INVALID,
            function: 0,
            sender: WorldId::INVALID,
            len: 0,
            buf: bytes.into_boxed_slice(),
        }))
    }

    pub fn capacity(&self) -> u32 {
        self.buf.len() as u32
    }

    /// The bytes the current occupant wrote.
    pub fn payload(&self) -> &[u8] {
        &self.buf[..self.len as usize]
    }

    /// Whole buffer, for copy-in before `len` is set.
    pub fn buf_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}
