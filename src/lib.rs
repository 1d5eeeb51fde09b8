//! vmkrpc - the vmkernel RPC subsystem
//!
//! Connection-oriented, in-kernel message passing between kernel execution
//! contexts ("worlds") and the console-OS host process. A connection is a
//! named, table-resident channel carrying requests (message FIFO) and
//! token-correlated replies (reply FIFO) backed by a fixed pool of
//! preallocated buffers.
//!
//! The scheduler, user-memory copy, timer and host-interrupt layers are
//! consumed through the trait seams in [`kern`]; `kern::hosted` provides a
//! std-backed implementation of those seams for tests and tooling.

#![no_std]
#![allow(dead_code)]
// Kernel-appropriate clippy configuration
// Many kernel types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]
// Active connection state is large next to the free variant; slots are
// few and fixed, so the footprint is intentional
#![allow(clippy::large_enum_variant)]

// Standard library replacement for no_std
extern crate alloc;

// The hosted kernel and the test suite run on an OS thread per world
#[cfg(any(test, feature = "std"))]
extern crate std;

// Core types
pub mod types;

pub mod kern;
pub mod rpc;

pub use kern::KernelHooks;
pub use rpc::{
    CnxOptions, MsgInfo, PollEvents, RpcCnxId, RpcError, RpcFlags, RpcRegistry, RpcResult,
};
pub use types::WorldId;

/// Subsystem version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Subsystem name
pub const NAME: &str = "vmkrpc";
