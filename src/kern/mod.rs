//! Kern subsystem - kernel collaborator seams
//!
//! The RPC module runs inside a larger kernel but touches it through a
//! handful of narrow interfaces: the CPU scheduler's wait/wakeup
//! primitives, the user-memory copy layer, a monotonic clock with
//! one-shot timers, and the host interrupt doorbell. Each seam is a
//! trait here; [`hosted`] implements them all over `std` for tests and
//! host-side tooling.

pub mod copyio;
pub mod host;
pub mod sched;
pub mod timer;

#[cfg(any(test, feature = "std"))]
pub mod hosted;

pub use copyio::{copy_in_value, copy_out_value, BufferKind, CopyFault, CopyIo, VmAddr};
pub use host::HostBridge;
pub use sched::{ActionMask, CpuSched, WaitChannel, WaitClass, WaitStatus};
pub use timer::{Clock, TimerHandle, TimerQueue};

use alloc::sync::Arc;

/// The bundle of kernel services an [`crate::rpc::RpcRegistry`] is
/// constructed with. Built once at startup and handed to the registry;
/// nothing in the RPC module reaches for ambient globals.
#[derive(Clone)]
pub struct KernelHooks {
    /// Scheduler: blocking, wakeup, world identity.
    pub sched: Arc<dyn CpuSched>,
    /// User/host/kernel memory copy.
    pub copy: Arc<dyn CopyIo>,
    /// Monotonic time source for timeouts and latency accounting.
    pub clock: Arc<dyn Clock>,
    /// Doorbell into the console-OS interrupt path.
    pub host: Arc<dyn HostBridge>,
    /// One-shot wakeup timers; driven by the platform tick.
    pub timers: Arc<TimerQueue>,
}
