//! Host doorbell seam
//!
//! The host ("console OS") polls connections through the shared
//! pending-work summary, but a send on a connection registered with
//! `notify_host` also rings an interrupt so a sleeping host wakes
//! promptly. The interrupt path itself lives outside this module.

/// The host-bridging layer as seen from the RPC module.
pub trait HostBridge: Send + Sync {
    /// Ring the host's RPC event interrupt. Called without any
    /// connection lock held.
    fn interrupt_host(&self);
}
