//! Copyin/Copyout - data transfer between the kernel and a caller space
//!
//! Message payloads and descriptors live in the caller's address space:
//! another world's user mappings, the host process, or plain kernel
//! memory. The copy layer owns the page-fault handling; from this module
//! a copy is just a fallible operation. A fault is a soft error - the
//! RPC path never holds a connection lock across a copy, and every copy
//! is followed by a re-validation of the connection.

use core::mem::{self, MaybeUninit};
use core::slice;

/// Address in a caller's space. Which space is named by [`BufferKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct VmAddr(pub usize);

impl VmAddr {
    pub const NULL: VmAddr = VmAddr(0);

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address of a kernel object, for [`BufferKind::Kernel`] copies.
    #[inline]
    pub fn from_ref<T>(obj: &T) -> Self {
        VmAddr(obj as *const T as usize)
    }

    /// Address of a writable kernel object.
    #[inline]
    pub fn from_mut<T>(obj: &mut T) -> Self {
        VmAddr(obj as *mut T as usize)
    }
}

/// Which address space a buffer address refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Kernel virtual address; the copy cannot fault.
    Kernel,
    /// A world's user-space mapping.
    User,
    /// The host ("console OS") process.
    Host,
}

/// Errors a copy can hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum CopyFault {
    /// Bad address (null or outside the named space).
    BadAddress = -1,
    /// Page fault on an unmapped page.
    PageFault = -2,
    /// Protection violation (write to a read-only page).
    Protection = -3,
}

/// Copy operation result.
pub type CopyResult = Result<(), CopyFault>;

/// The memory-copy layer as seen from the RPC module.
pub trait CopyIo: Send + Sync {
    /// Copy `dst.len()` bytes from `src` in the caller's space into the
    /// kernel buffer `dst`.
    fn copy_in(&self, dst: &mut [u8], src: VmAddr, kind: BufferKind) -> CopyResult;

    /// Copy `src` out to `dst` in the caller's space.
    fn copy_out(&self, dst: VmAddr, src: &[u8], kind: BufferKind) -> CopyResult;
}

/// Copy a plain-data value in from a caller space. Used for request
/// descriptors that callers pass by address.
pub fn copy_in_value<T: Copy>(io: &dyn CopyIo, src: VmAddr, kind: BufferKind) -> Result<T, CopyFault> {
    let mut val = MaybeUninit::<T>::uninit();
    // A `T: Copy` descriptor is plain bytes; fill it through the byte path.
    let dst = unsafe { slice::from_raw_parts_mut(val.as_mut_ptr() as *mut u8, mem::size_of::<T>()) };
    io.copy_in(dst, src, kind)?;
    Ok(unsafe { val.assume_init() })
}

/// Copy a plain-data value out to a caller space.
pub fn copy_out_value<T: Copy>(
    io: &dyn CopyIo,
    dst: VmAddr,
    val: &T,
    kind: BufferKind,
) -> CopyResult {
    let src = unsafe { slice::from_raw_parts(val as *const T as *const u8, mem::size_of::<T>()) };
    io.copy_out(dst, src, kind)
}
