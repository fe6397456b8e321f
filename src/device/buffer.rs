//! Device memory: cache-line aligned byte buffers and the per-run probe scratch.
use crate::error::DeviceError;
use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// A zero-initialized, cache-line aligned allocation that lanes address by raw pointer.
///
/// Lanes write disjoint words while building a ring and only read while probing; launches are
/// separated by a join, so no two lanes ever race on the same word.
pub struct DeviceBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// Access goes through raw pointers inside kernels, see the type docs for the aliasing rules
unsafe impl Send for DeviceBuffer {}
unsafe impl Sync for DeviceBuffer {}

impl DeviceBuffer {
    pub(crate) fn allocate(bytes: usize, align: usize) -> Result<Self, DeviceError> {
        let layout = Layout::from_size_align(bytes.max(1), align)
            .map_err(|_| DeviceError::AllocationFailed { bytes })?;
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(DeviceError::AllocationFailed { bytes })?;
        Ok(DeviceBuffer { ptr, layout })
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    /// Base address as seen by kernels
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Zero the whole buffer
    pub fn clear(&mut self) {
        unsafe { self.ptr.as_ptr().write_bytes(0, self.len()) };
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), DeviceError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len() => Ok(()),
            _ => Err(DeviceError::TransferOutOfBounds {
                offset,
                len,
                size: self.len(),
            }),
        }
    }

    /// Host-to-device copy
    pub fn copy_from_host(&mut self, offset: usize, src: &[u8]) -> Result<(), DeviceError> {
        self.check(offset, src.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.as_ptr().add(offset), src.len())
        };
        Ok(())
    }

    /// Device-to-host copy
    pub fn copy_to_host(&self, offset: usize, dst: &mut [u8]) -> Result<(), DeviceError> {
        self.check(offset, dst.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), dst.as_mut_ptr(), dst.len())
        };
        Ok(())
    }

    /// Read one pointer-sized word back to the host
    pub fn read_word(&self, offset: usize) -> Result<usize, DeviceError> {
        let mut bytes = [0u8; std::mem::size_of::<usize>()];
        self.copy_to_host(offset, &mut bytes)?;
        Ok(usize::from_ne_bytes(bytes))
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Per-run probe outputs: the cycle counter lane 0 publishes into, and the dummy byte every lane
/// writes so the chase cannot be optimized away.
#[derive(Debug, Default)]
pub struct ProbeScratch {
    dummy: AtomicU8,
    cycles: AtomicU64,
}

impl ProbeScratch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host write of the cycle counter (e.g. the reduction sentinel)
    pub fn reset(&self, value: u64) {
        self.cycles.store(value, Ordering::SeqCst);
    }

    /// Host read of the cycle counter
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    pub(crate) fn cycles_cell(&self) -> &AtomicU64 {
        &self.cycles
    }

    pub(crate) fn write_dummy(&self, value: u8) {
        self.dummy.store(value, Ordering::Relaxed);
    }

    pub fn dummy(&self) -> u8 {
        self.dummy.load(Ordering::Relaxed)
    }
}
