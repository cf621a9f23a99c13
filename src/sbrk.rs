//! The sbrk-style heap primitive.
//!
//! The allocator runs on one contiguous segment that only ever grows. We
//! reserve the whole address range up front from the platform and hand out
//! bytes from it by bumping a break offset, which is all the `sbrk` contract
//! needs: a low water mark, a high water mark, and "give me `delta` more
//! bytes or fail". Freshly granted bytes read as zero (anonymous mappings
//! and the Miri shim both guarantee it), which the metadata layer relies on
//! when it preserves flag bits of headers it has never written.

use std::fmt;
use std::ptr::NonNull;

use crate::header::offset;
use crate::Pointer;

/// Reservation size of the backing segment. Growth past this point fails,
/// which surfaces as allocation failure.
pub(crate) const MAX_HEAP: usize = 32 * 1024 * 1024;

/// Failure of the heap primitive itself.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SbrkError {
    /// The platform refused to reserve the backing segment.
    Reserve,
    /// The segment reached its reservation limit.
    OutOfSpace,
}

impl fmt::Display for SbrkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SbrkError::Reserve => f.write_str("failed to reserve the backing heap segment"),
            SbrkError::OutOfSpace => f.write_str("heap segment reservation exhausted"),
        }
    }
}

impl std::error::Error for SbrkError {}

/// A reserved segment with a monotonically advancing break.
#[derive(Debug)]
pub(crate) struct Sbrk {
    base: NonNull<u8>,
    brk: usize,
    limit: usize,
}

impl Sbrk {
    /// Reserves a segment of at least `limit` bytes, rounded up to whole
    /// pages. The break starts at zero.
    pub fn reserve(limit: usize) -> Result<Self, SbrkError> {
        let page = os::page_size();
        let limit = (limit.max(page) + page - 1) / page * page;

        let base = unsafe { os::reserve(limit) }.ok_or(SbrkError::Reserve)?;

        Ok(Self { base, brk: 0, limit })
    }

    /// Low water mark: the first byte of the segment.
    pub fn lo(&self) -> NonNull<u8> {
        self.base
    }

    /// High water mark: the last in-use byte.
    pub fn hi(&self) -> NonNull<u8> {
        debug_assert!(self.brk > 0);
        unsafe { offset(self.base, self.brk as isize - 1) }
    }

    /// Bytes currently in use. Only the tests measure the heap this way.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.brk
    }

    /// Advances the break by `delta` bytes and returns the old break
    /// address, or `None` if the reservation cannot hold the growth.
    pub fn sbrk(&mut self, delta: usize) -> Pointer<u8> {
        if delta > self.limit - self.brk {
            return None;
        }

        let old = unsafe { offset(self.base, self.brk as isize) };
        self.brk += delta;

        Some(old)
    }

    /// Whether `address` lies within the in-use part of the segment.
    pub fn contains(&self, address: NonNull<u8>) -> bool {
        let lo = self.base.as_ptr() as usize;
        let address = address.as_ptr() as usize;

        address >= lo && address < lo + self.brk
    }
}

impl Drop for Sbrk {
    fn drop(&mut self) {
        unsafe { os::release(self.base, self.limit) }
    }
}

#[cfg(all(unix, not(miri)))]
mod os {
    use std::ptr::{self, NonNull};

    use crate::Pointer;

    pub fn page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
    }

    pub unsafe fn reserve(length: usize) -> Pointer<u8> {
        // Read-write, private to our process and not mapped to any file.
        let protection = libc::PROT_READ | libc::PROT_WRITE;
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

        match libc::mmap(ptr::null_mut(), length, protection, flags, -1, 0) {
            libc::MAP_FAILED => None,
            address => Some(NonNull::new_unchecked(address).cast()),
        }
    }

    pub unsafe fn release(address: NonNull<u8>, length: usize) {
        if libc::munmap(address.cast().as_ptr(), length) != 0 {
            // The segment stays mapped; nothing sensible to do about it.
        }
    }
}

#[cfg(all(windows, not(miri)))]
mod os {
    use std::{mem::MaybeUninit, ptr::NonNull};

    use windows::Win32::System::{Memory, SystemInformation};

    use crate::Pointer;

    pub fn page_size() -> usize {
        unsafe {
            let mut info = MaybeUninit::uninit();
            SystemInformation::GetSystemInfo(info.as_mut_ptr());
            info.assume_init().dwPageSize as usize
        }
    }

    pub unsafe fn reserve(length: usize) -> Pointer<u8> {
        // Reserve and commit in one call; committed pages are zero-filled.
        let protection = Memory::PAGE_READWRITE;
        let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

        let address = Memory::VirtualAlloc(None, length, flags, protection);

        NonNull::new(address.cast())
    }

    pub unsafe fn release(address: NonNull<u8>, _length: usize) {
        // Length 0 with MEM_RELEASE frees the whole reservation.
        if !Memory::VirtualFree(address.cast().as_ptr(), 0, Memory::MEM_RELEASE).as_bool() {
            // Same story as munmap failure: nothing sensible to do.
        }
    }
}

#[cfg(miri)]
mod os {
    //! There's no FFI under Miri, so the segment is backed by the global
    //! allocator instead. `alloc_zeroed` mirrors the zero-fill of anonymous
    //! mappings. This also lets Miri catch a leaked or double-released
    //! segment.

    use std::{alloc, ptr::NonNull};

    use crate::Pointer;

    pub fn page_size() -> usize {
        4096
    }

    fn layout_for(length: usize) -> alloc::Layout {
        alloc::Layout::from_size_align(length, page_size()).unwrap()
    }

    pub unsafe fn reserve(length: usize) -> Pointer<u8> {
        NonNull::new(alloc::alloc_zeroed(layout_for(length)))
    }

    pub unsafe fn release(address: NonNull<u8>, length: usize) {
        alloc::dealloc(address.as_ptr(), layout_for(length));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_until_the_limit() {
        let mut segment = Sbrk::reserve(8192).unwrap();
        assert_eq!(segment.len(), 0);

        let first = segment.sbrk(4096).unwrap();
        assert_eq!(first, segment.lo());
        assert_eq!(segment.len(), 4096);

        let second = segment.sbrk(4096).unwrap();
        assert_eq!(
            second.as_ptr() as usize - first.as_ptr() as usize,
            4096
        );

        // The reservation is spent; further growth must fail without
        // moving the break.
        assert!(segment.sbrk(8).is_none());
        assert_eq!(segment.len(), 8192);
    }

    #[test]
    fn bounds() {
        let mut segment = Sbrk::reserve(4096).unwrap();
        segment.sbrk(128).unwrap();

        assert!(segment.contains(segment.lo()));
        assert!(segment.contains(segment.hi()));
        assert_eq!(
            segment.hi().as_ptr() as usize - segment.lo().as_ptr() as usize,
            127
        );

        let past = unsafe { offset(segment.hi(), 1) };
        assert!(!segment.contains(past));
    }
}
