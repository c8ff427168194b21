use std::fmt;
use std::ptr::NonNull;

#[derive(Debug)]
pub enum VmError {
    ReservationFailed(std::io::Error),
    CommitFailed(std::io::Error),
    ReleaseFailed(std::io::Error),
    InitializationFailed(String),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::ReservationFailed(e) => write!(f, "VM reservation failed: {e}"),
            VmError::CommitFailed(e) => write!(f, "VM commit failed: {e}"),
            VmError::ReleaseFailed(e) => write!(f, "VM release failed: {e}"),
            VmError::InitializationFailed(msg) => write!(f, "VM initialization failed: {msg}"),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::ReservationFailed(e)
            | VmError::CommitFailed(e)
            | VmError::ReleaseFailed(e) => Some(e),
            VmError::InitializationFailed(_) => None,
        }
    }
}

/// Abstract interface for virtual memory operations.
///
/// The heap region reserves its whole address range up front and commits
/// physical pages only as the break moves; this trait is the seam between
/// that policy and the platform.
pub(crate) trait VmOps {
    /// Reserve address space without committing physical pages.
    /// Returns a pointer to the start of the reserved range.
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError>;

    /// Commit (back with physical pages) a range within a reservation.
    /// Freshly committed pages read as zero.
    unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Release address space entirely (after which pointers are invalid).
    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// OS page size.
    fn page_size() -> usize;
}

pub(crate) struct PlatformVmOps;

#[cfg(all(unix, not(miri)))]
mod unix {
    use super::{NonNull, PlatformVmOps, VmError, VmOps};
    use std::io;

    impl VmOps for PlatformVmOps {
        unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(VmError::ReservationFailed(io::Error::last_os_error()));
            }

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(VmError::ReservationFailed(io::Error::other(
                    "mmap returned null",
                ))),
            }
        }

        unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to mprotect.
            if unsafe {
                libc::mprotect(
                    ptr.as_ptr().cast::<libc::c_void>(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            } != 0
            {
                return Err(VmError::CommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            use std::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                // PORTABILITY: this crate supports only 64-bit targets; the page
                // size fits in usize there.
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                let size = raw as usize;
                size
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Heap-backed mock (miri and non-Unix targets)
//
// Under Miri we cannot issue real VM syscalls, and no supported non-Unix
// backend is wired up. Every "reservation" is backed by a plain zeroed heap
// allocation via `std::alloc`; `commit` is a no-op because the memory is
// accessible the moment it is reserved. This is sufficient for exercising
// the allocator logic; page-fault behaviour is covered by the real platform
// implementation in normal builds.
// ---------------------------------------------------------------------------
#[cfg(any(miri, not(unix)))]
impl VmOps for PlatformVmOps {
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
        if size == 0 {
            return Err(VmError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "zero-size reservation",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| VmError::ReservationFailed(std::io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            VmError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn commit(_ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
        Ok(()) // heap memory is always accessible
    }

    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| VmError::ReleaseFailed(std::io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `reserve`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size() -> usize {
        4096
    }
}

#[cfg(all(test, not(miri)))]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_commit_release() {
        let size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::reserve(size).expect("Reserve failed");
            PlatformVmOps::commit(ptr, size).expect("Commit failed");

            let slice = std::slice::from_raw_parts_mut(ptr.as_ptr(), size);
            slice[0] = 42;
            assert_eq!(slice[0], 42);

            PlatformVmOps::release(ptr, size).expect("Release failed");
        }
    }

    #[test]
    fn test_commit_is_zero_filled() {
        let size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::reserve(size).expect("Reserve failed");
            PlatformVmOps::commit(ptr, size).expect("Commit failed");

            let slice = std::slice::from_raw_parts(ptr.as_ptr().cast_const(), size);
            assert!(slice.iter().all(|&b| b == 0), "fresh pages must read zero");

            PlatformVmOps::release(ptr, size).expect("Release failed");
        }
    }

    #[test]
    fn test_commit_idempotent() {
        let size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::reserve(size).expect("Reserve failed");
            PlatformVmOps::commit(ptr, size).expect("First commit failed");
            PlatformVmOps::commit(ptr, size).expect("Second commit failed (idempotency check)");

            *(ptr.as_ptr()) = 123;
            assert_eq!(*(ptr.as_ptr().cast_const()), 123);

            PlatformVmOps::release(ptr, size).expect("Release failed");
        }
    }

    #[test]
    fn test_partial_commit() {
        // Reserve a large range, commit only a prefix — the pattern the heap
        // region relies on as the break advances.
        let page_size = PlatformVmOps::page_size();
        let total_size = page_size * 4;

        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::reserve(total_size).expect("Reserve failed");
            PlatformVmOps::commit(ptr, page_size).expect("Prefix commit failed");

            let slice = std::slice::from_raw_parts_mut(ptr.as_ptr(), page_size);
            slice[0] = 10;
            slice[page_size - 1] = 20;
            assert_eq!(slice[0], 10);
            assert_eq!(slice[page_size - 1], 20);

            // Extend the committed prefix and touch the second page.
            let second = NonNull::new(ptr.as_ptr().add(page_size)).unwrap();
            PlatformVmOps::commit(second, page_size).expect("Extend commit failed");
            *second.as_ptr() = 30;
            assert_eq!(*second.as_ptr().cast_const(), 30);

            PlatformVmOps::release(ptr, total_size).expect("Release failed");
        }
    }

    #[test]
    fn test_page_size_is_power_of_two() {
        let size = PlatformVmOps::page_size();
        assert!(size > 0);
        assert_eq!(size & (size - 1), 0, "Page size {size} is not power of two");
    }

    #[test]
    fn test_multiple_reservations() {
        let page_size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr1 = PlatformVmOps::reserve(page_size).expect("Reserve 1 failed");
            let ptr2 = PlatformVmOps::reserve(page_size).expect("Reserve 2 failed");
            assert_ne!(ptr1, ptr2);

            PlatformVmOps::commit(ptr1, page_size).expect("Commit 1 failed");
            PlatformVmOps::commit(ptr2, page_size).expect("Commit 2 failed");

            *(ptr1.as_ptr()) = 1;
            *(ptr2.as_ptr()) = 2;
            assert_eq!(*(ptr1.as_ptr()), 1);
            assert_eq!(*(ptr2.as_ptr()), 2);

            PlatformVmOps::release(ptr1, page_size).expect("Release 1 failed");

            // ptr2 must still be valid
            assert_eq!(*(ptr2.as_ptr()), 2);
            PlatformVmOps::release(ptr2, page_size).expect("Release 2 failed");
        }
    }
}
