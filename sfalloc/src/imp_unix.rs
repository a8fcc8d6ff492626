use crate::backend::Backend;
use crate::const_init::ConstInit;
use crate::error::AllocError;
use crate::units::Bytes;
use core::cell::UnsafeCell;
use core::mem;
use core::ptr::{self, NonNull};

/// The operating system's allocator: `libc` `malloc` and friends for
/// delegated requests, and private anonymous `mmap`s for arenas, so that arena
/// memory never intermixes with the general heap and can be returned to the
/// kernel as soon as an arena drains.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsBackend;

impl ConstInit for OsBackend {
    const INIT: Self = OsBackend;
}

unsafe impl Backend for OsBackend {
    fn malloc(&self, size: Bytes) -> Result<NonNull<u8>, AllocError> {
        let ptr = unsafe { libc::malloc(size.0) };
        NonNull::new(ptr as *mut u8).ok_or(AllocError::OutOfMemory)
    }

    fn malloc_aligned(&self, size: Bytes, align: usize) -> Result<NonNull<u8>, AllocError> {
        extra_assert!(align.is_power_of_two());
        // `posix_memalign` wants a multiple of the pointer size.
        let align = align.max(mem::size_of::<*mut u8>());
        let mut out = ptr::null_mut();
        let code = unsafe { libc::posix_memalign(&mut out, align, size.0) };
        if code != 0 {
            return Err(AllocError::OutOfMemory);
        }
        NonNull::new(out as *mut u8).ok_or(AllocError::OutOfMemory)
    }

    unsafe fn realloc(&self, ptr: NonNull<u8>, size: Bytes) -> Result<NonNull<u8>, AllocError> {
        let new = libc::realloc(ptr.as_ptr().cast(), size.0);
        NonNull::new(new as *mut u8).ok_or(AllocError::OutOfMemory)
    }

    unsafe fn free(&self, ptr: NonNull<u8>) {
        libc::free(ptr.as_ptr().cast());
    }

    fn reserve_arena(&self, size: Bytes) -> Result<NonNull<u8>, AllocError> {
        unsafe {
            let addr = libc::mmap(
                ptr::null_mut(),
                size.0,
                libc::PROT_WRITE | libc::PROT_READ,
                libc::MAP_ANON | libc::MAP_PRIVATE,
                -1,
                0,
            );
            if addr == libc::MAP_FAILED {
                Err(AllocError::OutOfMemory)
            } else {
                NonNull::new(addr as *mut u8).ok_or(AllocError::OutOfMemory)
            }
        }
    }

    unsafe fn release_arena(&self, base: NonNull<u8>, size: Bytes) {
        let code = libc::munmap(base.as_ptr().cast(), size.0);
        extra_assert_eq!(code, 0, "munmap should run OK");
    }
}

// Align to the cache line size on an i7 to prevent false sharing.
#[repr(align(64))]
pub(crate) struct Exclusive<T> {
    lock: UnsafeCell<libc::pthread_mutex_t>,
    inner: UnsafeCell<T>,
}

impl<T: ConstInit> ConstInit for Exclusive<T> {
    const INIT: Self = Exclusive {
        lock: UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER),
        inner: UnsafeCell::new(T::INIT),
    };
}

impl<T> Exclusive<T> {
    /// Get exclusive, mutable access to the inner value.
    ///
    /// # Safety
    ///
    /// Does not assert that `pthread`s calls return OK, unless the
    /// "extra_assertions" feature is enabled. This means that if `f` re-enters
    /// this method for the same `Exclusive` instance, there will be undetected
    /// mutable aliasing, which is UB.
    #[inline]
    pub(crate) unsafe fn with_exclusive_access<F, U>(&self, f: F) -> U
    where
        for<'x> F: FnOnce(&'x mut T) -> U,
    {
        let code = libc::pthread_mutex_lock(self.lock.get());
        extra_assert_eq!(code, 0, "pthread_mutex_lock should run OK");

        let result = f(&mut *self.inner.get());

        let code = libc::pthread_mutex_unlock(self.lock.get());
        extra_assert_eq!(code, 0, "pthread_mutex_unlock should run OK");

        result
    }
}
