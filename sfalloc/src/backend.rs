use crate::error::AllocError;
use crate::units::Bytes;
use core::ptr::NonNull;

/// The general-purpose allocator underneath the pools, together with the
/// source of anonymous memory for arenas.
///
/// Oversized and zero-sized requests are handed to `malloc`/`realloc`/`free`
/// untouched, and `release` must later tell those pointers apart from pool
/// blocks without knowing their size.
///
/// # Safety
///
/// Implementors must uphold the following:
///
/// * For every pointer `p` returned by `malloc`, `malloc_aligned` or
///   `realloc`, the `POOL_SIZE`-aligned address at or below `p` must be
///   readable for as long as `p` is live. This holds for any allocator that
///   maps memory in whole pages of at least `POOL_SIZE` bytes.
///
/// * Pointers returned by `malloc_aligned` and `realloc` must be accepted by
///   `free`.
///
/// * `reserve_arena` must return readable and writable memory, aligned to at
///   least `ALIGNMENT`, that is not handed out again until it is passed back
///   to `release_arena`.
pub unsafe trait Backend {
    /// Allocate `size` bytes, aligned to at least `ALIGNMENT`.
    fn malloc(&self, size: Bytes) -> Result<NonNull<u8>, AllocError>;

    /// Allocate `size` bytes aligned to `align`, a power of two.
    fn malloc_aligned(&self, size: Bytes, align: usize) -> Result<NonNull<u8>, AllocError>;

    /// Resize an allocation previously returned by this backend.
    ///
    /// # Safety
    ///
    /// `ptr` must be live and owned by this backend. On success `ptr` is no
    /// longer valid; on failure it is untouched.
    unsafe fn realloc(&self, ptr: NonNull<u8>, size: Bytes) -> Result<NonNull<u8>, AllocError>;

    /// Free an allocation previously returned by this backend.
    ///
    /// # Safety
    ///
    /// `ptr` must be live and owned by this backend.
    unsafe fn free(&self, ptr: NonNull<u8>);

    /// Reserve `size` bytes of fresh memory for an arena.
    fn reserve_arena(&self, size: Bytes) -> Result<NonNull<u8>, AllocError>;

    /// Give an arena's memory back.
    ///
    /// # Safety
    ///
    /// `base` and `size` must describe exactly one earlier `reserve_arena`
    /// result, and nothing may reference that memory afterwards.
    unsafe fn release_arena(&self, base: NonNull<u8>, size: Bytes);
}

unsafe impl<B: Backend + ?Sized> Backend for &B {
    #[inline]
    fn malloc(&self, size: Bytes) -> Result<NonNull<u8>, AllocError> {
        (**self).malloc(size)
    }

    #[inline]
    fn malloc_aligned(&self, size: Bytes, align: usize) -> Result<NonNull<u8>, AllocError> {
        (**self).malloc_aligned(size, align)
    }

    #[inline]
    unsafe fn realloc(&self, ptr: NonNull<u8>, size: Bytes) -> Result<NonNull<u8>, AllocError> {
        (**self).realloc(ptr, size)
    }

    #[inline]
    unsafe fn free(&self, ptr: NonNull<u8>) {
        (**self).free(ptr)
    }

    #[inline]
    fn reserve_arena(&self, size: Bytes) -> Result<NonNull<u8>, AllocError> {
        (**self).reserve_arena(size)
    }

    #[inline]
    unsafe fn release_arena(&self, base: NonNull<u8>, size: Bytes) {
        (**self).release_arena(base, size)
    }
}
