//! An example of putting `sfalloc` behind a C `malloc`-style interface, so
//! that it can be loaded into a C program as a shared library.

use core::ffi::c_void;
use core::ptr::{self, NonNull};
use sfalloc::SfAlloc;

// One process-wide instance, shared by every caller.
static ALLOC: SfAlloc = SfAlloc::INIT;

fn into_raw(result: Result<NonNull<u8>, sfalloc::AllocError>) -> *mut c_void {
    result.map_or(ptr::null_mut(), |p| p.as_ptr().cast())
}

/// Allocate `size` bytes. Returns null when out of memory.
#[no_mangle]
pub extern "C" fn sf_malloc(size: usize) -> *mut c_void {
    into_raw(ALLOC.allocate(size))
}

/// Allocate and zero `count * size` bytes. Returns null when out of memory
/// or on overflow.
#[no_mangle]
pub extern "C" fn sf_calloc(count: usize, size: usize) -> *mut c_void {
    let total = match count.checked_mul(size) {
        Some(total) => total,
        None => return ptr::null_mut(),
    };
    let p = sf_malloc(total);
    if !p.is_null() {
        unsafe { ptr::write_bytes(p.cast::<u8>(), 0, total) };
    }
    p
}

/// Resize a block from `sf_malloc`. Null behaves like `sf_malloc`. On failure
/// returns null and leaves the block untouched.
///
/// # Safety
///
/// `ptr` must be null or a live block from this library.
#[no_mangle]
pub unsafe extern "C" fn sf_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    into_raw(ALLOC.resize(ptr.cast(), size))
}

/// Free a block from `sf_malloc`. Null is ignored.
///
/// # Safety
///
/// `ptr` must be null or a live block from this library.
#[no_mangle]
pub unsafe extern "C" fn sf_free(ptr: *mut c_void) {
    // C callers have no way to see the error; an invalid pointer is dropped.
    let _ = ALLOC.release(ptr.cast());
}
