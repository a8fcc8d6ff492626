/*!

`sfalloc`: a **s**egregated-**f**it small-object allocator.

- **Fast for small objects:** Requests of up to 512 bytes are served from
  per-size-class pools in amortized *O(1)*, without touching the
  general-purpose allocator.

- **Gives memory back:** Pools are grouped into arenas, new pools are always
  taken from the fullest arena, and an arena whose pools all become free is
  returned to the operating system.

`sfalloc` is geared towards programs that churn through many short-lived small
objects: parsers, interpreters, message routers. Larger requests, and requests
of zero bytes, are passed straight through to the underlying general-purpose
allocator, so the cost of putting `sfalloc` in front of it is one branch and
one header read.

- [Using `sfalloc` as the Global Allocator](#using-sfalloc-as-the-global-allocator)
- [Using an `Allocator` Directly](#using-an-allocator-directly)
- [`cargo` Features](#cargo-features)
- [Build-time Configuration](#build-time-configuration)
- [Implementation Notes and Constraints](#implementation-notes-and-constraints)
- [License](#license)

## Using `sfalloc` as the Global Allocator

```
// Use `sfalloc` as the global allocator.
#[global_allocator]
static ALLOC: sfalloc::SfAlloc = sfalloc::SfAlloc::INIT;

fn main() {
    let words: Vec<String> = "a few small strings".split(' ').map(String::from).collect();
    assert_eq!(words.len(), 4);
}
```

## Using an `Allocator` Directly

An [`Allocator`] owns all of its state and is driven through `&mut self`, so it
can be embedded anywhere without a lock, and over any [`Backend`]:

```
use sfalloc::{Allocator, OsBackend};

let mut heap = Allocator::new(OsBackend);
let block = heap.allocate(24)?;
let block = unsafe { heap.resize(block.as_ptr(), 100)? };
unsafe { heap.release(block.as_ptr())? };
heap.assert_invariants();
# Ok::<(), sfalloc::AllocError>(())
```

## `cargo` Features

- **extra_assertions**: Enable various extra, expensive integrity assertions and
  defensive mechanisms, such as poisoning freed blocks, checking a cookie in
  every pool header, and detecting double releases. This incurs a large runtime
  overhead. It is useful when debugging a use-after-free or `sfalloc` itself.

- **logging**: Report arena reservations and releases, pool assignments, and
  rejected releases through the [`log`](https://docs.rs/log) facade, under the
  `sfalloc` target. Do not enable this for an `SfAlloc` that is the global
  allocator unless the installed logger never allocates: the allocator's lock
  is held while logging.

## Build-time Configuration

The arena size defaults to 256 KiB. Set the `SFALLOC_ARENA_BYTES` environment
variable when building to change it; it must be a multiple of the pool size
(4 KiB) between 16 KiB and 16 MiB.

## Implementation Notes and Constraints

- Blocks carry no per-block header. Every block is aligned to 8 bytes; larger
  alignments go to the backend.

- A pool is a 4 KiB, 4 KiB-aligned slice of an arena with a small header in
  front. The pool of any block is found by masking the block's address, and the
  header names the owning arena. Deciding whether an arbitrary pointer belongs
  to `sfalloc` or to the backend is an *O(1)* range check.

- Pools are carved from an arena lazily, and blocks from a pool one at a time,
  so memory is not touched until it is about to be handed out.

- Allocation and release are *O(1)*.

- An arena whose pools have all been freed is returned to the operating system
  immediately, unless it is the only arena left with spare pools, in which case
  it stays mapped for the next burst of allocations.

Here is a diagram giving an overview of `sfalloc`'s implementation:

```text
+------------------------------------------------------------------------------+
| Operating System / General-Purpose Allocator (Backend)                       |
+------------------------------------------------------------------------------+
        |           ^                                  |            ^
        | Arenas    | Drained                          | Large &    | Large &
        | (256KiB)  | Arenas                           | Zero-Sized | Zero-Sized
        V           |                                  | Requests   | Releases
+--------------------------------------------+         |            |
| Spare Arena Registry (fewest free first)   |         |            |
|                                            |         |            |
|          +-------+     +-------+           |         |            |
| Head --> | Arena | <-> | Arena | <-> ...   |         |            |
|          +-------+     +-------+           |         |            |
|                                            |         |            |
+--------------------------------------------+         |            |
        |           ^                                  |            |
        | Pools     | Empty                            |            |
        | (4KiB)    | Pools                            |            |
        V           |                                  |            |
+--------------------------------------------+         |            |
| In-Use Pools, one list per size class      |         |            |
|                                            |         |            |
|            +------+     +------+           |         |            |
| Class 8 -> | Pool | <-> | Pool | <-> ...   |         |            |
|            +------+     +------+           |         |            |
| ...                                        |         |            |
|            +------+                        |         |            |
| Class 512->| Pool | <-> ...                |         |            |
|            +------+                        |         |            |
+--------------------------------------------+         |            |
        |           ^                                  |            |
  Small |     Small |                                  |            |
 Blocks |  Releases |                                  |            |
        V           |                                  V            |
+------------------------------------------------------------------------------+
| User Application                                                             |
+------------------------------------------------------------------------------+
```

## License

Licensed under the [Mozilla Public License 2.0](https://www.mozilla.org/en-US/MPL/2.0/).

 */

#![deny(missing_docs)]
#![cfg_attr(not(test), no_std)]

#[macro_use]
mod extra_assert;

#[macro_use]
mod logging;

mod allocator;
mod arena;
mod backend;
pub mod config;
mod const_init;
mod error;
mod pool;
mod size_classes;
mod stats;
mod units;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod imp_unix;
        use imp_unix as imp;
    } else {
        compile_error! {
            "There is no `sfalloc` backend for this target; want to send a pull request? :)"
        }
    }
}

pub use allocator::Allocator;
pub use backend::Backend;
pub use error::AllocError;
pub use imp::OsBackend;
pub use size_classes::{route, Route, SizeClass};
pub use stats::{ClassStats, Stats};
pub use units::Bytes;

use config::ALIGNMENT;
use const_init::ConstInit;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};

/// A process-wide `sfalloc` instance: an [`Allocator`] over the
/// [`OsBackend`], behind a lock.
///
/// # Safety
///
/// Cannot move in memory once used. Typically not an issue if you're just
/// using this as a `static` global allocator.
///
/// The lock is not reentrant. Nothing that runs while it is held may allocate
/// through the same instance; see the "logging" feature.
pub struct SfAlloc {
    inner: imp::Exclusive<Allocator<OsBackend>>,
}

unsafe impl Sync for SfAlloc {}

impl ConstInit for SfAlloc {
    const INIT: SfAlloc = SfAlloc {
        inner: imp::Exclusive::INIT,
    };
}

impl SfAlloc {
    /// An initial `const` default construction of an `SfAlloc` allocator.
    ///
    /// This is usable for initializing `static`s that get set as the global
    /// allocator.
    pub const INIT: Self = <Self as ConstInit>::INIT;

    #[inline]
    fn with_allocator<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&mut Allocator<OsBackend>) -> T,
    {
        unsafe { self.inner.with_exclusive_access(f) }
    }

    /// Allocate `size` bytes. See [`Allocator::allocate`].
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.with_allocator(|a| a.allocate(size))
    }

    /// Release a block. See [`Allocator::release`].
    ///
    /// # Safety
    ///
    /// `ptr` must be null or have been returned by this instance and not
    /// released since.
    pub unsafe fn release(&self, ptr: *mut u8) -> Result<(), AllocError> {
        self.with_allocator(|a| a.release(ptr))
    }

    /// Resize a block. See [`Allocator::resize`].
    ///
    /// # Safety
    ///
    /// The same as for `release`.
    pub unsafe fn resize(&self, ptr: *mut u8, new_size: usize) -> Result<NonNull<u8>, AllocError> {
        self.with_allocator(|a| a.resize(ptr, new_size))
    }

    /// Take a snapshot of the allocator's state.
    pub fn stats(&self) -> Stats {
        self.with_allocator(|a| a.stats())
    }

    /// Check every structural invariant, panicking on the first violation.
    pub fn assert_invariants(&self) {
        self.with_allocator(|a| a.assert_invariants())
    }
}

unsafe impl GlobalAlloc for SfAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let result = if layout.align() > ALIGNMENT.0 {
            self.with_allocator(|a| a.allocate_aligned(layout.size(), layout.align()))
        } else {
            self.allocate(layout.size())
        };
        result.map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let result = self.release(ptr);
        extra_assert!(result.is_ok(), "invalid dealloc of {:p}", ptr);
        // `dealloc` cannot fail. A rejected pointer is logged by the
        // allocator and otherwise ignored; the heap is left unchanged.
        let _ = result;
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= ALIGNMENT.0 {
            return self
                .resize(ptr, new_size)
                .map_or(ptr::null_mut(), NonNull::as_ptr);
        }

        // The backend's `realloc` does not keep over-alignment.
        let new_layout = Layout::from_size_align_unchecked(new_size, layout.align());
        let new = self.alloc(new_layout);
        if !new.is_null() {
            ptr::copy_nonoverlapping(ptr, new, layout.size().min(new_size));
            self.dealloc(ptr, layout);
        }
        new
    }
}
