//! Routing of request sizes to size classes.

use crate::config::{ALIGNMENT, POOL_SIZE, SMALL_REQUEST_THRESHOLD};
use crate::pool::POOL_OVERHEAD;
use crate::units::Bytes;

/// A bucket of block sizes. Class `i` serves requests of
/// `i * ALIGNMENT + 1 ..= (i + 1) * ALIGNMENT` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SizeClass(u8);

/// Where a request of a given size is served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Served by a pool of this class.
    Pool(SizeClass),
    /// Zero-sized or larger than the threshold: handed to the backend.
    Delegate,
}

/// Map a requested size to its size class, or to the delegate.
#[inline]
pub const fn route(size: usize) -> Route {
    if size == 0 || size > SMALL_REQUEST_THRESHOLD.0 {
        return Route::Delegate;
    }
    Route::Pool(SizeClass(((size + ALIGNMENT.0 - 1) / ALIGNMENT.0 - 1) as u8))
}

impl SizeClass {
    /// The number of size classes.
    pub const COUNT: usize = SMALL_REQUEST_THRESHOLD.0 / ALIGNMENT.0;

    /// The largest size class, serving requests of exactly the threshold.
    pub const LARGEST: SizeClass = SizeClass((Self::COUNT - 1) as u8);

    /// Get the class with the given index, if there is one.
    #[inline]
    pub const fn from_index(index: usize) -> Option<SizeClass> {
        if index < Self::COUNT {
            Some(SizeClass(index as u8))
        } else {
            None
        }
    }

    /// This class's position, `0..COUNT`, smallest first.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// The size of every block of this class.
    #[inline]
    pub const fn block_size(self) -> Bytes {
        Bytes((self.0 as usize + 1) * ALIGNMENT.0)
    }

    /// How many blocks of this class fit in one pool.
    #[inline]
    pub const fn capacity(self) -> usize {
        (POOL_SIZE.0 - POOL_OVERHEAD.0) / self.block_size().0
    }

    /// Iterate over every size class, smallest first.
    pub fn all() -> impl Iterator<Item = SizeClass> {
        (0..Self::COUNT).map(|i| SizeClass(i as u8))
    }
}

const _: () = assert!(SizeClass::LARGEST.capacity() >= 2);
