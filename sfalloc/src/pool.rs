//! Pools: `POOL_SIZE`-aligned regions of an arena, each holding blocks of a
//! single size class behind a small header.
//!
//! A pool is in one of three states:
//!
//! * **Used**: some blocks allocated, some free. The pool is linked into the
//!   in-use list of its size class.
//!
//! * **Full**: no free blocks. The pool is linked into no list at all; a
//!   release brings it back to Used, at the head of its in-use list.
//!
//! * **Empty**: no allocated blocks. The pool is parked on its arena's
//!   free-pool list and its size class is meaningless until it is handed out
//!   again.
//!
//! Blocks are never pre-linked in bulk. Formatting a pool touches its first
//! block only, and each later block is carved off the untouched tail the
//! moment the free list runs dry, so pages are only faulted in when needed.

use crate::config::{ALIGNMENT, POOL_SIZE};
use crate::size_classes::SizeClass;
use crate::units::{align_up, Bytes};
use core::mem;
use core::ptr::{self, NonNull};

/// A free block. Its first word links to the next free block of its pool.
#[repr(C)]
pub(crate) struct FreeBlock {
    next: *mut FreeBlock,
}

/// The header at the start of every carved pool.
#[repr(C)]
pub(crate) struct PoolHeader {
    /// Number of allocated blocks.
    allocated: u32,

    /// The class that `free_head` and the offsets are laid out for, or
    /// `UNFORMATTED` for a pool that has never held blocks.
    size_class: u32,

    /// Head of the singly-linked list of free blocks. Null means Full, or a
    /// pool that has not been formatted yet.
    free_head: *mut FreeBlock,

    /// Links in the in-use list of `size_class` while Used. While Empty,
    /// `next_pool` links the arena's free-pool list instead.
    next_pool: *mut PoolHeader,
    prev_pool: *mut PoolHeader,

    /// Index of the owning arena's record. Read for foreign pointers too, see
    /// `Allocator::owns`.
    arena_index: u32,

    /// Offset of the first never-touched block.
    next_offset: u32,

    /// Largest offset at which a whole block still fits.
    max_next_offset: u32,

    #[cfg(feature = "extra_assertions")]
    cookie: usize,
}

/// Bytes at the start of each pool taken by its header.
pub(crate) const POOL_OVERHEAD: Bytes = Bytes(align_up(mem::size_of::<PoolHeader>(), ALIGNMENT.0));

const _: () = assert!(POOL_OVERHEAD.0 < POOL_SIZE.0 / 2);
const _: () = assert!(POOL_SIZE.0 <= u32::MAX as usize);

#[cfg(feature = "extra_assertions")]
impl PoolHeader {
    // Written into every carved pool header and checked whenever a pointer is
    // resolved to its pool. A mismatch means either a wild pointer was
    // released or the header was scribbled over.
    const COOKIE: usize = 0x5fa1_10c0;

    // Whenever a block goes onto a free list, we write this pattern over
    // everything after its link word.
    //
    // If you see unexpected `0xdbdbdbdb` values, then either (a) you have a
    // use-after-free, or (b) there is a bug in the pool free list handling.
    const FREE_PATTERN: u8 = 0xdb;
}

/// What happened to a pool when a block was taken from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AfterAllocate {
    StillUsed,
    BecameFull,
}

/// What happened to a pool when a block was given back to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AfterRelease {
    StillUsed,
    /// It was Full and is Used again.
    WasFull,
    /// Every block is free now.
    BecameEmpty,
}

/// The pool that `ptr` would belong to, if it is a pool block at all.
#[inline]
pub(crate) fn pool_address(ptr: *const u8) -> *mut PoolHeader {
    (ptr as usize & !(POOL_SIZE.0 - 1)) as *mut PoolHeader
}

impl PoolHeader {
    const UNFORMATTED: u32 = u32::MAX;

    /// Write a fresh, unformatted header at `raw`, which must be the start of
    /// a `POOL_SIZE`-aligned, never-used pool inside arena `arena_index`.
    pub(crate) unsafe fn carve(raw: NonNull<u8>, arena_index: u32) -> NonNull<PoolHeader> {
        extra_assert_eq!(raw.as_ptr() as usize % POOL_SIZE.0, 0);
        let pool = raw.cast::<PoolHeader>();
        ptr::write(
            pool.as_ptr(),
            PoolHeader {
                allocated: 0,
                size_class: Self::UNFORMATTED,
                free_head: ptr::null_mut(),
                next_pool: ptr::null_mut(),
                prev_pool: ptr::null_mut(),
                arena_index,
                next_offset: 0,
                max_next_offset: 0,
                #[cfg(feature = "extra_assertions")]
                cookie: Self::COOKIE,
            },
        );
        pool
    }

    /// Read the arena index of whatever header would sit below `ptr`.
    ///
    /// # Safety
    ///
    /// The pool-aligned address below `ptr` must be readable. Its contents may
    /// be anything, including bytes of a foreign allocation.
    #[inline]
    pub(crate) unsafe fn arena_index_below(ptr: *const u8) -> u32 {
        let pool = pool_address(ptr);
        ptr::read_volatile(ptr::addr_of!((*pool).arena_index))
    }

    #[inline]
    fn base(&self) -> usize {
        self as *const PoolHeader as usize
    }

    #[inline]
    pub(crate) fn arena_index(&self) -> u32 {
        self.arena_index
    }

    #[inline]
    pub(crate) fn allocated(&self) -> usize {
        self.allocated as usize
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.allocated == 0
    }

    #[inline]
    pub(crate) fn is_full(&self) -> bool {
        self.allocated != 0 && self.free_head.is_null()
    }

    /// The class of this pool's blocks. Only meaningful while Used or Full.
    #[inline]
    pub(crate) fn size_class(&self) -> Option<SizeClass> {
        if self.is_empty() {
            None
        } else {
            self.formatted_for()
        }
    }

    /// The class the free list is laid out for, even while Empty.
    #[inline]
    pub(crate) fn formatted_for(&self) -> Option<SizeClass> {
        SizeClass::from_index(self.size_class as usize)
    }

    #[inline]
    pub(crate) fn next_pool(&self) -> *mut PoolHeader {
        self.next_pool
    }

    #[inline]
    pub(crate) fn set_next_pool(&mut self, next: *mut PoolHeader) {
        self.next_pool = next;
    }

    #[inline]
    fn block_size(&self) -> usize {
        (self.size_class as usize + 1) * ALIGNMENT.0
    }

    /// Number of free blocks that are already linked, plus those that have
    /// never been touched. Walks the free list.
    pub(crate) unsafe fn free_blocks(&self) -> usize {
        if self.formatted_for().is_none() {
            return 0;
        }
        let mut linked = 0;
        let mut block = self.free_head;
        while !block.is_null() {
            linked += 1;
            block = (*block).next;
        }
        let untouched = if self.next_offset <= self.max_next_offset {
            (self.max_next_offset - self.next_offset) as usize / self.block_size() + 1
        } else {
            0
        };
        linked + untouched
    }

    /// Lay the pool out for blocks of `class`. Only the first block is
    /// touched; the rest of the pool stays virgin.
    pub(crate) unsafe fn format(&mut self, class: SizeClass) {
        extra_assert!(self.is_empty());
        let size = class.block_size().0;
        self.size_class = class.index() as u32;

        let first = (self.base() + POOL_OVERHEAD.0) as *mut FreeBlock;
        (*first).next = ptr::null_mut();
        write_free_pattern(first, size);
        self.free_head = first;

        self.next_offset = (POOL_OVERHEAD.0 + size) as u32;
        self.max_next_offset = (POOL_SIZE.0 - size) as u32;
    }

    /// Take a block. The pool must not be Full.
    ///
    /// Afterwards a free block is always ready again, carved from the virgin
    /// tail if the free list ran dry, unless the pool just became Full.
    pub(crate) unsafe fn allocate_block(&mut self) -> (NonNull<u8>, AfterAllocate) {
        extra_assert!(!self.free_head.is_null(), "allocating from a full pool");
        let size = self.block_size();

        let block = self.free_head;
        assert_is_poisoned_with_free_pattern(block, size);
        self.free_head = (*block).next;
        self.allocated += 1;
        let block = NonNull::new_unchecked(block as *mut u8);

        if self.free_head.is_null() {
            if self.next_offset > self.max_next_offset {
                return (block, AfterAllocate::BecameFull);
            }
            let fresh = (self.base() + self.next_offset as usize) as *mut FreeBlock;
            (*fresh).next = ptr::null_mut();
            write_free_pattern(fresh, size);
            self.next_offset += size as u32;
            self.free_head = fresh;
        }

        (block, AfterAllocate::StillUsed)
    }

    /// Give a block back. `block` must be a live block of this pool.
    pub(crate) unsafe fn release_block(&mut self, block: NonNull<u8>) -> AfterRelease {
        extra_assert!(self.allocated > 0);
        assert_not_on_free_list(self, block.as_ptr());

        let was_full = self.free_head.is_null();
        let block = block.as_ptr() as *mut FreeBlock;
        (*block).next = self.free_head;
        write_free_pattern(block, self.block_size());
        self.free_head = block;
        self.allocated -= 1;

        if was_full {
            // Capacity is at least two, so one release cannot empty a full pool.
            extra_assert!(self.allocated > 0);
            AfterRelease::WasFull
        } else if self.allocated == 0 {
            AfterRelease::BecameEmpty
        } else {
            AfterRelease::StillUsed
        }
    }

    /// Whether `ptr` is the start of a block that has been handed out of this
    /// pool at some point, i.e. it lies on a block boundary below the virgin
    /// tail.
    pub(crate) fn is_block_boundary(&self, ptr: *const u8) -> bool {
        if self.formatted_for().is_none() {
            return false;
        }
        let offset = (ptr as usize).wrapping_sub(self.base());
        offset >= POOL_OVERHEAD.0
            && offset < self.next_offset as usize
            && (offset - POOL_OVERHEAD.0) % self.block_size() == 0
    }

    /// Check the debug cookie. Always passes without "extra_assertions".
    #[inline]
    pub(crate) fn cookie_is_intact(&self) -> bool {
        #[cfg(feature = "extra_assertions")]
        {
            self.cookie == Self::COOKIE
        }
        #[cfg(not(feature = "extra_assertions"))]
        {
            true
        }
    }
}

extra_only! {
    unsafe fn write_free_pattern(block: *mut FreeBlock, size: usize) {
        let tail = (block as *mut u8).add(mem::size_of::<FreeBlock>());
        ptr::write_bytes(tail, PoolHeader::FREE_PATTERN, size - mem::size_of::<FreeBlock>());
    }
}

extra_only! {
    unsafe fn assert_is_poisoned_with_free_pattern(block: *mut FreeBlock, size: usize) {
        use core::slice;
        let tail = (block as *const u8).add(mem::size_of::<FreeBlock>());
        let tail = slice::from_raw_parts(tail, size - mem::size_of::<FreeBlock>());
        assert!(
            tail.iter().all(|byte| *byte == PoolHeader::FREE_PATTERN),
            "free block {:p} was written to after it was released",
            block
        );
    }
}

extra_only! {
    // O(free blocks in the pool).
    unsafe fn assert_not_on_free_list(pool: &PoolHeader, ptr: *mut u8) {
        let mut block = pool.free_head;
        while !block.is_null() {
            assert!(block as *mut u8 != ptr, "double release of block {:p}", ptr);
            block = (*block).next;
        }
    }
}

/// One list of Used pools per size class, most recently refilled first.
pub(crate) struct UsedPools {
    heads: [*mut PoolHeader; SizeClass::COUNT],
}

impl UsedPools {
    pub(crate) const fn new() -> Self {
        UsedPools {
            heads: [ptr::null_mut(); SizeClass::COUNT],
        }
    }

    #[inline]
    pub(crate) fn head(&self, class: SizeClass) -> Option<NonNull<PoolHeader>> {
        NonNull::new(self.heads[class.index()])
    }

    /// Link a pool in at the head of its class's list.
    pub(crate) unsafe fn push_front(&mut self, class: SizeClass, mut pool: NonNull<PoolHeader>) {
        let head = &mut self.heads[class.index()];
        let p = pool.as_mut();
        p.prev_pool = ptr::null_mut();
        p.next_pool = *head;
        if let Some(old) = head.as_mut() {
            old.prev_pool = pool.as_ptr();
        }
        *head = pool.as_ptr();
    }

    /// Unlink a pool from its class's list.
    pub(crate) unsafe fn unlink(&mut self, class: SizeClass, mut pool: NonNull<PoolHeader>) {
        let p = pool.as_mut();
        match p.prev_pool.as_mut() {
            Some(prev) => prev.next_pool = p.next_pool,
            None => {
                extra_assert_eq!(self.heads[class.index()], pool.as_ptr());
                self.heads[class.index()] = p.next_pool;
            }
        }
        if let Some(next) = p.next_pool.as_mut() {
            next.prev_pool = p.prev_pool;
        }
        p.next_pool = ptr::null_mut();
        p.prev_pool = ptr::null_mut();
    }

    /// Walk the list of `class`.
    ///
    /// # Safety
    ///
    /// The list must not be mutated while the iterator is alive.
    pub(crate) unsafe fn iter(&self, class: SizeClass) -> UsedPoolsIter {
        UsedPoolsIter {
            prev: ptr::null_mut(),
            cur: self.heads[class.index()],
        }
    }
}

pub(crate) struct UsedPoolsIter {
    prev: *mut PoolHeader,
    cur: *mut PoolHeader,
}

impl Iterator for UsedPoolsIter {
    type Item = NonNull<PoolHeader>;

    fn next(&mut self) -> Option<NonNull<PoolHeader>> {
        let pool = NonNull::new(self.cur)?;
        unsafe {
            let p = pool.as_ref();
            assert_eq!(p.prev_pool, self.prev, "in-use list back link is broken");
            self.prev = self.cur;
            self.cur = p.next_pool;
        }
        Some(pool)
    }
}
