use crate::arena::{ArenaIdx, Arenas, PoolReturn};
use crate::backend::Backend;
use crate::config::ALIGNMENT;
use crate::const_init::ConstInit;
use crate::error::AllocError;
use crate::pool::{pool_address, AfterAllocate, AfterRelease, PoolHeader, UsedPools};
use crate::size_classes::{route, Route, SizeClass};
use crate::stats::Stats;
use crate::units::Bytes;
use core::ptr::{self, NonNull};

/// A segregated-fit allocator for small objects.
///
/// Requests of `1..=SMALL_REQUEST_THRESHOLD` bytes are served from pools of
/// equally sized blocks; everything else goes straight to the backend.
///
/// All state lives in this value and every operation takes `&mut self`, so an
/// `Allocator` is single-threaded. Wrap it in a lock to share it, as
/// [`SfAlloc`](crate::SfAlloc) does.
pub struct Allocator<B: Backend> {
    backend: B,
    used: UsedPools,
    arenas: Arenas,
    delegated: usize,
}

impl<B: Backend + ConstInit> ConstInit for Allocator<B> {
    const INIT: Self = Allocator::new(B::INIT);
}

impl<B: Backend> Allocator<B> {
    /// Create an allocator that has not reserved any memory yet.
    pub const fn new(backend: B) -> Self {
        Allocator {
            backend,
            used: UsedPools::new(),
            arenas: Arenas::new(),
            delegated: 0,
        }
    }

    /// The backend this allocator draws memory from.
    #[inline]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Allocate `size` bytes, aligned to `ALIGNMENT`.
    ///
    /// A zero-sized request is passed to the backend as a one-byte request,
    /// so the result is always a unique, releasable address. On failure no
    /// state has changed.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        match route(size) {
            Route::Delegate => self.allocate_delegated(size),
            Route::Pool(class) => unsafe { self.allocate_from_pool(class) },
        }
    }

    /// Allocate `size` bytes aligned to `align`, a power of two.
    ///
    /// Alignments up to `ALIGNMENT` are served like `allocate`. Larger ones
    /// go to the backend, and the result is released through `release` like
    /// any other backend allocation.
    pub fn allocate_aligned(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        if align <= ALIGNMENT.0 {
            return self.allocate(size);
        }
        let ptr = self.backend.malloc_aligned(Bytes(size.max(1)), align)?;
        self.delegated += 1;
        Ok(ptr)
    }

    fn allocate_delegated(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let ptr = self.backend.malloc(Bytes(size.max(1))).map_err(|e| {
            log_warn!("backend refused a {} byte request", size);
            e
        })?;
        self.delegated += 1;
        Ok(ptr)
    }

    unsafe fn allocate_from_pool(&mut self, class: SizeClass) -> Result<NonNull<u8>, AllocError> {
        let mut pool = match self.used.head(class) {
            Some(pool) => pool,
            None => self.refill(class)?,
        };

        let (block, after) = pool.as_mut().allocate_block();
        if after == AfterAllocate::BecameFull {
            self.used.unlink(class, pool);
        }
        Ok(block)
    }

    /// Put a pool for `class` at the head of its in-use list, reserving a new
    /// arena first if no arena has a spare pool.
    unsafe fn refill(&mut self, class: SizeClass) -> Result<NonNull<PoolHeader>, AllocError> {
        if self.arenas.registry_head().is_none() {
            self.arenas.new_arena(&self.backend)?;
        }
        let (arena, mut pool) = match self.arenas.get_spare_pool() {
            Some(spare) => spare,
            None => unreachable!("a fresh arena always has spare pools"),
        };

        if pool.as_ref().formatted_for() != Some(class) {
            pool.as_mut().format(class);
        }
        self.used.push_front(class, pool);
        log_trace!(
            "pool {:p} of arena {} now serves {} byte blocks",
            pool.as_ptr(),
            arena.0,
            class.block_size().0
        );
        Ok(pool)
    }

    /// Whether `ptr` lies inside one of this allocator's arenas. O(1) for
    /// blocks in carved pools; other addresses scan the arena table.
    ///
    /// # Safety
    ///
    /// `ptr` must be null, a live pool block, or a pointer for which the
    /// backend's readability guarantee holds (see [`Backend`]).
    pub unsafe fn owns(&self, ptr: *const u8) -> bool {
        !ptr.is_null() && self.arenas.owner_of(ptr).is_some()
    }

    /// Release a block obtained from `allocate` or `resize`. Null is a no-op.
    ///
    /// Pointers outside every arena are handed to the backend's `free`. A
    /// pointer inside an arena that is not a live block is rejected with
    /// `InvalidRelease`, and nothing changes.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or have been returned by this allocator and not
    /// released since. Releasing a block twice is only caught reliably with
    /// the "extra_assertions" feature.
    pub unsafe fn release(&mut self, ptr: *mut u8) -> Result<(), AllocError> {
        let block = match NonNull::new(ptr) {
            Some(block) => block,
            None => return Ok(()),
        };

        let arena = match self.arenas.owner_of(ptr) {
            Some(arena) => arena,
            None => {
                self.backend.free(block);
                self.delegated = self.delegated.saturating_sub(1);
                return Ok(());
            }
        };

        let mut pool = self.live_block_pool(arena, ptr)?;
        let class = match pool.as_ref().size_class() {
            Some(class) => class,
            None => unreachable!("live blocks are never in empty pools"),
        };

        match pool.as_mut().release_block(block) {
            AfterRelease::StillUsed => {}
            AfterRelease::WasFull => self.used.push_front(class, pool),
            AfterRelease::BecameEmpty => {
                self.used.unlink(class, pool);
                if self.arenas.return_pool(pool, &self.backend) == PoolReturn::ArenaReleased {
                    log_trace!("releasing {:p} drained arena {}", ptr, arena.0);
                }
            }
        }
        Ok(())
    }

    /// Resize a block to hold `new_size` bytes.
    ///
    /// Null behaves like `allocate`. A backend allocation is resized by the
    /// backend. A pool block stays where it is if `new_size` maps to its
    /// current class; otherwise its contents move to a new block and the old
    /// one is released. On failure the original block is untouched.
    ///
    /// # Safety
    ///
    /// The same as for `release`.
    pub unsafe fn resize(&mut self, ptr: *mut u8, new_size: usize) -> Result<NonNull<u8>, AllocError> {
        let block = match NonNull::new(ptr) {
            Some(block) => block,
            None => return self.allocate(new_size),
        };

        let arena = match self.arenas.owner_of(ptr) {
            Some(arena) => arena,
            None => return self.backend.realloc(block, Bytes(new_size.max(1))),
        };

        let pool = self.live_block_pool(arena, ptr)?;
        let old_class = match pool.as_ref().size_class() {
            Some(class) => class,
            None => unreachable!("live blocks are never in empty pools"),
        };
        if route(new_size) == Route::Pool(old_class) {
            return Ok(block);
        }

        let new = self.allocate(new_size)?;
        let len = old_class.block_size().0.min(new_size);
        ptr::copy_nonoverlapping(ptr as *const u8, new.as_ptr(), len);
        self.release(ptr)?;
        Ok(new)
    }

    /// The pool of `ptr`, provided `ptr` is a plausible live block of a
    /// carved, non-empty pool in `arena`.
    unsafe fn live_block_pool(&self, arena: ArenaIdx, ptr: *mut u8) -> Result<NonNull<PoolHeader>, AllocError> {
        let pool = pool_address(ptr);
        let ao = self.arenas.table().get(arena);
        let valid = ao.is_carved(pool as usize) && {
            let p = &*pool;
            p.cookie_is_intact() && p.arena_index() == arena.0 && !p.is_empty() && p.is_block_boundary(ptr)
        };
        if valid {
            Ok(NonNull::new_unchecked(pool))
        } else {
            log_warn!("rejected release of {:p}: not a live block of arena {}", ptr, arena.0);
            Err(AllocError::InvalidRelease)
        }
    }

    /// Take a snapshot of the allocator's state. Walks every carved pool.
    pub fn stats(&self) -> Stats {
        let mut stats = Stats::empty();
        for (_, ao) in self.arenas.table().iter() {
            if ao.is_unused() {
                continue;
            }
            let mut carved = 0;
            for pool in ao.carved_pools() {
                carved += 1;
                let p = unsafe { pool.as_ref() };
                match p.size_class() {
                    None => stats.empty_pools += 1,
                    Some(class) => {
                        let c = &mut stats.classes[class.index()];
                        c.allocated_blocks += p.allocated();
                        if p.is_full() {
                            c.full_pools += 1;
                        } else {
                            c.used_pools += 1;
                            c.free_blocks += unsafe { p.free_blocks() };
                        }
                    }
                }
            }
            stats.uncarved_pools += ao.total_pools() - carved;
        }

        let counters = self.arenas.counters();
        stats.live_arenas = counters.live;
        stats.highwater_arenas = counters.highwater;
        stats.arenas_allocated_total = counters.allocated_total;
        stats.arenas_reclaimed_total = counters.reclaimed_total;
        stats.delegated_blocks = self.delegated;
        stats
    }

    /// Check every structural invariant of the allocator, panicking on the
    /// first violation. Walks every list and every carved pool.
    pub fn assert_invariants(&self) {
        self.arenas.assert_invariants();

        let mut in_use = 0;
        for class in SizeClass::all() {
            for pool in unsafe { self.used.iter(class) } {
                let p = unsafe { pool.as_ref() };
                assert!(p.cookie_is_intact(), "pool {:p} has a clobbered header", pool);
                assert_eq!(
                    p.size_class(),
                    Some(class),
                    "pool {:p} is on the in-use list of the wrong class",
                    pool
                );
                assert!(!p.is_full(), "full pool {:p} is on an in-use list", pool);

                let ao = self.arenas.table().get(ArenaIdx(p.arena_index()));
                assert!(ao.is_carved(pool.as_ptr() as usize));

                let free = unsafe { p.free_blocks() };
                assert_eq!(
                    p.allocated() + free,
                    class.capacity(),
                    "pool {:p} lost track of some blocks",
                    pool
                );

                in_use += 1;
            }
        }

        let stats = self.stats();
        assert_eq!(in_use, stats.used_pools(), "some Used pools are not on an in-use list");
    }
}

impl<B: Backend> Drop for Allocator<B> {
    fn drop(&mut self) {
        unsafe { self.arenas.release_all(&self.backend) };
    }
}
