//! Arenas: large regions reserved from the backend and cut into pools.
//!
//! Every arena with at least one free pool sits in the spare registry, a
//! doubly-linked list kept sorted by ascending free-pool count. New pools are
//! always taken from the head, the arena with the *fewest* free pools, so that
//! allocation pressure concentrates there and the arenas at the tail get a
//! chance to drain completely and go back to the operating system.
//!
//! Keeping the list sorted as counts change by one is O(1): for every count
//! `n` we remember the rightmost registry member with `n` free pools, and an
//! arena whose count grows is moved to just after the rightmost member of its
//! old count.

use crate::backend::Backend;
use crate::config::{ARENA_SIZE, INITIAL_ARENA_OBJECTS, MAX_ARENA_TABLE_CHUNKS, MAX_POOLS_IN_ARENA, POOL_SIZE};
use crate::error::AllocError;
use crate::pool::PoolHeader;
use crate::units::{align_up, Bytes, Pools};
use core::mem;
use core::ptr::{self, NonNull};

/// Index of an arena record. Stable for the lifetime of the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct ArenaIdx(pub(crate) u32);

/// Bookkeeping for one arena. The arena's memory itself holds only pools.
pub(crate) struct ArenaObject {
    /// Base of the reserved region, or 0 if this record is unused.
    address: usize,

    /// High-water mark: the first pool that has never been carved.
    pool_address: usize,

    /// Empty pools parked for reuse, linked through their `next_pool`.
    free_pools: *mut PoolHeader,

    /// Parked pools plus pools not carved yet.
    nfree_pools: u32,

    ntotal_pools: u32,

    /// Spare registry links, valid while `nfree_pools > 0`. `next` also links
    /// the list of unused records.
    next: Option<ArenaIdx>,
    prev: Option<ArenaIdx>,
}

impl ArenaObject {
    const UNUSED: ArenaObject = ArenaObject {
        address: 0,
        pool_address: 0,
        free_pools: ptr::null_mut(),
        nfree_pools: 0,
        ntotal_pools: 0,
        next: None,
        prev: None,
    };

    #[inline]
    pub(crate) fn is_unused(&self) -> bool {
        self.address == 0
    }

    #[inline]
    pub(crate) fn free_pools(&self) -> usize {
        self.nfree_pools as usize
    }

    #[inline]
    pub(crate) fn total_pools(&self) -> usize {
        self.ntotal_pools as usize
    }

    /// The first pool-aligned address inside the arena. If the backend handed
    /// out a base that is not pool-aligned, the partial pool in front of it is
    /// never used.
    #[inline]
    fn first_pool(&self) -> usize {
        align_up(self.address, POOL_SIZE.0)
    }

    #[inline]
    pub(crate) fn contains(&self, addr: usize) -> bool {
        !self.is_unused() && addr.wrapping_sub(self.address) < ARENA_SIZE.0
    }

    /// Whether `pool` has been carved out of this arena.
    #[inline]
    pub(crate) fn is_carved(&self, pool: usize) -> bool {
        pool >= self.first_pool() && pool < self.pool_address
    }

    /// Every pool carved so far, parked or not.
    pub(crate) fn carved_pools(&self) -> impl Iterator<Item = NonNull<PoolHeader>> {
        (self.first_pool()..self.pool_address)
            .step_by(POOL_SIZE.0)
            .filter_map(|addr| NonNull::new(addr as *mut PoolHeader))
    }

    /// Hand out a parked pool if there is one, otherwise carve the next pool
    /// at the high-water mark. A parked pool keeps the layout of the class it
    /// last held.
    unsafe fn take_spare_pool(&mut self, idx: ArenaIdx) -> NonNull<PoolHeader> {
        extra_assert!(self.nfree_pools > 0);
        let pool = match NonNull::new(self.free_pools) {
            Some(mut pool) => {
                self.free_pools = pool.as_ref().next_pool();
                pool.as_mut().set_next_pool(ptr::null_mut());
                pool
            }
            None => {
                extra_assert!(self.pool_address + POOL_SIZE.0 <= self.address + ARENA_SIZE.0);
                let raw = NonNull::new_unchecked(self.pool_address as *mut u8);
                self.pool_address += POOL_SIZE.0;
                PoolHeader::carve(raw, idx.0)
            }
        };
        self.nfree_pools -= 1;
        pool
    }

    /// Push an empty pool onto the parked list. The count is maintained by
    /// the caller.
    unsafe fn park_pool(&mut self, mut pool: NonNull<PoolHeader>) {
        extra_assert!(pool.as_ref().is_empty());
        pool.as_mut().set_next_pool(self.free_pools);
        self.free_pools = pool.as_ptr();
    }
}

/// The arena records, in chunks that never move once allocated.
///
/// Pool headers refer to their arena by index, so growing the table must not
/// invalidate any index. Chunk `k` holds `INITIAL_ARENA_OBJECTS << k` records
/// and covers a contiguous range of indices.
pub(crate) struct ArenaTable {
    chunks: [*mut ArenaObject; MAX_ARENA_TABLE_CHUNKS],
    nchunks: usize,
    len: u32,
}

impl ArenaTable {
    const fn new() -> Self {
        ArenaTable {
            chunks: [ptr::null_mut(); MAX_ARENA_TABLE_CHUNKS],
            nchunks: 0,
            len: 0,
        }
    }

    #[inline]
    const fn chunk_len(k: usize) -> usize {
        INITIAL_ARENA_OBJECTS << k
    }

    /// The chunk holding `idx`, and the offset within it.
    #[inline]
    fn locate(idx: ArenaIdx) -> (usize, usize) {
        let q = idx.0 as usize / INITIAL_ARENA_OBJECTS + 1;
        let k = (usize::BITS - 1 - q.leading_zeros()) as usize;
        let start = INITIAL_ARENA_OBJECTS * ((1 << k) - 1);
        (k, idx.0 as usize - start)
    }

    #[inline]
    pub(crate) fn len(&self) -> u32 {
        self.len
    }

    #[inline]
    pub(crate) fn get(&self, idx: ArenaIdx) -> &ArenaObject {
        assert!(idx.0 < self.len, "arena index {} out of bounds", idx.0);
        let (k, i) = Self::locate(idx);
        unsafe { &*self.chunks[k].add(i) }
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, idx: ArenaIdx) -> &mut ArenaObject {
        assert!(idx.0 < self.len, "arena index {} out of bounds", idx.0);
        let (k, i) = Self::locate(idx);
        unsafe { &mut *self.chunks[k].add(i) }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (ArenaIdx, &ArenaObject)> {
        (0..self.len).map(move |i| (ArenaIdx(i), self.get(ArenaIdx(i))))
    }

    /// Add one chunk of unused records and return the first new index.
    fn grow<B: Backend>(&mut self, backend: &B) -> Result<ArenaIdx, AllocError> {
        if self.nchunks == MAX_ARENA_TABLE_CHUNKS {
            return Err(AllocError::ArenaTableGrowth);
        }
        let count = Self::chunk_len(self.nchunks);
        let new_len = self.len as usize + count;
        if new_len > u32::MAX as usize {
            return Err(AllocError::ArenaTableGrowth);
        }

        let bytes = Bytes(count * mem::size_of::<ArenaObject>());
        let chunk = backend
            .malloc(bytes)
            .map_err(|_| AllocError::ArenaTableGrowth)?
            .cast::<ArenaObject>();
        unsafe {
            for i in 0..count {
                ptr::write(chunk.as_ptr().add(i), ArenaObject::UNUSED);
            }
        }
        log_trace!("arena record table grew by {} records to {}", count, new_len);

        self.chunks[self.nchunks] = chunk.as_ptr();
        self.nchunks += 1;
        let first = ArenaIdx(self.len);
        self.len = new_len as u32;
        Ok(first)
    }

    /// Give every chunk back to the backend.
    unsafe fn free_chunks<B: Backend>(&mut self, backend: &B) {
        for chunk in &mut self.chunks[..self.nchunks] {
            if let Some(c) = NonNull::new(*chunk) {
                backend.free(c.cast());
            }
            *chunk = ptr::null_mut();
        }
        self.nchunks = 0;
        self.len = 0;
    }
}

/// What happened to an arena when one of its pools came back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PoolReturn {
    /// The pool was parked; the arena still has pools in use.
    Parked,
    /// Every pool of the arena is free, but it is the last spare arena and
    /// stays mapped for imminent reuse.
    ArenaCached,
    /// Every pool of the arena was free and its memory went back to the
    /// backend.
    ArenaReleased,
}

/// Counters maintained by the arena manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ArenaCounters {
    pub(crate) live: usize,
    pub(crate) highwater: usize,
    pub(crate) allocated_total: u64,
    pub(crate) reclaimed_total: u64,
}

/// All arena records plus the spare registry and the unused-record list.
pub(crate) struct Arenas {
    table: ArenaTable,

    /// Records without memory, singly linked through `next`.
    unused: Option<ArenaIdx>,

    /// Head of the spare registry: the arena with the fewest free pools.
    usable: Option<ArenaIdx>,

    /// For each free-pool count, the rightmost registry member with exactly
    /// that count.
    last_with_free: [Option<ArenaIdx>; MAX_POOLS_IN_ARENA + 1],

    counters: ArenaCounters,
}

impl Arenas {
    pub(crate) const fn new() -> Self {
        Arenas {
            table: ArenaTable::new(),
            unused: None,
            usable: None,
            last_with_free: [None; MAX_POOLS_IN_ARENA + 1],
            counters: ArenaCounters {
                live: 0,
                highwater: 0,
                allocated_total: 0,
                reclaimed_total: 0,
            },
        }
    }

    #[inline]
    pub(crate) fn table(&self) -> &ArenaTable {
        &self.table
    }

    #[inline]
    pub(crate) fn counters(&self) -> ArenaCounters {
        self.counters
    }

    #[inline]
    pub(crate) fn registry_head(&self) -> Option<ArenaIdx> {
        self.usable
    }

    /// Walk the spare registry from the head.
    pub(crate) fn registry(&self) -> impl Iterator<Item = ArenaIdx> + '_ {
        let mut cur = self.usable;
        let mut steps = 0;
        core::iter::from_fn(move || {
            let idx = cur?;
            steps += 1;
            assert!(steps <= self.table.len(), "spare registry has a cycle");
            cur = self.table.get(idx).next;
            Some(idx)
        })
    }

    /// The live arena whose range holds `ptr`, if any.
    ///
    /// Pointers into carved pools are resolved in O(1) through the pool
    /// header. Anything else costs a scan over the record table, since a
    /// never-carved pool has a zeroed header that names arena 0.
    ///
    /// # Safety
    ///
    /// The pool-aligned address below `ptr` must be readable (see `Backend`).
    #[inline]
    pub(crate) unsafe fn owner_of(&self, ptr: *const u8) -> Option<ArenaIdx> {
        if self.counters.live == 0 {
            return None;
        }
        let addr = ptr as usize;
        let idx = PoolHeader::arena_index_below(ptr);
        if idx < self.table.len() && self.table.get(ArenaIdx(idx)).contains(addr) {
            return Some(ArenaIdx(idx));
        }
        self.containing(addr)
    }

    #[cold]
    fn containing(&self, addr: usize) -> Option<ArenaIdx> {
        self.table
            .iter()
            .find(|(_, ao)| ao.contains(addr))
            .map(|(idx, _)| idx)
    }

    /// Reserve a new arena and make it the only member of the (empty) spare
    /// registry. On failure nothing has changed.
    pub(crate) fn new_arena<B: Backend>(&mut self, backend: &B) -> Result<ArenaIdx, AllocError> {
        extra_assert!(self.usable.is_none());

        let base = backend.reserve_arena(ARENA_SIZE).map_err(|e| {
            log_warn!("backend refused a {} byte arena", ARENA_SIZE.0);
            e
        })?;

        if self.unused.is_none() {
            match self.table.grow(backend) {
                Ok(first) => self.link_unused_range(first),
                Err(e) => {
                    log_warn!("could not grow the arena record table past {} records", self.table.len());
                    unsafe { backend.release_arena(base, ARENA_SIZE) };
                    return Err(e);
                }
            }
        }

        let idx = match self.unused {
            Some(idx) => idx,
            None => unreachable!("the record table just grew"),
        };
        let ao = self.table.get_mut(idx);
        self.unused = ao.next;

        let address = base.as_ptr() as usize;
        let first_pool = align_up(address, POOL_SIZE.0);
        let ntotal = (Bytes(address) + ARENA_SIZE - Bytes(first_pool)).whole_pools().0 as u32;
        *ao = ArenaObject {
            address,
            pool_address: first_pool,
            free_pools: ptr::null_mut(),
            nfree_pools: ntotal,
            ntotal_pools: ntotal,
            next: None,
            prev: None,
        };

        self.usable = Some(idx);
        self.last_with_free[ntotal as usize] = Some(idx);

        self.counters.live += 1;
        self.counters.allocated_total += 1;
        self.counters.highwater = self.counters.highwater.max(self.counters.live);
        log_debug!(
            "arena {} reserved at {:#x} with {} pools ({} live)",
            idx.0,
            address,
            ntotal,
            self.counters.live
        );
        Ok(idx)
    }

    /// Chain freshly grown records onto the unused list, lowest index first.
    fn link_unused_range(&mut self, first: ArenaIdx) {
        extra_assert!(self.unused.is_none());
        let end = self.table.len();
        for i in first.0..end {
            let next = if i + 1 < end { Some(ArenaIdx(i + 1)) } else { None };
            self.table.get_mut(ArenaIdx(i)).next = next;
        }
        self.unused = Some(first);
    }

    /// Take a pool from the arena at the head of the spare registry. Returns
    /// `None` if the registry is empty.
    pub(crate) unsafe fn get_spare_pool(&mut self) -> Option<(ArenaIdx, NonNull<PoolHeader>)> {
        let idx = self.usable?;
        let nf = self.table.get(idx).free_pools();
        extra_assert!(nf > 0);

        if self.last_with_free[nf] == Some(idx) {
            // It was the only one with this count.
            self.last_with_free[nf] = None;
        }
        if nf > 1 {
            // The head has the fewest free pools, so nobody else has `nf - 1`.
            extra_assert!(self.last_with_free[nf - 1].is_none());
            self.last_with_free[nf - 1] = Some(idx);
        }

        let pool = self.table.get_mut(idx).take_spare_pool(idx);

        if self.table.get(idx).nfree_pools == 0 {
            self.unlink(idx);
        }
        Some((idx, pool))
    }

    /// Park an empty pool on its arena and move the arena to its new place
    /// in the spare registry, releasing the arena if it is entirely free.
    pub(crate) unsafe fn return_pool<B: Backend>(&mut self, pool: NonNull<PoolHeader>, backend: &B) -> PoolReturn {
        let idx = ArenaIdx(pool.as_ref().arena_index());
        let nf = {
            let ao = self.table.get_mut(idx);
            ao.park_pool(pool);
            ao.free_pools()
        };

        // The rightmost arena with the old count; `idx` moves just after it.
        let lastnf = self.last_with_free[nf];
        if lastnf == Some(idx) {
            let prev = self.table.get(idx).prev;
            self.last_with_free[nf] = prev.filter(|&p| self.table.get(p).free_pools() == nf);
        }

        let nf = nf + 1;
        let (total, next) = {
            let ao = self.table.get_mut(idx);
            ao.nfree_pools = nf as u32;
            (ao.total_pools(), ao.next)
        };

        if nf == total && next.is_some() {
            // Entirely free, and there is another spare arena behind it.
            self.release_arena(idx, backend);
            return PoolReturn::ArenaReleased;
        }

        if nf == 1 {
            // It was not in the registry at all, and now has the fewest
            // free pools of anybody.
            self.push_front(idx);
            if self.last_with_free[1].is_none() {
                self.last_with_free[1] = Some(idx);
            }
        } else {
            if self.last_with_free[nf].is_none() {
                self.last_with_free[nf] = Some(idx);
            }
            if lastnf != Some(idx) {
                let after = match lastnf {
                    Some(after) => after,
                    None => unreachable!("arena {} had {} free pools but was not indexed", idx.0, nf - 1),
                };
                self.unlink(idx);
                self.insert_after(idx, after);
            }
        }

        if nf == total {
            log_debug!("arena {} is entirely free and stays cached", idx.0);
            PoolReturn::ArenaCached
        } else {
            PoolReturn::Parked
        }
    }

    /// Unlink an entirely free arena from the registry, recycle its record
    /// and give its memory back.
    unsafe fn release_arena<B: Backend>(&mut self, idx: ArenaIdx, backend: &B) {
        extra_assert_eq!(self.table.get(idx).free_pools(), self.table.get(idx).total_pools());
        self.unlink(idx);

        let unused = self.unused;
        let ao = self.table.get_mut(idx);
        let address = ao.address;
        *ao = ArenaObject::UNUSED;
        ao.next = unused;
        self.unused = Some(idx);

        backend.release_arena(NonNull::new_unchecked(address as *mut u8), ARENA_SIZE);
        self.counters.live -= 1;
        self.counters.reclaimed_total += 1;
        log_debug!(
            "arena {} at {:#x} released ({} live)",
            idx.0,
            address,
            self.counters.live
        );
    }

    /// Give every live arena and every record chunk back to the backend.
    pub(crate) unsafe fn release_all<B: Backend>(&mut self, backend: &B) {
        for i in 0..self.table.len() {
            let address = self.table.get(ArenaIdx(i)).address;
            if let Some(base) = NonNull::new(address as *mut u8) {
                backend.release_arena(base, ARENA_SIZE);
                self.counters.reclaimed_total += 1;
            }
        }
        self.table.free_chunks(backend);
        self.unused = None;
        self.usable = None;
        self.last_with_free = [None; MAX_POOLS_IN_ARENA + 1];
        self.counters.live = 0;
    }

    fn push_front(&mut self, idx: ArenaIdx) {
        let head = self.usable;
        {
            let ao = self.table.get_mut(idx);
            ao.next = head;
            ao.prev = None;
        }
        if let Some(h) = head {
            self.table.get_mut(h).prev = Some(idx);
        }
        self.usable = Some(idx);
    }

    fn unlink(&mut self, idx: ArenaIdx) {
        let (prev, next) = {
            let ao = self.table.get(idx);
            (ao.prev, ao.next)
        };
        match prev {
            Some(p) => self.table.get_mut(p).next = next,
            None => {
                extra_assert_eq!(self.usable, Some(idx));
                self.usable = next;
            }
        }
        if let Some(n) = next {
            self.table.get_mut(n).prev = prev;
        }
        let ao = self.table.get_mut(idx);
        ao.next = None;
        ao.prev = None;
    }

    fn insert_after(&mut self, idx: ArenaIdx, after: ArenaIdx) {
        let next = self.table.get(after).next;
        {
            let ao = self.table.get_mut(idx);
            ao.prev = Some(after);
            ao.next = next;
        }
        if let Some(n) = next {
            self.table.get_mut(n).prev = Some(idx);
        }
        self.table.get_mut(after).next = Some(idx);
    }

    /// Check the arena-level invariants, panicking on the first violation.
    pub(crate) fn assert_invariants(&self) {
        // The registry: sorted, linked both ways, and indexed.
        let mut prev: Option<ArenaIdx> = None;
        let mut prev_nf = 0;
        let mut in_registry = 0;
        for idx in self.registry() {
            let ao = self.table.get(idx);
            assert!(!ao.is_unused(), "arena {} in the spare registry has no memory", idx.0);
            assert!(ao.nfree_pools >= 1, "arena {} in the spare registry has no free pools", idx.0);
            assert!(
                ao.free_pools() >= prev_nf,
                "spare registry is not sorted at arena {} ({} < {})",
                idx.0,
                ao.free_pools(),
                prev_nf
            );
            assert_eq!(ao.prev, prev, "arena {} has a broken back link", idx.0);

            let next_nf = ao.next.map(|n| self.table.get(n).free_pools());
            if next_nf != Some(ao.free_pools()) {
                assert_eq!(
                    self.last_with_free[ao.free_pools()],
                    Some(idx),
                    "arena {} is the rightmost with {} free pools but is not indexed",
                    idx.0,
                    ao.free_pools()
                );
            }

            prev = Some(idx);
            prev_nf = ao.free_pools();
            in_registry += 1;
        }

        for (n, entry) in self.last_with_free.iter().enumerate() {
            if let Some(idx) = entry {
                let ao = self.table.get(*idx);
                assert!(!ao.is_unused());
                assert_eq!(ao.free_pools(), n, "stale rightmost index for {} free pools", n);
            }
        }

        // The unused list holds exactly the records without memory.
        let mut unused = 0;
        let mut cur = self.unused;
        while let Some(idx) = cur {
            let ao = self.table.get(idx);
            assert!(ao.is_unused(), "arena {} is on the unused list but has memory", idx.0);
            unused += 1;
            assert!(unused <= self.table.len(), "unused arena list has a cycle");
            cur = ao.next;
        }

        let mut live = 0;
        let mut with_spare = 0;
        for (idx, ao) in self.table.iter() {
            if ao.is_unused() {
                unused -= 1;
                continue;
            }
            live += 1;
            if ao.nfree_pools > 0 {
                with_spare += 1;
            }
            assert!(ao.nfree_pools <= ao.ntotal_pools);

            // Free pools are the parked ones plus the uncarved tail.
            let end = Bytes(ao.first_pool()) + Pools(ao.total_pools());
            let uncarved = (end - Bytes(ao.pool_address)).whole_pools().0;
            let mut parked = 0;
            let mut pool = ao.free_pools;
            while let Some(p) = unsafe { pool.as_ref() } {
                assert!(p.is_empty(), "parked pool {:p} still has blocks", pool);
                assert_eq!(p.arena_index(), idx.0);
                assert!(ao.is_carved(pool as usize));
                parked += 1;
                assert!(parked <= ao.total_pools(), "free pool list of arena {} has a cycle", idx.0);
                pool = p.next_pool();
            }
            assert_eq!(
                ao.free_pools(),
                parked + uncarved,
                "arena {} miscounts its free pools",
                idx.0
            );
        }
        assert_eq!(unused, 0, "some unused records are missing from the unused list");
        assert_eq!(live, self.counters.live);
        assert_eq!(
            with_spare, in_registry,
            "every arena with free pools is in the spare registry, and no other"
        );
    }
}
