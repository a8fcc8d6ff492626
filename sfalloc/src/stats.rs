use crate::size_classes::SizeClass;

/// Per-size-class counters inside a [`Stats`] snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassStats {
    /// Pools of this class that have both allocated and free blocks.
    pub used_pools: usize,
    /// Pools of this class with no free blocks.
    pub full_pools: usize,
    /// Blocks of this class handed out and not yet released.
    pub allocated_blocks: usize,
    /// Free blocks in Used pools of this class, including untouched ones.
    pub free_blocks: usize,
}

/// A point-in-time snapshot of an allocator's state.
///
/// Producing one walks every carved pool, so it is meant for diagnostics and
/// tests rather than hot paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    /// Counters for each size class, indexed by `SizeClass::index`.
    pub classes: [ClassStats; SizeClass::COUNT],

    /// Carved pools parked on their arena's free-pool list.
    pub empty_pools: usize,

    /// Pools not carved yet, summed over every live arena.
    pub uncarved_pools: usize,

    /// Arenas currently mapped.
    pub live_arenas: usize,

    /// The most arenas ever mapped at the same time.
    pub highwater_arenas: usize,

    /// Arenas ever reserved from the backend.
    pub arenas_allocated_total: u64,

    /// Arenas ever given back to the backend.
    pub arenas_reclaimed_total: u64,

    /// Live allocations served by the backend directly.
    pub delegated_blocks: usize,
}

impl Stats {
    pub(crate) fn empty() -> Stats {
        Stats {
            classes: [ClassStats::default(); SizeClass::COUNT],
            empty_pools: 0,
            uncarved_pools: 0,
            live_arenas: 0,
            highwater_arenas: 0,
            arenas_allocated_total: 0,
            arenas_reclaimed_total: 0,
            delegated_blocks: 0,
        }
    }

    /// Counters for one size class.
    #[inline]
    pub fn class(&self, class: SizeClass) -> &ClassStats {
        &self.classes[class.index()]
    }

    /// Pool blocks currently handed out, over all classes.
    pub fn allocated_blocks(&self) -> usize {
        self.classes.iter().map(|c| c.allocated_blocks).sum()
    }

    /// Bytes of pool blocks currently handed out, over all classes.
    pub fn allocated_bytes(&self) -> usize {
        SizeClass::all()
            .map(|class| self.class(class).allocated_blocks * class.block_size().0)
            .sum()
    }

    /// Pools in the Used state, over all classes.
    pub fn used_pools(&self) -> usize {
        self.classes.iter().map(|c| c.used_pools).sum()
    }

    /// Pools in the Full state, over all classes.
    pub fn full_pools(&self) -> usize {
        self.classes.iter().map(|c| c.full_pools).sum()
    }
}
