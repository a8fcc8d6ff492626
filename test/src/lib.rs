use quickcheck::{Arbitrary, Gen};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sfalloc::{Allocator, Backend, OsBackend, SfAlloc};
use std::collections::HashSet;
use std::ptr::{self, NonNull};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    // Allocate this many bytes.
    Alloc(usize),

    // Free the n^th allocation we've made, or no-op if it has already been
    // freed.
    Free(usize),

    // Resize the n^th allocation we've made to this many bytes, or no-op if
    // it has already been freed.
    Realloc(usize, usize),
}

pub use Operation::*;

const SMALL_REQUEST_THRESHOLD: usize = sfalloc::config::SMALL_REQUEST_THRESHOLD.0;

impl Operation {
    fn arbitrary_size(rng: &mut StdRng) -> usize {
        // Zero sized allocation 1/1000 times.
        if rng.gen_bool(1.0 / 1000.0) {
            return 0;
        }

        // Do a large allocation with probability P = 1/20.
        if rng.gen_bool(1.0 / 20.0) {
            return rng.gen_range(1..10) * SMALL_REQUEST_THRESHOLD + rng.gen_range(1..SMALL_REQUEST_THRESHOLD);
        }

        // Small allocation, concentrated on a few classes half of the time.
        if rng.gen() {
            rng.gen_range(12..33)
        } else {
            rng.gen_range(1..=SMALL_REQUEST_THRESHOLD)
        }
    }

    #[inline]
    fn arbitrary_alloc(rng: &mut StdRng, active_allocs: &mut Vec<usize>, num_allocs: &mut usize) -> Self {
        active_allocs.push(*num_allocs);
        *num_allocs += 1;
        Alloc(Self::arbitrary_size(rng))
    }

    #[inline]
    fn arbitrary_free(rng: &mut StdRng, active_allocs: &mut Vec<usize>) -> Self {
        assert!(!active_allocs.is_empty());
        let i = rng.gen_range(0..active_allocs.len());
        Free(active_allocs.swap_remove(i))
    }

    #[inline]
    fn arbitrary_realloc(rng: &mut StdRng, active_allocs: &[usize]) -> Self {
        assert!(!active_allocs.is_empty());
        let i = rng.gen_range(0..active_allocs.len());
        Realloc(active_allocs[i], Self::arbitrary_size(rng))
    }

    /// This operation with every reference to allocation `i` removed, and
    /// later allocations renumbered.
    fn without_alloc(self, i: usize) -> Option<Self> {
        let renumber = |k: usize| if k > i { k - 1 } else { k };
        match self {
            Alloc(n) => Some(Alloc(n)),
            Free(k) | Realloc(k, _) if k == i => None,
            Free(k) => Some(Free(renumber(k))),
            Realloc(k, n) => Some(Realloc(renumber(k), n)),
        }
    }
}

fn parse_args(s: &str, prefix: &str) -> Option<Vec<usize>> {
    let args = s.strip_prefix(prefix)?.strip_suffix("),")?;
    args.split(',').map(|a| a.trim().parse().ok()).collect()
}

impl FromStr for Operation {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        let s = s.trim();
        if let Some(args) = parse_args(s, "Alloc(") {
            if let [n] = args[..] {
                return Ok(Alloc(n));
            }
        }
        if let Some(args) = parse_args(s, "Free(") {
            if let [idx] = args[..] {
                return Ok(Free(idx));
            }
        }
        if let Some(args) = parse_args(s, "Realloc(") {
            if let [idx, n] = args[..] {
                return Ok(Realloc(idx, n));
            }
        }
        Err(())
    }
}

#[derive(Debug, Clone)]
pub struct Operations(pub Vec<Operation>);

impl FromStr for Operations {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        let mut ops = vec![];
        for line in s.lines().filter(|l| !l.trim().is_empty()) {
            ops.push(line.parse()?);
        }
        Ok(Operations(ops))
    }
}

#[cfg(feature = "extra_assertions")]
const NUM_OPERATIONS: usize = 1_000;

#[cfg(not(feature = "extra_assertions"))]
const NUM_OPERATIONS: usize = 5_000;

impl Arbitrary for Operations {
    #[inline(never)]
    fn arbitrary(g: &mut Gen) -> Self {
        // Generating straight from `Gen` is slow; seed a faster RNG from it.
        let mut rng = StdRng::seed_from_u64(u64::arbitrary(g));
        let rng = &mut rng;

        let mut num_allocs = 0;
        let mut active_allocs = vec![];
        let mut operations = Vec::with_capacity(NUM_OPERATIONS);

        for _ in 0..NUM_OPERATIONS {
            // Free with P = 1/4 so that we exercise more pool refilling code
            // paths due to the higher rates of allocation.
            if !active_allocs.is_empty() && rng.gen_bool(0.25) {
                operations.push(Operation::arbitrary_free(rng, &mut active_allocs));
            } else if !active_allocs.is_empty() && rng.gen_bool(0.1) {
                operations.push(Operation::arbitrary_realloc(rng, &active_allocs));
            } else {
                operations.push(Operation::arbitrary_alloc(rng, &mut active_allocs, &mut num_allocs));
            }
        }

        operations.reserve_exact(active_allocs.len());
        while !active_allocs.is_empty() {
            operations.push(Operation::arbitrary_free(rng, &mut active_allocs));
        }

        Operations(operations)
    }

    #[inline(never)]
    fn shrink(&self) -> Box<dyn Iterator<Item = Self>> {
        let ops = self.0.clone();
        let prefixes = (0..self.0.len()).map(move |i| Operations(ops[..i].to_vec()));

        let indices_of = |pred: fn(&Operation) -> bool| -> Vec<usize> {
            self.0
                .iter()
                .enumerate()
                .filter_map(|(i, op)| if pred(op) { Some(i) } else { None })
                .collect()
        };

        let ops = self.0.clone();
        let without_frees = indices_of(|op| !matches!(op, Alloc(_))).into_iter().map(move |i| {
            Operations(
                ops.iter()
                    .enumerate()
                    .filter_map(|(j, op)| if i == j { None } else { Some(*op) })
                    .collect(),
            )
        });

        let alloc_indices = indices_of(|op| matches!(op, Alloc(_)));

        // The n^th `Alloc` is allocation number n.
        let ops = self.0.clone();
        let without_allocs = alloc_indices.clone().into_iter().enumerate().map(move |(n, i)| {
            Operations(
                ops.iter()
                    .enumerate()
                    .filter_map(|(j, op)| if i == j { None } else { op.without_alloc(n) })
                    .collect(),
            )
        });

        let ops = self.0.clone();
        let smaller_allocs = alloc_indices.into_iter().filter_map(move |i| match ops[i] {
            Alloc(size) if size > 0 => {
                let mut ops = ops.clone();
                ops[i] = Alloc(size / 2);
                Some(Operations(ops))
            }
            _ => None,
        });

        Box::new(
            prefixes
                .chain(without_frees)
                .chain(without_allocs)
                .chain(smaller_allocs),
        )
    }
}

/// The allocator under test, as seen by the operation runner.
pub trait Heap {
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>>;
    unsafe fn release(&mut self, ptr: NonNull<u8>);
    unsafe fn resize(&mut self, ptr: NonNull<u8>, new_size: usize) -> Option<NonNull<u8>>;
    fn check(&mut self);
}

impl<B: Backend> Heap for Allocator<B> {
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        Allocator::allocate(self, size).ok()
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>) {
        Allocator::release(self, ptr.as_ptr()).expect("releasing a live block should succeed");
    }

    unsafe fn resize(&mut self, ptr: NonNull<u8>, new_size: usize) -> Option<NonNull<u8>> {
        Allocator::resize(self, ptr.as_ptr(), new_size).ok()
    }

    fn check(&mut self) {
        self.assert_invariants();
    }
}

impl Heap for &'static SfAlloc {
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        SfAlloc::allocate(self, size).ok()
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>) {
        SfAlloc::release(self, ptr.as_ptr()).expect("releasing a live block should succeed");
    }

    unsafe fn resize(&mut self, ptr: NonNull<u8>, new_size: usize) -> Option<NonNull<u8>> {
        SfAlloc::resize(self, ptr.as_ptr(), new_size).ok()
    }

    fn check(&mut self) {
        self.assert_invariants();
    }
}

/// A live allocation, filled with a byte pattern unique to it.
#[derive(Debug, Clone, Copy)]
struct Live {
    ptr: NonNull<u8>,
    size: usize,
    pattern: u8,
}

impl Live {
    unsafe fn fill(&self) {
        ptr::write_bytes(self.ptr.as_ptr(), self.pattern, self.size);
    }

    unsafe fn verify(&self, len: usize) {
        let bytes = std::slice::from_raw_parts(self.ptr.as_ptr(), len.min(self.size));
        if let Some(i) = bytes.iter().position(|b| *b != self.pattern) {
            panic!(
                "byte {} of the {} byte block at {:p} is {:#x}, expected {:#x}",
                i, self.size, self.ptr, bytes[i], self.pattern
            );
        }
    }
}

impl Operations {
    pub fn run_single_threaded(&self) {
        let mut heap = Allocator::new(OsBackend);
        self.run_with_heap(&mut heap, true);

        let stats = heap.stats();
        assert_eq!(stats.allocated_blocks(), 0);
        assert_eq!(stats.delegated_blocks, 0);
        assert!(
            stats.live_arenas <= 1,
            "only the last spare arena may stay mapped once everything is freed, found {}",
            stats.live_arenas
        );
    }

    pub fn run_multi_threaded(ops0: Self, ops1: Self, ops2: Self, ops3: Self) {
        use std::thread;

        static SF: SfAlloc = SfAlloc::INIT;

        let handle0 = thread::spawn(move || ops0.run_with_heap(&mut &SF, true));
        let handle1 = thread::spawn(move || ops1.run_with_heap(&mut &SF, true));
        let handle2 = thread::spawn(move || ops2.run_with_heap(&mut &SF, true));
        let handle3 = thread::spawn(move || ops3.run_with_heap(&mut &SF, true));

        handle0.join().expect("Thread 0 Failed");
        handle1.join().expect("Thread 1 Failed");
        handle2.join().expect("Thread 2 Failed");
        handle3.join().expect("Thread 3 Failed");
    }

    /// Run the operations, checking that no live block is ever handed out
    /// twice and that every block keeps its contents. With `check`, the
    /// heap's invariants are verified after every operation. Allocations
    /// still live at the end are freed.
    pub fn run_with_heap<H: Heap>(&self, heap: &mut H, check: bool) {
        let mut allocs: Vec<Option<Live>> = vec![];
        let mut live = HashSet::new();

        for op in self.0.iter().cloned() {
            match op {
                Alloc(n) => {
                    let pattern = allocs.len() as u8;
                    allocs.push(heap.allocate(n).map(|ptr| {
                        assert!(live.insert(ptr), "{:p} was handed out while still live", ptr);
                        let block = Live { ptr, size: n, pattern };
                        unsafe { block.fill() };
                        block
                    }));
                }
                Free(idx) => {
                    if let Some(block) = allocs.get_mut(idx).and_then(Option::take) {
                        unsafe {
                            block.verify(block.size);
                            heap.release(block.ptr);
                        }
                        live.remove(&block.ptr);
                    }
                }
                Realloc(idx, n) => {
                    if let Some(entry) = allocs.get_mut(idx) {
                        if let Some(block) = *entry {
                            unsafe {
                                block.verify(block.size);
                                if let Some(ptr) = heap.resize(block.ptr, n) {
                                    live.remove(&block.ptr);
                                    assert!(live.insert(ptr), "{:p} was handed out while still live", ptr);
                                    let moved = Live { ptr, size: n, ..block };
                                    moved.verify(block.size);
                                    moved.fill();
                                    *entry = Some(moved);
                                }
                            }
                        }
                    }
                }
            }
            if check {
                heap.check();
            }
        }

        // Shrunk operation lists may not free everything.
        for block in allocs.into_iter().flatten() {
            unsafe {
                block.verify(block.size);
                heap.release(block.ptr);
            }
        }
        if check {
            heap.check();
        }
    }

    const NUM_BUCKETS: u64 = 20;

    pub fn size_histogram(&self) -> histo::Histogram {
        let mut histogram = histo::Histogram::with_buckets(Self::NUM_BUCKETS);
        for op in &self.0 {
            if let Alloc(n) | Realloc(_, n) = *op {
                let n = n as f64;
                let n = n.log2().round();
                histogram.add(n as u64);
            }
        }
        histogram
    }

    pub fn lifetime_histogram(&self) -> histo::Histogram {
        let mut histogram = histo::Histogram::with_buckets(Self::NUM_BUCKETS);
        let alloc_positions: Vec<usize> = self
            .0
            .iter()
            .enumerate()
            .filter_map(|(i, op)| if let Alloc(_) = op { Some(i) } else { None })
            .collect();
        for (i, op) in self.0.iter().enumerate() {
            if let Free(n) = *op {
                if let Some(j) = alloc_positions.get(n) {
                    histogram.add((i - j) as u64);
                }
            }
        }
        histogram
    }
}

////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use cfg_if::cfg_if;
    use quickcheck::{quickcheck, QuickCheck};
    use std::alloc::{GlobalAlloc, Layout};
    use std::iter;
    use std::mem;

    macro_rules! run_quickchecks {
        ($name:ident) => {
            #[test]
            fn $name() {
                fn single_threaded(ops: Operations) {
                    ops.run_single_threaded();
                }

                QuickCheck::new()
                    .tests(1)
                    .quickcheck(single_threaded as fn(Operations) -> ());
            }
        };
    }

    // Let the test harness run each of our single threaded quickchecks
    // concurrently with each other.
    run_quickchecks!(quickchecks_0);
    run_quickchecks!(quickchecks_1);
    // Extra assertions make every operation expensive; run fewer.
    cfg_if! {
        if #[cfg(not(feature = "extra_assertions"))] {
            run_quickchecks!(quickchecks_2);
            run_quickchecks!(quickchecks_3);
            run_quickchecks!(quickchecks_4);
            run_quickchecks!(quickchecks_5);
        }
    }

    #[test]
    fn multi_threaded_quickchecks() {
        QuickCheck::new().tests(1).quickcheck(
            Operations::run_multi_threaded as fn(Operations, Operations, Operations, Operations) -> (),
        );
    }

    static ALIGNS: [usize; 10] = [1, 2, 4, 8, 16, 32, 64, 128, 256, 512];

    static GLOBAL: SfAlloc = SfAlloc::INIT;

    quickcheck! {
        fn single_allocation_with_size_and_align(size: usize, align: usize) -> () {
            let size = size % 65536;
            let align = ALIGNS[align % ALIGNS.len()];

            let layout = Layout::from_size_align(size, align).unwrap();
            unsafe {
                let p = GLOBAL.alloc(layout);
                assert!(!p.is_null());
                assert_eq!(p as usize % align, 0);
                GLOBAL.dealloc(p, layout);
            }
        }
    }

    ////////////////////////////////////////////////////////////////////////////

    #[test]
    fn parse_operations() {
        let ops: Operations = "Alloc(16),\nAlloc(600),\nRealloc(0, 40),\nFree(1),\nFree(0),\n"
            .parse()
            .unwrap();
        assert_eq!(ops.0, vec![Alloc(16), Alloc(600), Realloc(0, 40), Free(1), Free(0)]);
        assert!("Alloc(x),".parse::<Operation>().is_err());
        ops.run_single_threaded();
    }

    #[test]
    fn shrinking_renumbers_allocations() {
        let ops = Operations(vec![Alloc(8), Alloc(16), Realloc(1, 24), Free(0), Free(1)]);
        let shrunk: Vec<_> = ops.shrink().collect();
        assert!(shrunk
            .iter()
            .any(|s| s.0 == vec![Alloc(16), Realloc(0, 24), Free(0)]));
        for s in shrunk {
            s.run_single_threaded();
        }
    }

    #[test]
    fn regression_test_0() {
        Operations(vec![Alloc(1)]).run_single_threaded();
    }

    #[test]
    fn first_class_edge() {
        // 8 is the last size of the first class, 9 the first of the second.
        Operations(vec![
            Alloc(8),
            Alloc(9),
            Free(0),
            Alloc(8),
            Realloc(1, 8),
            Realloc(2, 9),
            Free(1),
            Free(2),
        ])
        .run_single_threaded();
    }

    #[test]
    fn pool_threshold_edge() {
        // 512 is the largest pooled size; 513 goes to the backend.
        Operations(vec![
            Alloc(512),
            Alloc(513),
            Free(0),
            Alloc(512),
            Realloc(1, 512),
            Realloc(2, 513),
            Free(1),
            Alloc(513),
            Free(2),
            Free(3),
        ])
        .run_single_threaded();
    }

    #[test]
    fn regression_test_3() {
        Operations(vec![Alloc(512), Realloc(0, 513), Realloc(0, 8), Realloc(0, 0), Free(0)])
            .run_single_threaded();
    }

    #[test]
    fn allocate_size_zero() {
        Operations(
            iter::repeat(Alloc(0))
                .take(1000)
                .chain((0..1000).map(Free))
                .collect(),
        )
        .run_single_threaded();
    }

    #[test]
    fn allocate_many_small() {
        Operations(
            iter::repeat(Alloc(16 * mem::size_of::<usize>()))
                .take(100)
                .chain((0..100).map(Free))
                .chain(iter::repeat(Alloc(SMALL_REQUEST_THRESHOLD)).take(100))
                .chain((0..100).map(|i| Free(i + 100)))
                .collect(),
        )
        .run_single_threaded();
    }

    #[test]
    fn allocate_many_large() {
        Operations(
            iter::repeat(Alloc(SMALL_REQUEST_THRESHOLD + 1))
                .take(100)
                .chain((0..100).map(Free))
                .chain(iter::repeat(Alloc(1024 * mem::size_of::<usize>())).take(100))
                .chain((0..100).map(|i| Free(i + 100)))
                .collect(),
        )
        .run_single_threaded();
    }

    #[test]
    fn fill_several_arenas_then_drain() {
        // Enough 512 byte blocks for a few arenas' worth of pools.
        let n = 3 * sfalloc::config::MAX_POOLS_IN_ARENA * sfalloc::SizeClass::LARGEST.capacity();
        let ops = Operations(
            iter::repeat(Alloc(SMALL_REQUEST_THRESHOLD))
                .take(n)
                .chain((0..n).rev().map(Free))
                .collect(),
        );

        let mut heap = Allocator::new(OsBackend);
        ops.run_with_heap(&mut heap, false);
        heap.assert_invariants();
        let stats = heap.stats();
        assert!(stats.highwater_arenas >= 3);
        assert_eq!(stats.live_arenas, 1);
        assert_eq!(stats.arenas_reclaimed_total + 1, stats.arenas_allocated_total);
    }

    ////////////////////////////////////////////////////////////////////////////

    // Tests taken from
    // https://github.com/alexcrichton/dlmalloc-rs/blob/master/tests/smoke.rs and
    // modified.

    #[test]
    fn smoke() {
        let a = &GLOBAL;
        unsafe {
            let layout = Layout::new::<u8>();
            let ptr = a.alloc(layout);
            assert!(!ptr.is_null(), "Should be able to alloc a fresh Layout");
            *ptr = 9;
            assert_eq!(*ptr, 9);
            a.dealloc(ptr, layout);

            let ptr = a.alloc(layout);
            assert!(!ptr.is_null(), "Should be able to alloc the same Layout again");
            *ptr = 10;
            assert_eq!(*ptr, 10);
            a.dealloc(ptr, layout);
        }
    }

    // This takes too long with our extra assertion checks enabled.
    #[test]
    #[cfg(not(feature = "extra_assertions"))]
    fn stress() {
        let a = &GLOBAL;
        let mut rng = StdRng::seed_from_u64(0x5fa1_10c);
        let mut ptrs: Vec<(*mut u8, Layout)> = Vec::new();
        unsafe {
            for _ in 0..100_000 {
                let free = !ptrs.is_empty() && ((ptrs.len() < 1_000 && rng.gen_bool(1.0 / 3.0)) || rng.gen());
                if free {
                    let idx = rng.gen_range(0..ptrs.len());
                    let (ptr, layout) = ptrs.swap_remove(idx);
                    a.dealloc(ptr, layout);
                    continue;
                }

                if !ptrs.is_empty() && rng.gen_bool(0.01) {
                    let idx = rng.gen_range(0..ptrs.len());
                    let (ptr, old) = ptrs.swap_remove(idx);
                    let new = if rng.gen() {
                        Layout::from_size_align(rng.gen_range(old.size()..old.size() * 2), old.align()).unwrap()
                    } else if old.size() > 10 {
                        Layout::from_size_align(rng.gen_range(old.size() / 2..old.size()), old.align()).unwrap()
                    } else {
                        ptrs.push((ptr, old));
                        continue;
                    };
                    let len = old.size().min(new.size());
                    let tmp: Vec<u8> = (0..len).map(|i| *ptr.add(i)).collect();
                    let ptr = a.realloc(ptr, old, new.size());
                    assert!(!ptr.is_null());
                    for (i, byte) in tmp.iter().enumerate() {
                        assert_eq!(*byte, *ptr.add(i));
                    }
                    ptrs.push((ptr, new));
                }

                let size = if rng.gen() {
                    rng.gen_range(1..128)
                } else {
                    rng.gen_range(1..128 * 1024)
                };
                let align = 1 << rng.gen_range(0..3);

                let zero = rng.gen_bool(1.0 / 50.0);
                let layout = Layout::from_size_align(size, align).unwrap();

                let ptr = if zero { a.alloc_zeroed(layout) } else { a.alloc(layout) };
                assert!(!ptr.is_null());
                for i in 0..layout.size() {
                    if zero {
                        assert_eq!(*ptr.add(i), 0);
                    }
                    *ptr.add(i) = 0xce;
                }
                ptrs.push((ptr, layout));
            }

            for (ptr, layout) in ptrs {
                a.dealloc(ptr, layout);
            }
        }
        a.assert_invariants();
    }
}
