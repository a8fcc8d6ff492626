//! Compile-time tuning constants.
//!
//! None of these are mutable at runtime. The arena size can be overridden at
//! build time with the `SFALLOC_ARENA_BYTES` environment variable; everything
//! else is fixed here.

use crate::units::Bytes;
use core::mem;

/// Block sizes are multiples of this, and every block is aligned to it.
pub const ALIGNMENT: Bytes = Bytes(8);

/// Largest request served from pools. Anything bigger goes to the backend.
pub const SMALL_REQUEST_THRESHOLD: Bytes = Bytes(512);

/// Size of a pool. Must not exceed the virtual memory page size of the host,
/// since masking a foreign pointer down to a pool boundary has to land in
/// memory that is mapped whenever the pointer itself is.
pub const POOL_SIZE: Bytes = Bytes(4096);

/// Size of an arena, the unit of memory reserved from the backend.
pub const ARENA_SIZE: Bytes = Bytes(include!(concat!(
    env!("OUT_DIR"),
    "/sfalloc_arena_size_bytes.txt"
)));

/// Number of arena records in the first chunk of the record table. Chunk `k`
/// holds `INITIAL_ARENA_OBJECTS << k` records.
pub const INITIAL_ARENA_OBJECTS: usize = 16;

/// Upper bound on the number of record table chunks.
pub const MAX_ARENA_TABLE_CHUNKS: usize = 24;

/// Number of pools in an arena whose base happens to be pool-aligned.
pub const MAX_POOLS_IN_ARENA: usize = ARENA_SIZE.0 / POOL_SIZE.0;

const _: () = assert!(ALIGNMENT.0.is_power_of_two());
const _: () = assert!(ALIGNMENT.0 >= mem::size_of::<*mut u8>());
const _: () = assert!(SMALL_REQUEST_THRESHOLD.0 % ALIGNMENT.0 == 0);
const _: () = assert!(SMALL_REQUEST_THRESHOLD.0 / ALIGNMENT.0 <= 256);
const _: () = assert!(POOL_SIZE.0.is_power_of_two());
const _: () = assert!(ARENA_SIZE.0 % POOL_SIZE.0 == 0);
const _: () = assert!(MAX_POOLS_IN_ARENA >= 4);
const _: () = assert!(MAX_POOLS_IN_ARENA <= u32::MAX as usize);
const _: () = assert!(INITIAL_ARENA_OBJECTS > 0);
