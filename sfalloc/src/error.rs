/// Errors surfaced by the allocator's boundary operations.
///
/// None of these are retried internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    /// The backend refused to supply memory for a new arena or for a
    /// delegated request.
    #[error("out of memory: the backend refused to supply more memory")]
    OutOfMemory,

    /// The address handed to `release` lies inside an arena but is not a live
    /// block. This is a client bug.
    #[error("invalid release: address is not a live block")]
    InvalidRelease,

    /// The arena record table could not grow. Treated like `OutOfMemory`.
    #[error("out of memory: the arena record table could not grow")]
    ArenaTableGrowth,
}

impl AllocError {
    /// Whether this error means memory ran out, as opposed to a client bug.
    #[inline]
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, AllocError::OutOfMemory | AllocError::ArenaTableGrowth)
    }
}
