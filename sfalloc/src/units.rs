use crate::config::POOL_SIZE;
use core::ops;

/// Round `n` up to the next multiple of `align`, which must be a power of two.
#[inline]
pub const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

macro_rules! define_unit_type {
    ( $( #[$attr:meta] )* $name:ident ) => {
        $( #[$attr] )*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(pub usize);

        impl<T: Into<Self>> ops::Add<T> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: T) -> Self {
                $name(self.0 + rhs.into().0)
            }
        }

        impl<T: Into<Self>> ops::Sub<T> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: T) -> Self {
                $name(self.0 - rhs.into().0)
            }
        }
    };
}

define_unit_type!(
    /// A quantity of bytes.
    Bytes
);

define_unit_type!(
    /// A quantity of `POOL_SIZE` pools.
    Pools
);

impl From<Pools> for Bytes {
    #[inline]
    fn from(pools: Pools) -> Bytes {
        Bytes(pools.0 * POOL_SIZE.0)
    }
}

impl Bytes {
    /// How many whole pools fit in this many bytes.
    #[inline]
    pub const fn whole_pools(self) -> Pools {
        Pools(self.0 / POOL_SIZE.0)
    }
}
