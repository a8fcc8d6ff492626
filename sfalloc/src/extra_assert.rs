// Integrity checks that are only compiled in with the "extra_assertions"
// feature. Without it, the conditions are still type-checked but never run.

#[cfg(feature = "extra_assertions")]
macro_rules! extra_assert {
    ( $condition:expr $( , $args:expr )* ) => {
        assert!($condition $( , $args )* )
    }
}

#[cfg(not(feature = "extra_assertions"))]
macro_rules! extra_assert {
    ( $condition:expr $( , $args:expr )* ) => {
        if false {
            let _ = $condition;
            $( let _ = $args; )*
        }
    }
}

#[cfg(feature = "extra_assertions")]
macro_rules! extra_assert_eq {
    ( $left:expr , $right:expr $( , $args:expr )* ) => {
        assert_eq!($left, $right $( , $args )* )
    }
}

#[cfg(not(feature = "extra_assertions"))]
macro_rules! extra_assert_eq {
    ( $left:expr , $right:expr $( , $args:expr )* ) => {
        if false {
            let _ = $left;
            let _ = $right;
            $( let _ = $args; )*
        }
    }
}

/// Define a function whose body only runs when the "extra_assertions" feature
/// is enabled.
///
/// Without that feature the function is an `#[inline(always)]` no-op that
/// ignores its arguments and vanishes from the compiled allocator.
macro_rules! extra_only {
    (
        $( #[$attr:meta] )*
        unsafe fn $name:ident ( $( $arg:ident : $arg_ty:ty ),* $(,)* ) {
            $( $body:tt )*
        }
    ) => {
        $( #[$attr] )*
        #[cfg(feature = "extra_assertions")]
        unsafe fn $name ( $($arg : $arg_ty),* ) {
            $( $body )*
        }

        #[cfg(not(feature = "extra_assertions"))]
        #[inline(always)]
        #[allow(dead_code)]
        unsafe fn $name ( $($arg : $arg_ty),* ) {
            $( let _ = $arg; )*
        }
    }
}
