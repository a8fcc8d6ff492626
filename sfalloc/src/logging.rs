// Forwarders to the `log` facade. Without the "logging" feature they expand
// to code that type-checks the arguments and then disappears, so a logger
// that allocates can never re-enter an allocator that is holding its lock.

#[cfg(feature = "logging")]
macro_rules! log_debug {
    ( $( $args:tt )* ) => {
        log::debug!(target: "sfalloc", $( $args )*)
    }
}

#[cfg(not(feature = "logging"))]
macro_rules! log_debug {
    ( $( $args:tt )* ) => {
        if false {
            let _ = format_args!($( $args )*);
        }
    }
}

#[cfg(feature = "logging")]
macro_rules! log_trace {
    ( $( $args:tt )* ) => {
        log::trace!(target: "sfalloc", $( $args )*)
    }
}

#[cfg(not(feature = "logging"))]
macro_rules! log_trace {
    ( $( $args:tt )* ) => {
        if false {
            let _ = format_args!($( $args )*);
        }
    }
}

#[cfg(feature = "logging")]
macro_rules! log_warn {
    ( $( $args:tt )* ) => {
        log::warn!(target: "sfalloc", $( $args )*)
    }
}

#[cfg(not(feature = "logging"))]
macro_rules! log_warn {
    ( $( $args:tt )* ) => {
        if false {
            let _ = format_args!($( $args )*);
        }
    }
}
