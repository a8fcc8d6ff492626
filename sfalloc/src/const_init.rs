/// Anything that can be initialized with a `const` value, so that it can sit
/// in a `static` without lazy initialization.
pub(crate) trait ConstInit {
    /// The `const` default initializer value for `Self`.
    const INIT: Self;
}
