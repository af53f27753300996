//! Verified pure functions for trace resource bookkeeping.
//!
//! The allocators in [`crate::trace`] and [`crate::devices`] are imperative
//! shells around bitmap arithmetic.  That arithmetic lives here as small,
//! total functions with **no I/O and no shared state**, each guarded by
//! Tiger Style `debug_assert!` postconditions.

pub mod slots;
