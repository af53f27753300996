//! Deterministic device backends.
//!
//! Each module provides a simulated device that replaces real hardware with
//! a controllable implementation of the interfaces in [`crate::device`],
//! suitable for tests and fault injection.

pub mod sim;
