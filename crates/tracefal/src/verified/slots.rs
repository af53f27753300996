//! Pure, verifiable functions for first-fit bitmap allocation.
//!
//! A bitmap of `width` bits tracks which entries of a fixed pool are held:
//! bit *i* set ⟺ entry *i* is taken.  Trace units use an 8-bit map for their
//! slots; the simulated device uses a wider one for broadcast channels.
//!
//! # Mapping to callers
//!
//! | Verified function     | Used by                                          |
//! |-----------------------|--------------------------------------------------|
//! | [`first_free`]        | `TraceUnit::reserve_slot`, `SimDevice::acquire`  |
//! | [`claim`] / [`free`]  | same                                             |
//! | [`held_count`]        | `TraceUnit::reserved_slot_count`                 |
//! | [`held_entries`]      | `TraceUnit` start/stop hooks                     |

/// Number of trace slots on every trace unit.
pub const MAX_TRACE_SLOTS: u8 = 8;

/// Widest bitmap these functions accept.
pub const MAX_WIDTH: u8 = 32;

/// Lowest clear bit in `bits` below `width`, or `None` when all are set.
///
/// # Properties
///
/// - Returns `Some(i)` with `i < width` and bit `i` clear.
/// - Every bit below `i` is set (first-fit: the lowest free index wins).
/// - Returns `None` only if bits `0..width` are all set.
pub fn first_free(bits: u32, width: u8) -> Option<u8> {
    debug_assert!(width <= MAX_WIDTH, "first_free: width {width} too wide");

    let result = (0..width).find(|&i| bits & (1u32 << i) == 0);

    // Postcondition: the returned bit is clear and in range.
    debug_assert!(result.map_or(true, |i| i < width && bits & (1u32 << i) == 0));
    // Postcondition: no lower bit is clear.
    debug_assert!(result.map_or(true, |i| (0..i).all(|j| bits & (1u32 << j) != 0)));
    // Postcondition: None means the whole range is taken.
    debug_assert!(result.is_some() || (0..width).all(|j| bits & (1u32 << j) != 0));

    result
}

/// Set bit `index`.
pub fn claim(bits: u32, index: u8) -> u32 {
    debug_assert!(index < MAX_WIDTH);

    let result = bits | (1u32 << index);

    debug_assert!(is_held(result, index));
    // Frame condition: no other bit changes.
    debug_assert_eq!(result & !(1u32 << index), bits & !(1u32 << index));

    result
}

/// Clear bit `index`.
pub fn free(bits: u32, index: u8) -> u32 {
    debug_assert!(index < MAX_WIDTH);

    let result = bits & !(1u32 << index);

    debug_assert!(!is_held(result, index));
    debug_assert_eq!(result | (1u32 << index), bits | (1u32 << index));

    result
}

/// Whether bit `index` is set.  Out-of-range indices are never held.
pub fn is_held(bits: u32, index: u8) -> bool {
    index < MAX_WIDTH && bits & (1u32 << index) != 0
}

/// Number of set bits below `width`.
pub fn held_count(bits: u32, width: u8) -> u32 {
    debug_assert!(width <= MAX_WIDTH);

    let mask = if width == MAX_WIDTH {
        u32::MAX
    } else {
        (1u32 << width) - 1
    };
    let result = (bits & mask).count_ones();

    debug_assert!(result <= u32::from(width));

    result
}

/// Indices of set bits below `width`, in ascending order.
pub fn held_entries(bits: u32, width: u8) -> impl Iterator<Item = u8> {
    debug_assert!(width <= MAX_WIDTH);
    (0..width).filter(move |&i| bits & (1u32 << i) != 0)
}

// ─── Tests ───────────────────────────────────────────────────────────
