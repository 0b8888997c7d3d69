//! 256- and 512-bit unsigned integers.
//!
//! The 512-bit width exists so that `a * b / d` can be computed without any
//! intermediate overflow for the full 256-bit input range.

use uint::construct_uint;

construct_uint! {
    /// 256-bit unsigned integer (little-endian 64-bit limbs).
    pub struct U256(4);
}

construct_uint! {
    /// 512-bit unsigned integer, used only as a multiplication intermediate.
    pub struct U512(8);
}

/// Widens a 256-bit value into the 512-bit intermediate space.
pub(crate) fn widen(x: U256) -> U512 {
    U512([x.0[0], x.0[1], x.0[2], x.0[3], 0, 0, 0, 0])
}

/// Narrows a 512-bit intermediate back to 256 bits, or `None` if the value
/// no longer fits.
pub(crate) fn narrow(x: U512) -> Option<U256> {
    if x.0[4] != 0 || x.0[5] != 0 || x.0[6] != 0 || x.0[7] != 0 {
        return None;
    }
    Some(U256([x.0[0], x.0[1], x.0[2], x.0[3]]))
}
