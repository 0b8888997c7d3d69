//! # Termflow Math
//!
//! Deterministic 18-decimal fixed-point arithmetic on 256-bit integers.
//!
//! Every quantity in the trading engine is an unsigned integer scaled by
//! 10^18. Division-bearing operations come in a round-down and a round-up
//! variant; which one a call site uses is an economic decision, so the
//! direction is always spelled out in the method name. The operator overloads
//! (`*`, `/`) are the round-down variants.
//!
//! Arithmetic that leaves the representable range (overflow, division by
//! zero, `ln` of a non-positive number) aborts the calculation with a panic.
//! Callers are expected to validate domain before calling in, and the engine
//! layer above surfaces economic failures as `Result`s before any raw
//! arithmetic can go out of range.

mod fixed_point;
mod int256;
mod uint256;

pub use fixed_point::{FixedPoint, ParseFixedError};
pub use int256::I256;
pub use uint256::{U256, U512};
