//! Protocol-wide constants.

use termflow_math::FixedPoint;

/// Seconds in a 365-day year, the annualization basis for rates.
pub const SECONDS_PER_YEAR: u64 = 60 * 60 * 24 * 365;

/// Raw representation of 1.0 in 18-decimal fixed point.
pub const ONE_RAW: u128 = 1_000_000_000_000_000_000;

/// A timestamp in seconds as an 18-decimal fixed-point quantity of seconds.
pub fn scaled_seconds(seconds: u64) -> FixedPoint {
    FixedPoint::from(seconds as u128 * ONE_RAW)
}
