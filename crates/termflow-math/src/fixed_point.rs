//! 18-decimal fixed-point numbers.
//!
//! `FixedPoint` wraps a `U256` scaled by 10^18. Multiplication and division
//! exist in round-down and round-up variants; the operator overloads are the
//! round-down versions. `pow` works through the identity
//! `x^y = exp(y * ln(x))` with both transcendentals evaluated in a 2^96
//! binary basis using (7,7)/(8,8)-term rational approximations, which keeps
//! the worst-case error near 10 parts in 10^18 over the domain the trading
//! curve uses.

use std::fmt;
use std::ops::{Add, AddAssign, Div, DivAssign, Mul, MulAssign, Sub, SubAssign};
use std::str::FromStr;

use num_traits::{One, Zero};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::int256::I256;
use crate::uint256::{narrow, widen, U256};

/// 10^18, the fixed-point scale.
const SCALE: U256 = U256([1_000_000_000_000_000_000, 0, 0, 0]);

/// Combined scale factor applied at the end of `exp`:
/// s * 1e18 / 2^96 staged in a 2^213 basis.
const EXP_SCALE: U256 = U256([0xee70ef65f9978af3, 0x63c32e5c2f6dc192, 0x29d9dc385, 0x0]);

/// ln finalization: the rational-approximation scale factor s * 5e18 * 2^96.
const LN_SCALE: U256 = U256([0x5cef59f0815a5506, 0xdaa0d5f769dba191, 0x1340, 0x0]);

/// ln finalization: ln(2) * 5e18 * 2^192, multiplied by the power-of-two
/// exponent from the range reduction.
const LN_TWO_K: U256 = U256([0xd803ae7b6687f2b3, 0x7614a3f75373f047, 0xb3975ab3ee5b203a, 0x267a36c0c95]);

/// ln finalization: ln(2^96 / 1e18) * 5e18 * 2^192.
const LN_BASE: U256 = U256([0xe8028c72b8864284, 0x356a1b7863008a5a, 0x7177eebf7cd370a3, 0x57115e47018c]);

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default, Hash)]
pub struct FixedPoint(U256);

impl FixedPoint {
    pub fn zero() -> FixedPoint {
        FixedPoint(U256::zero())
    }

    pub fn one() -> FixedPoint {
        FixedPoint(SCALE)
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// `self * other / divisor`, rounding toward zero. The product is carried
    /// in 512 bits, so no input combination overflows an intermediate.
    pub fn mul_div_down(self, other: FixedPoint, divisor: FixedPoint) -> FixedPoint {
        let product = widen(self.0) * widen(other.0);
        let quotient = product / widen(divisor.0);
        match narrow(quotient) {
            Some(value) => FixedPoint(value),
            None => panic!("fixed point overflow in mul_div_down"),
        }
    }

    /// `self * other / divisor`, rounding away from zero.
    pub fn mul_div_up(self, other: FixedPoint, divisor: FixedPoint) -> FixedPoint {
        let product = widen(self.0) * widen(other.0);
        let divisor = widen(divisor.0);
        let mut quotient = product / divisor;
        if !(product % divisor).is_zero() {
            quotient = quotient + crate::uint256::U512::one();
        }
        match narrow(quotient) {
            Some(value) => FixedPoint(value),
            None => panic!("fixed point overflow in mul_div_up"),
        }
    }

    pub fn mul_down(self, other: FixedPoint) -> FixedPoint {
        self.mul_div_down(other, FixedPoint::one())
    }

    pub fn mul_up(self, other: FixedPoint) -> FixedPoint {
        self.mul_div_up(other, FixedPoint::one())
    }

    pub fn div_down(self, other: FixedPoint) -> FixedPoint {
        FixedPoint(SCALE).mul_div_down(self, other)
    }

    pub fn div_up(self, other: FixedPoint) -> FixedPoint {
        FixedPoint(SCALE).mul_div_up(self, other)
    }

    /// Saturating subtraction; zero instead of an underflow abort.
    pub fn saturating_sub(self, other: FixedPoint) -> FixedPoint {
        if self >= other {
            self - other
        } else {
            FixedPoint::zero()
        }
    }

    /// `self^exponent` for fixed-point operands.
    ///
    /// `pow(x, 0) = 1` and `pow(0, y) = 0` by convention; everything else is
    /// `exp(y * ln(x))`. Monotonic in both arguments within the approximation
    /// error.
    pub fn pow(self, exponent: FixedPoint) -> FixedPoint {
        if exponent.is_zero() {
            return FixedPoint::one();
        }
        if self.is_zero() {
            return FixedPoint::zero();
        }

        // ln(x^y) = y * ln(x), so x^y = exp(y * ln(x)).
        let ln_x = Self::ln(I256::from_raw(self.0));
        let y_ln_x = I256::from_raw(exponent.0)
            .wrapping_mul(ln_x)
            .wrapping_div(I256::from_raw(SCALE));
        FixedPoint(Self::exp(y_ln_x).into_raw())
    }

    /// e^x for a signed 18-decimal fixed-point input.
    ///
    /// Returns 0 once the true result would round below 0.5e-18 (inputs below
    /// ~-42.139e18) and aborts when the result cannot be represented (inputs
    /// at or above ~135.306e18).
    pub fn exp(mut x: I256) -> I256 {
        if x <= I256::from_i128(-42_139_678_854_452_767_551) {
            return I256::zero();
        }
        if x >= I256::from_i128(135_305_999_368_893_231_589) {
            panic!("exp input out of range");
        }

        // Convert from a 10^18 basis to 2^96 for intermediate precision:
        // multiply by 1e18 / 2^96 = 5^18 / 2^78.
        x = x.wrapping_shl(78).wrapping_div(I256::from_i128(3_814_697_265_625));

        // Factor out powers of two: exp(x) = exp(x') * 2^k with
        // k = round(x / ln 2) and x' = x - k * ln 2, leaving x' in
        // (-0.5 ln 2, 0.5 ln 2) * 2^96.
        let ln2_scaled = I256::from_u128(54_916_777_467_707_473_351_141_471_128);
        let k = x
            .wrapping_shl(96)
            .wrapping_div(ln2_scaled)
            .wrapping_add(I256::from_raw(U256::one() << 95))
            .asr(96);
        x = x.wrapping_sub(k.wrapping_mul(ln2_scaled));

        // (6,7)-term rational approximation; p is monic and rescaled at the
        // end, q is monic by convention.
        let mut y = x.wrapping_add(I256::from_u128(1_346_386_616_545_796_478_920_950_773_328));
        y = y
            .wrapping_mul(x)
            .asr(96)
            .wrapping_add(I256::from_u128(57_155_421_227_552_351_082_224_309_758_442));
        let mut p = y
            .wrapping_add(x)
            .wrapping_sub(I256::from_u128(94_201_549_194_550_492_254_356_042_504_812));
        p = p
            .wrapping_mul(y)
            .asr(96)
            .wrapping_add(I256::from_u128(28_719_021_644_029_726_153_956_944_680_412_240));
        p = p.wrapping_mul(x).wrapping_add(I256::from_raw(
            U256::from(4_385_272_521_454_847_904_659_076_985_693_276u128) << 96,
        ));

        let mut q = x.wrapping_sub(I256::from_u128(2_855_989_394_907_223_263_936_484_059_900));
        q = q
            .wrapping_mul(x)
            .asr(96)
            .wrapping_add(I256::from_u128(50_020_603_652_535_783_019_961_831_881_945));
        q = q
            .wrapping_mul(x)
            .asr(96)
            .wrapping_sub(I256::from_u128(533_845_033_583_426_703_283_633_433_725_380));
        q = q
            .wrapping_mul(x)
            .asr(96)
            .wrapping_add(I256::from_u128(3_604_857_256_930_695_427_073_651_918_091_429));
        q = q
            .wrapping_mul(x)
            .asr(96)
            .wrapping_sub(I256::from_u128(14_423_608_567_350_463_180_887_372_962_807_573));
        q = q
            .wrapping_mul(x)
            .asr(96)
            .wrapping_add(I256::from_u128(26_449_188_498_355_588_339_934_803_723_976_023));

        let r = p.wrapping_div(q);

        // Multiply r by the approximation scale factor, the 2^k from the
        // range reduction, and the 1e18 / 2^96 base conversion in one step.
        // The intermediate sits in a 2^213 basis so the final shift is always
        // non-negative.
        let shift = (195 - k.as_i64()) as usize;
        let scaled = r.into_raw().overflowing_mul(EXP_SCALE).0;
        if shift >= 256 {
            I256::zero()
        } else {
            I256::from_raw(scaled >> shift)
        }
    }

    /// ln(x) for a positive 18-decimal fixed-point input. Aborts on zero or
    /// negative input.
    pub fn ln(x: I256) -> I256 {
        if x <= I256::zero() {
            panic!("ln of zero or negative number");
        }

        // Reduce to [1, 2) * 2^96: ln(2^k * m) = k ln 2 + ln m.
        let raw = x.into_raw();
        let k: i64 = raw.bits() as i64 - 1 - 96;
        let normalized = if k >= 0 {
            raw >> (k as usize)
        } else {
            raw << ((-k) as usize)
        };
        let x = I256::from_raw(normalized);

        // (8,8)-term rational approximation; p is monic and rescaled at the
        // end, q is monic by convention.
        let mut p = x.wrapping_add(I256::from_u128(3_273_285_459_638_523_848_632_254_066_296));
        p = p
            .wrapping_mul(x)
            .asr(96)
            .wrapping_add(I256::from_u128(24_828_157_081_833_163_892_658_089_445_524));
        p = p
            .wrapping_mul(x)
            .asr(96)
            .wrapping_add(I256::from_u128(43_456_485_725_739_037_958_740_375_743_393));
        p = p
            .wrapping_mul(x)
            .asr(96)
            .wrapping_sub(I256::from_u128(11_111_509_109_440_967_052_023_855_526_967));
        p = p
            .wrapping_mul(x)
            .asr(96)
            .wrapping_sub(I256::from_u128(45_023_709_667_254_063_763_336_534_515_857));
        p = p
            .wrapping_mul(x)
            .asr(96)
            .wrapping_sub(I256::from_u128(14_706_773_417_378_608_786_704_636_184_526));
        p = p.wrapping_mul(x).wrapping_sub(I256::from_raw(
            U256::from(795_164_235_651_350_426_258_249_787_498u128) << 96,
        ));

        let mut q = x.wrapping_add(I256::from_u128(5_573_035_233_440_673_466_300_451_813_936));
        q = q
            .wrapping_mul(x)
            .asr(96)
            .wrapping_add(I256::from_u128(71_694_874_799_317_883_764_090_561_454_958));
        q = q
            .wrapping_mul(x)
            .asr(96)
            .wrapping_add(I256::from_u128(283_447_036_172_924_575_727_196_451_306_956));
        q = q
            .wrapping_mul(x)
            .asr(96)
            .wrapping_add(I256::from_u128(401_686_690_394_027_663_651_624_208_769_553));
        q = q
            .wrapping_mul(x)
            .asr(96)
            .wrapping_add(I256::from_u128(204_048_457_590_392_012_362_485_061_816_622));
        q = q
            .wrapping_mul(x)
            .asr(96)
            .wrapping_add(I256::from_u128(31_853_899_698_501_571_402_653_359_427_138));
        q = q
            .wrapping_mul(x)
            .asr(96)
            .wrapping_add(I256::from_u128(909_429_971_244_387_300_277_376_558_375));

        // Finalize: scale by s * 5e18 * 2^96, add k * ln(2) and the base
        // conversion constant, then shift back to the 10^18 basis.
        let mut r = p.wrapping_div(q);
        r = r.wrapping_mul(I256::from_raw(LN_SCALE));
        r = r.wrapping_add(I256::from_raw(LN_TWO_K).wrapping_mul(I256::from_i128(k as i128)));
        r = r.wrapping_add(I256::from_raw(LN_BASE));
        r.asr(174)
    }
}

impl From<U256> for FixedPoint {
    fn from(value: U256) -> FixedPoint {
        FixedPoint(value)
    }
}

impl From<u128> for FixedPoint {
    fn from(value: u128) -> FixedPoint {
        FixedPoint(U256::from(value))
    }
}

impl From<u64> for FixedPoint {
    fn from(value: u64) -> FixedPoint {
        FixedPoint(U256::from(value))
    }
}

impl From<FixedPoint> for U256 {
    fn from(value: FixedPoint) -> U256 {
        value.0
    }
}

impl From<FixedPoint> for u128 {
    fn from(value: FixedPoint) -> u128 {
        value.0.as_u128()
    }
}

impl From<FixedPoint> for I256 {
    fn from(value: FixedPoint) -> I256 {
        if value.0.bit(255) {
            panic!("fixed point value too large for I256");
        }
        I256::from_raw(value.0)
    }
}

/// Signed-to-unsigned conversion for values already known to be
/// non-negative; aborts otherwise.
impl From<I256> for FixedPoint {
    fn from(value: I256) -> FixedPoint {
        if value.is_negative() {
            panic!("cannot convert negative I256 to FixedPoint");
        }
        FixedPoint(value.into_raw())
    }
}

impl Add for FixedPoint {
    type Output = FixedPoint;

    fn add(self, other: FixedPoint) -> FixedPoint {
        FixedPoint(self.0 + other.0)
    }
}

impl AddAssign for FixedPoint {
    fn add_assign(&mut self, other: FixedPoint) {
        *self = *self + other;
    }
}

impl Sub for FixedPoint {
    type Output = FixedPoint;

    fn sub(self, other: FixedPoint) -> FixedPoint {
        FixedPoint(self.0 - other.0)
    }
}

impl SubAssign for FixedPoint {
    fn sub_assign(&mut self, other: FixedPoint) {
        *self = *self - other;
    }
}

/// The overloaded multiplication rounds down; `mul_up` is the other variant.
impl Mul for FixedPoint {
    type Output = FixedPoint;

    fn mul(self, other: FixedPoint) -> FixedPoint {
        self.mul_down(other)
    }
}

impl MulAssign for FixedPoint {
    fn mul_assign(&mut self, other: FixedPoint) {
        *self = *self * other;
    }
}

/// The overloaded division rounds down; `div_up` is the other variant.
impl Div for FixedPoint {
    type Output = FixedPoint;

    fn div(self, other: FixedPoint) -> FixedPoint {
        self.div_down(other)
    }
}

impl DivAssign for FixedPoint {
    fn div_assign(&mut self, other: FixedPoint) {
        *self = *self / other;
    }
}

impl Zero for FixedPoint {
    fn zero() -> FixedPoint {
        FixedPoint::zero()
    }

    fn is_zero(&self) -> bool {
        FixedPoint::is_zero(self)
    }
}

impl One for FixedPoint {
    fn one() -> FixedPoint {
        FixedPoint::one()
    }
}

impl fmt::Display for FixedPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let integer = self.0 / SCALE;
        let fraction = self.0 % SCALE;
        if fraction.is_zero() {
            return write!(f, "{}", integer);
        }
        let digits = fraction.to_string();
        let padded = format!("{}{}", "0".repeat(18 - digits.len()), digits);
        write!(f, "{}.{}", integer, padded.trim_end_matches('0'))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseFixedError {
    #[error("invalid decimal number")]
    InvalidNumber,
    #[error("more than 18 fractional digits")]
    TooManyDecimals,
}

impl FromStr for FixedPoint {
    type Err = ParseFixedError;

    fn from_str(s: &str) -> Result<FixedPoint, ParseFixedError> {
        let (int_part, frac_part) = match s.split_once('.') {
            Some((i, f)) => (i, f),
            None => (s, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(ParseFixedError::InvalidNumber);
        }
        if frac_part.len() > 18 {
            return Err(ParseFixedError::TooManyDecimals);
        }

        let integer = if int_part.is_empty() {
            U256::zero()
        } else {
            U256::from_dec_str(int_part).map_err(|_| ParseFixedError::InvalidNumber)?
        };
        let fraction = if frac_part.is_empty() {
            U256::zero()
        } else {
            let padded = format!("{}{}", frac_part, "0".repeat(18 - frac_part.len()));
            U256::from_dec_str(&padded).map_err(|_| ParseFixedError::InvalidNumber)?
        };
        Ok(FixedPoint(integer * SCALE + fraction))
    }
}

impl Serialize for FixedPoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for FixedPoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<FixedPoint, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use std::panic;

    use proptest::prelude::*;

    use super::*;

    fn fp(s: &str) -> FixedPoint {
        s.parse().unwrap()
    }

    fn assert_close(actual: FixedPoint, expected: FixedPoint, tolerance: FixedPoint) {
        let delta = if actual > expected {
            actual - expected
        } else {
            expected - actual
        };
        assert!(
            delta <= tolerance,
            "actual = {}, expected = {}, delta = {}",
            actual,
            expected,
            delta
        );
    }

    #[test]
    fn parse_and_display_round_trip() {
        for s in ["0", "1", "0.5", "123.456", "0.000000000000000001"] {
            assert_eq!(fp(s).to_string(), s);
        }
        assert_eq!(fp("1.500"), fp("1.5"));
        assert!("1.0000000000000000001".parse::<FixedPoint>().is_err());
        assert!("abc".parse::<FixedPoint>().is_err());
    }

    #[test]
    fn mul_div_rounding_directions() {
        let a = fp("1");
        let b = fp("1");
        let d = fp("3");
        let down = a.mul_div_down(b, d);
        let up = a.mul_div_up(b, d);
        assert_eq!(up - down, FixedPoint::from(1u128));
        assert!(down.mul_down(d) <= a);
        assert!(up.mul_up(d) >= a);
    }

    #[test]
    fn mul_div_no_intermediate_overflow() {
        // (2^200) * (2^55) / (2^55) round-trips even though the product
        // exceeds 256 bits.
        let big = FixedPoint::from(U256::one() << 200);
        let other = FixedPoint::from(U256::one() << 55);
        assert_eq!(big.mul_div_down(other, other), big);
    }

    #[test]
    fn mul_div_zero_divisor_aborts() {
        let a = FixedPoint::one();
        assert!(panic::catch_unwind(|| a.mul_div_down(a, FixedPoint::zero())).is_err());
        assert!(panic::catch_unwind(|| a.mul_div_up(a, FixedPoint::zero())).is_err());
    }

    #[test]
    fn sub_underflow_aborts() {
        assert!(panic::catch_unwind(|| FixedPoint::zero() - FixedPoint::one()).is_err());
        assert_eq!(
            FixedPoint::zero().saturating_sub(FixedPoint::one()),
            FixedPoint::zero()
        );
    }

    #[test]
    fn exp_known_values() {
        assert_eq!(FixedPoint::exp(I256::zero()), I256::from(FixedPoint::one()));
        // e^1 = 2.718281828459045235...
        let e = FixedPoint::exp(I256::from(FixedPoint::one()));
        assert_close(
            FixedPoint::from(e),
            fp("2.718281828459045235"),
            FixedPoint::from(10u128),
        );
        // Deep negative inputs round to zero.
        assert_eq!(
            FixedPoint::exp(I256::from_i128(-43_000_000_000_000_000_000)),
            I256::zero()
        );
        // Out-of-range inputs abort.
        assert!(panic::catch_unwind(|| {
            FixedPoint::exp(I256::from_i128(136_000_000_000_000_000_000))
        })
        .is_err());
    }

    #[test]
    fn ln_known_values() {
        assert_eq!(FixedPoint::ln(I256::from(FixedPoint::one())), I256::zero());
        // ln(e) = 1.
        let ln_e = FixedPoint::ln(I256::from(fp("2.718281828459045235")));
        assert_close(
            FixedPoint::from(ln_e),
            FixedPoint::one(),
            FixedPoint::from(100u128),
        );
        // ln(0.5) = -0.693147...
        let ln_half = FixedPoint::ln(I256::from(fp("0.5")));
        assert!(ln_half.is_negative());
        assert_close(
            FixedPoint::from(-ln_half),
            fp("0.693147180559945309"),
            FixedPoint::from(100u128),
        );
        assert!(panic::catch_unwind(|| FixedPoint::ln(I256::zero())).is_err());
    }

    #[test]
    fn pow_conventions() {
        assert_eq!(fp("123.45").pow(FixedPoint::zero()), FixedPoint::one());
        assert_eq!(FixedPoint::zero().pow(fp("0.5")), FixedPoint::zero());
    }

    #[test]
    fn pow_known_values() {
        let tolerance = fp("0.000000000001");
        assert_close(fp("4").pow(fp("0.5")), fp("2"), tolerance);
        assert_close(fp("8").pow(fp("0.333333333333333333")), fp("2"), tolerance);
        assert_close(fp("2").pow(fp("2")), fp("4"), tolerance);
        assert_close(fp("0.25").pow(fp("0.5")), fp("0.5"), tolerance);
    }

    proptest! {
        #[test]
        fn pow_monotonic_in_base(
            a in 1u128..1_000_000_000_000_000_000_000u128,
            delta in 1u128..1_000_000_000_000_000_000_000u128,
            exp in 1u128..1_000_000_000_000_000_000u128,
        ) {
            let base = FixedPoint::from(a);
            let larger = FixedPoint::from(a + delta);
            let exponent = FixedPoint::from(exp);
            // Monotone up to the kernel's approximation error.
            let slack = FixedPoint::from(1_000u128);
            prop_assert!(base.pow(exponent) <= larger.pow(exponent) + slack);
        }

        #[test]
        fn mul_up_dominates_mul_down(
            a in 0u128..u128::MAX,
            b in 0u128..u128::MAX,
        ) {
            let x = FixedPoint::from(a);
            let y = FixedPoint::from(b);
            let down = x.mul_down(y);
            let up = x.mul_up(y);
            prop_assert!(up >= down);
            prop_assert!(up - down <= FixedPoint::from(1u128));
        }

        #[test]
        fn div_round_trip_within_one_unit(
            a in 1u128..u128::MAX,
            b in 1u128..u128::MAX,
        ) {
            let x = FixedPoint::from(a);
            let y = FixedPoint::from(b);
            let q = x.div_down(y);
            let back = q.mul_down(y);
            prop_assert!(back <= x);
        }
    }
}
