//! Mutable pool state aggregates.
//!
//! Positions are never iterated: everything the engine needs about the
//! outstanding set is carried in running aggregates (totals, size-weighted
//! average maturities, base volume) updated incrementally on every open and
//! close.

use serde::{Deserialize, Serialize};
use termflow_math::{FixedPoint, I256};

use crate::config::PoolConfig;
use crate::constants::scaled_seconds;
use crate::curve::YieldSpace;

/// Aggregate market state. All share quantities are denominated in vault
/// shares; bond quantities in face value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketState {
    /// Vault shares owned by the LPs and tradeable against the curve.
    pub share_reserves: FixedPoint,
    /// Bond reserves of the trading curve.
    pub bond_reserves: FixedPoint,
    /// Net flat-settled shares. The curve prices trades against
    /// `share_reserves - share_adjustment`, so flat legs move `share_reserves`
    /// without moving the price.
    #[serde(with = "serde_i256")]
    pub share_adjustment: I256,
    /// Face value of all open longs.
    pub longs_outstanding: FixedPoint,
    /// Face value of all open shorts.
    pub shorts_outstanding: FixedPoint,
    /// Size-weighted average maturity of open longs, in 18-decimal seconds.
    pub long_average_maturity_time: FixedPoint,
    /// Size-weighted average maturity of open shorts, in 18-decimal seconds.
    pub short_average_maturity_time: FixedPoint,
    /// Base value the LPs paid out to back the open shorts.
    pub short_base_volume: FixedPoint,
    /// Base value the pool must hold to pay open longs at maturity.
    pub long_exposure: FixedPoint,
    /// Base owed to holders of matured, unredeemed positions.
    pub zombie_base_proceeds: FixedPoint,
    /// Vault shares backing `zombie_base_proceeds`.
    pub zombie_share_reserves: FixedPoint,
    /// When paused, no new positions or liquidity may be opened; closes and
    /// redemptions keep working.
    pub is_paused: bool,
}

impl Default for MarketState {
    fn default() -> Self {
        MarketState {
            share_reserves: FixedPoint::zero(),
            bond_reserves: FixedPoint::zero(),
            share_adjustment: I256::zero(),
            longs_outstanding: FixedPoint::zero(),
            shorts_outstanding: FixedPoint::zero(),
            long_average_maturity_time: FixedPoint::zero(),
            short_average_maturity_time: FixedPoint::zero(),
            short_base_volume: FixedPoint::zero(),
            long_exposure: FixedPoint::zero(),
            zombie_base_proceeds: FixedPoint::zero(),
            zombie_share_reserves: FixedPoint::zero(),
            is_paused: false,
        }
    }
}

/// Proceeds earmarked for LPs who removed liquidity before their capital was
/// freed from open positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WithdrawalPool {
    /// Withdrawal shares that have been matched with capital and can be
    /// redeemed. Monotonically increasing between redemptions.
    pub ready_to_withdraw: FixedPoint,
    /// Vault shares backing `ready_to_withdraw`.
    pub proceeds: FixedPoint,
}

/// A pure snapshot of everything the math layer prices against: the
/// immutable configuration, the market aggregates, and the vault share price
/// observed for the current operation. All trade and valuation calculations
/// run on snapshots; only the pool controller mutates live state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolState {
    pub config: PoolConfig,
    pub market: MarketState,
    pub vault_share_price: FixedPoint,
}

impl PoolState {
    /// Fraction of the position duration left before `maturity_time`,
    /// measured from the latest checkpoint boundary. One at open, zero at or
    /// after maturity.
    pub fn normalized_time_remaining(&self, maturity_time: u64, now: u64) -> FixedPoint {
        let latest_checkpoint = self.config.to_checkpoint(now);
        if maturity_time > latest_checkpoint {
            FixedPoint::from(maturity_time - latest_checkpoint)
                .div_down(FixedPoint::from(self.config.position_duration))
        } else {
            FixedPoint::zero()
        }
    }

    /// Time remaining for an 18-decimal-scaled average maturity timestamp.
    pub fn time_remaining_scaled(&self, now: u64, average_maturity: FixedPoint) -> FixedPoint {
        let now_scaled = scaled_seconds(now);
        if average_maturity > now_scaled {
            (average_maturity - now_scaled)
                .div_down(scaled_seconds(self.config.position_duration))
        } else {
            FixedPoint::zero()
        }
    }
}

impl YieldSpace for PoolState {
    fn z(&self) -> FixedPoint {
        self.market.share_reserves
    }

    fn zeta(&self) -> I256 {
        self.market.share_adjustment
    }

    fn y(&self) -> FixedPoint {
        self.market.bond_reserves
    }

    fn c(&self) -> FixedPoint {
        self.vault_share_price
    }

    fn mu(&self) -> FixedPoint {
        self.config.initial_vault_share_price
    }

    fn t(&self) -> FixedPoint {
        self.config.time_stretch
    }
}

/// Incrementally updates a size-weighted running average.
///
/// Adding: `(w*avg + dw*value) / (w + dw)`. Removing: the reverse, with the
/// result clamped at zero so that rounding drift near full removal cannot
/// underflow; the average returns to zero together with the weight.
pub fn update_weighted_average(
    average: FixedPoint,
    total_weight: FixedPoint,
    value: FixedPoint,
    delta_weight: FixedPoint,
    is_adding: bool,
) -> FixedPoint {
    if is_adding {
        let new_weight = total_weight + delta_weight;
        if new_weight.is_zero() {
            return FixedPoint::zero();
        }
        (total_weight.mul_down(average) + delta_weight.mul_down(value)).div_down(new_weight)
    } else {
        if total_weight <= delta_weight {
            return FixedPoint::zero();
        }
        let new_weight = total_weight - delta_weight;
        total_weight
            .mul_down(average)
            .saturating_sub(delta_weight.mul_down(value))
            .div_down(new_weight)
    }
}

mod serde_i256 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use termflow_math::{FixedPoint, I256};

    pub fn serialize<S: Serializer>(value: &I256, serializer: S) -> Result<S::Ok, S::Error> {
        let magnitude = FixedPoint::from(value.unsigned_abs());
        let rendered = if value.is_negative() {
            format!("-{}", magnitude)
        } else {
            magnitude.to_string()
        };
        rendered.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<I256, D::Error> {
        let s = String::deserialize(deserializer)?;
        let (negative, digits) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s.as_str()),
        };
        let magnitude: FixedPoint = digits.parse().map_err(serde::de::Error::custom)?;
        let value = I256::from(magnitude);
        Ok(if negative { -value } else { value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::scaled_seconds;

    fn fp(s: &str) -> FixedPoint {
        s.parse().unwrap()
    }

    #[test]
    fn weighted_average_accumulates() {
        // 100 bonds at t=200, then 300 bonds at t=400: average 350.
        let avg = update_weighted_average(
            FixedPoint::zero(),
            FixedPoint::zero(),
            scaled_seconds(200),
            fp("100"),
            true,
        );
        assert_eq!(avg, scaled_seconds(200));
        let avg = update_weighted_average(avg, fp("100"), scaled_seconds(400), fp("300"), true);
        assert_eq!(avg, scaled_seconds(350));
    }

    #[test]
    fn weighted_average_removal_reverses_addition() {
        let avg = update_weighted_average(
            scaled_seconds(350),
            fp("400"),
            scaled_seconds(400),
            fp("300"),
            false,
        );
        assert_eq!(avg, scaled_seconds(200));
    }

    #[test]
    fn weighted_average_zeroes_with_last_removal() {
        let avg = update_weighted_average(
            scaled_seconds(200),
            fp("100"),
            scaled_seconds(200),
            fp("100"),
            false,
        );
        assert_eq!(avg, FixedPoint::zero());
    }

    #[test]
    fn market_state_serde_round_trip() {
        let mut state = MarketState::default();
        state.share_reserves = fp("100000");
        state.share_adjustment = -I256::from(fp("3.5"));
        let json = serde_json::to_string(&state).unwrap();
        let back: MarketState = serde_json::from_str(&json).unwrap();
        assert_eq!(state, back);
    }
}
