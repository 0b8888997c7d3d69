//! Pool configuration.
//!
//! `PoolConfig` is immutable after deployment and is passed by value into the
//! math layer rather than read from ambient state.

use serde::{Deserialize, Serialize};
use termflow_math::FixedPoint;

use crate::constants::{ONE_RAW, SECONDS_PER_YEAR};
use crate::errors::{CoreError, CoreResult};

/// Trading fee parameters, all 18-decimal fractions in [0, 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fees {
    /// Fee charged on the price impact of the curve leg of a trade.
    pub curve: FixedPoint,
    /// Fee charged on the face value of the flat leg, pro-rated by the time
    /// already elapsed.
    pub flat: FixedPoint,
    /// Governance's cut of the curve and flat fees.
    pub governance_lp: FixedPoint,
    /// Governance's cut of the interest accrued on matured, unredeemed
    /// position proceeds.
    pub governance_zombie: FixedPoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Seconds from a position's open checkpoint to its maturity.
    pub position_duration: u64,
    /// Seconds per checkpoint bucket; must evenly divide `position_duration`.
    pub checkpoint_duration: u64,
    /// The curve's time-stretch exponent, fixed at deployment from the
    /// target rate.
    pub time_stretch: FixedPoint,
    /// Vault share price observed at deployment (the curve's `mu`).
    pub initial_vault_share_price: FixedPoint,
    /// Share reserves may never fall below this level.
    pub minimum_share_reserves: FixedPoint,
    /// Inputs below this amount are rejected outright.
    pub minimum_transaction_amount: FixedPoint,
    pub fees: Fees,
}

impl PoolConfig {
    pub fn validate(&self) -> CoreResult<()> {
        if self.checkpoint_duration == 0 {
            return Err(CoreError::InvalidConfiguration(
                "checkpoint duration must be non-zero",
            ));
        }
        if self.position_duration == 0 || self.position_duration % self.checkpoint_duration != 0 {
            return Err(CoreError::InvalidConfiguration(
                "position duration must be a non-zero multiple of the checkpoint duration",
            ));
        }
        if self.time_stretch.is_zero() || self.time_stretch >= FixedPoint::one() {
            return Err(CoreError::InvalidConfiguration(
                "time stretch must be in (0, 1)",
            ));
        }
        if self.initial_vault_share_price.is_zero() {
            return Err(CoreError::InvalidConfiguration(
                "initial vault share price must be non-zero",
            ));
        }
        if self.minimum_share_reserves.is_zero() {
            return Err(CoreError::InvalidConfiguration(
                "minimum share reserves must be non-zero",
            ));
        }
        let one = FixedPoint::one();
        if self.fees.curve >= one
            || self.fees.flat >= one
            || self.fees.governance_lp >= one
            || self.fees.governance_zombie >= one
        {
            return Err(CoreError::InvalidConfiguration("fees must be below one"));
        }
        Ok(())
    }

    /// Rounds a timestamp down to its checkpoint boundary.
    pub fn to_checkpoint(&self, time: u64) -> u64 {
        time - time % self.checkpoint_duration
    }

    /// The position duration as a fraction of a year, 18-decimal.
    pub fn annualized_position_duration(&self) -> FixedPoint {
        FixedPoint::from(self.position_duration).div_down(FixedPoint::from(SECONDS_PER_YEAR))
    }
}

/// Calibrates the curve's time-stretch exponent for a target annual rate.
///
/// `t = 1 / (5.24592 / (0.04665 * r_pct))`. The stretch tightens as the
/// target rate rises so that comparable trade sizes move the rate by
/// comparable amounts across deployments.
pub fn time_stretch_for_rate(rate: FixedPoint) -> FixedPoint {
    let rate_pct = rate.mul_down(FixedPoint::from(100 * ONE_RAW));
    let time_stretch = FixedPoint::from(5_245_920_000_000_000_000u128)
        .div_down(FixedPoint::from(46_650_000_000_000_000u128).mul_down(rate_pct));
    FixedPoint::one().div_down(time_stretch)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(s: &str) -> FixedPoint {
        s.parse().unwrap()
    }

    fn base_config() -> PoolConfig {
        PoolConfig {
            position_duration: 60 * 60 * 24 * 365,
            checkpoint_duration: 60 * 60 * 24,
            time_stretch: time_stretch_for_rate(fp("0.05")),
            initial_vault_share_price: fp("1"),
            minimum_share_reserves: fp("10"),
            minimum_transaction_amount: fp("0.001"),
            fees: Fees {
                curve: fp("0.01"),
                flat: fp("0.0005"),
                governance_lp: fp("0.15"),
                governance_zombie: fp("0.03"),
            },
        }
    }

    #[test]
    fn accepts_sane_config() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn rejects_misaligned_durations() {
        let mut config = base_config();
        config.checkpoint_duration = 60 * 60 * 7;
        assert_eq!(
            config.validate(),
            Err(CoreError::InvalidConfiguration(
                "position duration must be a non-zero multiple of the checkpoint duration",
            ))
        );
    }

    #[test]
    fn rejects_whole_fees() {
        let mut config = base_config();
        config.fees.flat = fp("1");
        assert!(config.validate().is_err());
    }

    #[test]
    fn checkpoint_rounding() {
        let config = base_config();
        let day = 60 * 60 * 24;
        assert_eq!(config.to_checkpoint(day * 3 + 17), day * 3);
        assert_eq!(config.to_checkpoint(day * 3), day * 3);
    }

    #[test]
    fn time_stretch_tightens_with_rate() {
        let low = time_stretch_for_rate(fp("0.01"));
        let high = time_stretch_for_rate(fp("0.10"));
        assert!(low < high);
        assert!(high < FixedPoint::one());
    }

    #[test]
    fn config_serde_round_trip() {
        let config = base_config();
        let json = serde_json::to_string(&config).unwrap();
        let back: PoolConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }
}
