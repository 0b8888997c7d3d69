//! LP valuation.
//!
//! The present value nets the curve and flat exposure of all outstanding
//! longs and shorts against the share reserves. It prices LP shares on every
//! add and remove, so it must be solvent under adversarial trade sequences
//! and monotone in the vault share price.

use termflow_math::{FixedPoint, I256};

use crate::config::PoolConfig;
use crate::curve::YieldSpace;
use crate::errors::{CoreError, CoreResult};
use crate::state::PoolState;

impl PoolState {
    /// The solvency value of the pool's liquidity in shares:
    ///
    /// `PV = z + netCurveTrade + netFlatTrade - z_min`
    pub fn calculate_present_value(&self, now: u64) -> CoreResult<FixedPoint> {
        let long_time_remaining =
            self.time_remaining_scaled(now, self.market.long_average_maturity_time);
        let short_time_remaining =
            self.time_remaining_scaled(now, self.market.short_average_maturity_time);

        let present_value = I256::from(self.market.share_reserves)
            + self.net_curve_trade(long_time_remaining, short_time_remaining)?
            + self.net_flat_trade(long_time_remaining, short_time_remaining)
            - I256::from(self.config.minimum_share_reserves);

        if present_value < I256::zero() {
            return Err(CoreError::NegativePresentValue);
        }
        Ok(FixedPoint::from(present_value))
    }

    /// The share value of unwinding the net curve exposure.
    ///
    /// The net position `y_l * t_l - y_s * t_s` is what the pool would have
    /// to trade on the curve if every position closed now. Net long exposure
    /// is a future bond sale, so it drains share reserves (negative); net
    /// short exposure is a future buy, which refills them (positive).
    pub fn net_curve_trade(
        &self,
        long_time_remaining: FixedPoint,
        short_time_remaining: FixedPoint,
    ) -> CoreResult<I256> {
        let net_position = I256::from(
            self.market
                .longs_outstanding
                .mul_down(long_time_remaining),
        ) - I256::from(
            self.market
                .shorts_outstanding
                .mul_down(short_time_remaining),
        );

        if net_position > I256::zero() {
            let net = FixedPoint::from(net_position);
            let max_curve_trade = self
                .max_sell_bonds_in(self.config.minimum_share_reserves)
                .unwrap_or(FixedPoint::zero());
            if max_curve_trade >= net {
                Ok(-I256::from(self.shares_out_given_bonds_in_down(net)?))
            } else {
                // The curve can only absorb part of the position. Selling
                // that much leaves the spot price near zero, so the rest is
                // marked to nothing.
                Ok(-I256::from(
                    self.ze()
                        .saturating_sub(self.config.minimum_share_reserves),
                ))
            }
        } else if net_position < I256::zero() {
            let net = FixedPoint::from(-net_position);
            let max_curve_trade = self.max_buy_bonds_out().unwrap_or(FixedPoint::zero());
            if max_curve_trade >= net {
                Ok(I256::from(self.shares_in_given_bonds_out_up(net)?))
            } else {
                // Buy what the curve offers; the remainder trades at the
                // price ceiling of one.
                let max_share_payment =
                    self.max_buy_shares_in().unwrap_or(FixedPoint::zero());
                Ok(I256::from(
                    max_share_payment
                        + (net - max_curve_trade).div_down(self.vault_share_price),
                ))
            }
        } else {
            Ok(I256::zero())
        }
    }

    /// The share value of the flat legs: matured fractions settle at face,
    /// shorts paying in and longs drawing out.
    pub fn net_flat_trade(
        &self,
        long_time_remaining: FixedPoint,
        short_time_remaining: FixedPoint,
    ) -> I256 {
        let one = FixedPoint::one();
        I256::from(self.market.shorts_outstanding.mul_div_down(
            one - short_time_remaining,
            self.vault_share_price,
        )) - I256::from(self.market.longs_outstanding.mul_div_down(
            one - long_time_remaining,
            self.vault_share_price,
        ))
    }

    /// Share reserves not needed to back open longs or the reserve floor;
    /// the most that can leave the pool right now.
    pub fn calculate_idle(&self) -> FixedPoint {
        let exposure_shares = self
            .market
            .long_exposure
            .div_up(self.vault_share_price);
        self.market
            .share_reserves
            .saturating_sub(exposure_shares)
            .saturating_sub(self.config.minimum_share_reserves)
    }

    /// The fixed rate implied by the current spot price:
    /// `r = (1 - p) / (p * t_year)`.
    pub fn calculate_spot_rate(&self) -> FixedPoint {
        let one = FixedPoint::one();
        let price = self.spot_price();
        (one - price).div_down(price.mul_up(self.config.annualized_position_duration()))
    }
}

/// Bond reserves that price a freshly seeded pool at `target_rate`.
///
/// From `p = 1 / (1 + r * t_year)` and `p = (mu * z / y)^t_s`:
/// `y = mu * z * (1 + r * t_year)^(1 / t_s)`.
pub fn calculate_initial_bond_reserves(
    config: &PoolConfig,
    share_reserves: FixedPoint,
    target_rate: FixedPoint,
) -> FixedPoint {
    let one = FixedPoint::one();
    let scaled_rate = (target_rate.mul_up(config.annualized_position_duration()) + one)
        .pow(one / config.time_stretch);
    config
        .initial_vault_share_price
        .mul_down(share_reserves)
        .mul_down(scaled_rate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Fees;
    use crate::constants::scaled_seconds;
    use crate::state::MarketState;

    fn fp(s: &str) -> FixedPoint {
        s.parse().unwrap()
    }

    fn config() -> PoolConfig {
        PoolConfig {
            position_duration: 60 * 60 * 24 * 365,
            checkpoint_duration: 60 * 60 * 24,
            time_stretch: fp("0.045"),
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

    fn snapshot(market: MarketState) -> PoolState {
        PoolState {
            config: config(),
            market,
            vault_share_price: fp("1"),
        }
    }

    #[test]
    fn present_value_of_idle_pool_is_reserves_minus_floor() {
        let state = snapshot(MarketState {
            share_reserves: fp("100000"),
            bond_reserves: fp("150000"),
            ..MarketState::default()
        });
        assert_eq!(
            state.calculate_present_value(0).unwrap(),
            fp("100000") - fp("10")
        );
    }

    #[test]
    fn net_long_exposure_reduces_present_value() {
        let config = config();
        let duration = config.position_duration;
        let state = snapshot(MarketState {
            share_reserves: fp("100000"),
            bond_reserves: fp("150000"),
            longs_outstanding: fp("5000"),
            long_average_maturity_time: scaled_seconds(duration),
            long_exposure: fp("5000"),
            ..MarketState::default()
        });
        let pv = state.calculate_present_value(0).unwrap();
        assert!(pv < fp("100000") - fp("10"));
        // Exposure is bounded by the position's face value.
        assert!(pv > fp("95000") - fp("10"));
    }

    #[test]
    fn present_value_monotone_in_vault_share_price() {
        let duration = config().position_duration;
        let market = MarketState {
            share_reserves: fp("100000"),
            bond_reserves: fp("150000"),
            longs_outstanding: fp("8000"),
            long_average_maturity_time: scaled_seconds(duration),
            long_exposure: fp("8000"),
            shorts_outstanding: fp("3000"),
            short_average_maturity_time: scaled_seconds(duration / 2),
            short_base_volume: fp("2900"),
            ..MarketState::default()
        };
        let mut previous = FixedPoint::zero();
        for price in ["1", "1.05", "1.1", "1.5", "2"] {
            let state = PoolState {
                config: config(),
                market,
                vault_share_price: fp(price),
            };
            let pv = state.calculate_present_value(duration / 4).unwrap();
            assert!(
                pv >= previous,
                "pv regressed at price {}: {} < {}",
                price,
                pv,
                previous
            );
            previous = pv;
        }
    }

    #[test]
    fn balanced_book_nets_to_zero() {
        let duration = config().position_duration;
        let state = snapshot(MarketState {
            share_reserves: fp("100000"),
            bond_reserves: fp("150000"),
            longs_outstanding: fp("4000"),
            long_average_maturity_time: scaled_seconds(duration),
            shorts_outstanding: fp("4000"),
            short_average_maturity_time: scaled_seconds(duration),
            ..MarketState::default()
        });
        let time_remaining = FixedPoint::one();
        assert_eq!(
            state
                .net_curve_trade(time_remaining, time_remaining)
                .unwrap(),
            I256::zero()
        );
        assert_eq!(
            state.net_flat_trade(time_remaining, time_remaining),
            I256::zero()
        );
    }

    #[test]
    fn idle_excludes_exposure_and_floor() {
        let state = snapshot(MarketState {
            share_reserves: fp("100000"),
            bond_reserves: fp("150000"),
            long_exposure: fp("20000"),
            ..MarketState::default()
        });
        assert_eq!(state.calculate_idle(), fp("100000") - fp("20000") - fp("10"));
    }

    #[test]
    fn initial_reserves_hit_target_rate() {
        let config = config();
        let z = fp("100000");
        let rate = fp("0.05");
        let y = calculate_initial_bond_reserves(&config, z, rate);
        let state = snapshot(MarketState {
            share_reserves: z,
            bond_reserves: y,
            ..MarketState::default()
        });
        let realized = state.calculate_spot_rate();
        let delta = if realized > rate {
            realized - rate
        } else {
            rate - realized
        };
        assert!(delta < fp("0.0001"), "realized rate = {}", realized);
    }
}
