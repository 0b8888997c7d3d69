//! Trading fee formulas.
//!
//! The curve fee is charged on the price impact of the curve leg; the flat
//! fee on the face value of the flat leg, pro-rated by elapsed time.
//! Governance takes a configured cut of both. Fees are non-negative and
//! strictly below the trade notional for any fee parameters below one.

use termflow_math::FixedPoint;

use crate::curve::YieldSpace;
use crate::state::PoolState;

impl PoolState {
    /// Curve fee paid by longs on a base deposit, in bonds:
    /// `phi_c * (1 / p - 1) * x`.
    pub fn open_long_curve_fee(&self, base_amount: FixedPoint) -> FixedPoint {
        let one = FixedPoint::one();
        self.config.fees.curve * ((one / self.spot_price()) - one) * base_amount
    }

    /// Curve fee paid when closing `bond_amount` early, in shares:
    /// `phi_c * (1 - p) * dy * tau / c`.
    pub fn close_curve_fee(
        &self,
        bond_amount: FixedPoint,
        normalized_time_remaining: FixedPoint,
    ) -> FixedPoint {
        self.config.fees.curve
            * (FixedPoint::one() - self.spot_price())
            * bond_amount.mul_div_down(normalized_time_remaining, self.vault_share_price)
    }

    /// Flat fee on the matured portion of a close, in shares:
    /// `dy * (1 - tau) * phi_flat / c`.
    pub fn close_flat_fee(
        &self,
        bond_amount: FixedPoint,
        normalized_time_remaining: FixedPoint,
    ) -> FixedPoint {
        bond_amount.mul_div_down(
            FixedPoint::one() - normalized_time_remaining,
            self.vault_share_price,
        ) * self.config.fees.flat
    }

    /// Curve fee paid by shorts at open, in base:
    /// `phi_c * (1 - p) * dy`.
    pub fn open_short_curve_fee(&self, bond_amount: FixedPoint) -> FixedPoint {
        self.config.fees.curve * (FixedPoint::one() - self.spot_price()) * bond_amount
    }

    /// Governance's cut of a fee amount.
    pub fn governance_fee(&self, fee: FixedPoint) -> FixedPoint {
        fee.mul_down(self.config.fees.governance_lp)
    }
}

#[cfg(test)]
mod tests {
    use termflow_math::FixedPoint;

    use crate::config::{Fees, PoolConfig};
    use crate::state::{MarketState, PoolState};

    fn fp(s: &str) -> FixedPoint {
        s.parse().unwrap()
    }

    fn snapshot() -> PoolState {
        PoolState {
            config: PoolConfig {
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
            },
            market: MarketState {
                share_reserves: fp("100000"),
                bond_reserves: fp("150000"),
                ..MarketState::default()
            },
            vault_share_price: fp("1"),
        }
    }

    #[test]
    fn fees_are_below_notional() {
        let state = snapshot();
        let base = fp("10000");
        let curve_fee = state.open_long_curve_fee(base);
        assert!(curve_fee > FixedPoint::zero());
        assert!(curve_fee < base);

        let bonds = fp("10000");
        let close_fees =
            state.close_curve_fee(bonds, fp("0.5")) + state.close_flat_fee(bonds, fp("0.5"));
        assert!(close_fees < bonds);
    }

    #[test]
    fn flat_fee_vanishes_at_full_time_remaining() {
        let state = snapshot();
        assert_eq!(
            state.close_flat_fee(fp("10000"), FixedPoint::one()),
            FixedPoint::zero()
        );
    }

    #[test]
    fn governance_takes_configured_cut() {
        let state = snapshot();
        assert_eq!(state.governance_fee(fp("100")), fp("15"));
    }
}
