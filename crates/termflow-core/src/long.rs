//! Long position calculations.
//!
//! A long buys bonds at a discount and redeems them at face value at
//! maturity, locking in the fixed rate implied by the purchase price.

use termflow_math::FixedPoint;

use crate::curve::{effective_share_reserves, spot_price, YieldSpace};
use crate::errors::{CoreError, CoreResult};
use crate::state::PoolState;

/// Deltas produced by opening a long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenLong {
    /// Shares the trader's deposit converts to.
    pub share_deposit: FixedPoint,
    /// Bonds minted to the trader, net of the curve fee.
    pub bond_proceeds: FixedPoint,
    /// Shares added to the reserves (deposit minus governance's cut).
    pub share_reserves_delta: FixedPoint,
    /// Bonds removed from the reserves (gross proceeds minus the fee share
    /// the pool retains).
    pub bond_reserves_delta: FixedPoint,
    pub governance_fee_shares: FixedPoint,
}

/// Deltas produced by closing a long before maturity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseLong {
    /// Shares paid out to the trader, net of fees.
    pub share_proceeds: FixedPoint,
    /// Shares removed from the reserves (trader proceeds plus governance's
    /// cut; the rest of the fees stay with the LPs).
    pub share_reserves_delta: FixedPoint,
    /// Bonds returned to the curve.
    pub bond_reserves_delta: FixedPoint,
    /// The flat (matured-fraction) component of the payout, used to offset
    /// the share adjustment so the flat leg does not move the curve price.
    pub flat_shares: FixedPoint,
    pub governance_fee_shares: FixedPoint,
}

impl PoolState {
    /// Prices opening a long with a deposit of `base_amount` base.
    ///
    /// The gross bond amount comes off the curve; the curve fee is deducted
    /// from the trader's bonds, governance's share of it is skimmed from the
    /// reserves in shares, and the remainder of the fee is left in the bond
    /// reserves for the LPs.
    pub fn calculate_open_long(&self, base_amount: FixedPoint) -> CoreResult<OpenLong> {
        let c = self.vault_share_price;
        let share_deposit = base_amount.div_down(c);
        let gross_bonds = self.bonds_out_given_shares_in_down(share_deposit)?;

        let curve_fee_bonds = self.open_long_curve_fee(base_amount);
        if curve_fee_bonds > gross_bonds {
            return Err(CoreError::InsufficientLiquidity);
        }
        let governance_fee_bonds = self.governance_fee(curve_fee_bonds);
        let governance_fee_shares = governance_fee_bonds.mul_down(self.spot_price()).div_down(c);

        let bond_proceeds = gross_bonds - curve_fee_bonds;
        let share_reserves_delta = share_deposit.saturating_sub(governance_fee_shares);
        let bond_reserves_delta = gross_bonds - (curve_fee_bonds - governance_fee_bonds);

        // Buying bonds may never push the spot price past one; past that
        // point the pool would owe more than face value.
        let ending_spot_price = spot_price(
            effective_share_reserves(
                self.market.share_reserves + share_reserves_delta,
                self.market.share_adjustment,
            ),
            self.market.bond_reserves - bond_reserves_delta,
            self.config.initial_vault_share_price,
            self.config.time_stretch,
        );
        if ending_spot_price > FixedPoint::one() {
            return Err(CoreError::NegativeInterest);
        }

        Ok(OpenLong {
            share_deposit,
            bond_proceeds,
            share_reserves_delta,
            bond_reserves_delta,
            governance_fee_shares,
        })
    }

    /// Prices closing `bond_amount` of a long maturing at `maturity_time`.
    ///
    /// The matured fraction settles flat at face value; the remainder is sold
    /// back on the curve. Only valid before maturity; matured longs settle
    /// through their checkpoint.
    pub fn calculate_close_long(
        &self,
        bond_amount: FixedPoint,
        maturity_time: u64,
        now: u64,
    ) -> CoreResult<CloseLong> {
        let one = FixedPoint::one();
        let c = self.vault_share_price;
        let normalized_time_remaining = self.normalized_time_remaining(maturity_time, now);

        let flat_shares = bond_amount.mul_div_down(one - normalized_time_remaining, c);
        let curve_bonds = bond_amount.mul_down(normalized_time_remaining);
        let curve_shares = if curve_bonds.is_zero() {
            FixedPoint::zero()
        } else {
            self.shares_out_given_bonds_in_down(curve_bonds)?
        };

        let curve_fee_shares = self.close_curve_fee(bond_amount, normalized_time_remaining);
        let flat_fee_shares = self.close_flat_fee(bond_amount, normalized_time_remaining);
        let governance_fee_shares = self.governance_fee(curve_fee_shares + flat_fee_shares);

        let share_proceeds =
            (flat_shares + curve_shares).saturating_sub(curve_fee_shares + flat_fee_shares);
        let share_reserves_delta = share_proceeds + governance_fee_shares;

        Ok(CloseLong {
            share_proceeds,
            share_reserves_delta,
            bond_reserves_delta: curve_bonds,
            flat_shares,
            governance_fee_shares,
        })
    }
}
