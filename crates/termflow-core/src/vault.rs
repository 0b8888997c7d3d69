//! The yield source collaborator.
//!
//! The pool accounts internally in vault shares and treats the yield source
//! as an opaque price oracle plus a deposit/withdraw surface. Concrete
//! integrations (lending markets, staking tokens, vaults) implement this
//! trait and are chosen at pool construction; the core never dispatches on
//! the integration kind.

use serde::{Deserialize, Serialize};
use termflow_math::FixedPoint;

use crate::errors::{CoreError, CoreResult};

pub trait YieldSource {
    /// Converts vault shares to the user-facing base asset at the source's
    /// current exchange rate. Pure view; must not move value.
    fn convert_to_base(&self, share_amount: FixedPoint) -> CoreResult<FixedPoint>;

    /// Inverse of [`convert_to_base`](Self::convert_to_base).
    fn convert_to_shares(&self, base_amount: FixedPoint) -> CoreResult<FixedPoint>;

    /// Deposits base, returning the shares minted. Integrations that cannot
    /// accept base fail with `UnsupportedAssetForm` rather than converting
    /// lossily.
    fn deposit_with_base(&mut self, base_amount: FixedPoint) -> CoreResult<FixedPoint>;

    /// Deposits already-wrapped shares, returning the shares credited.
    fn deposit_with_shares(&mut self, share_amount: FixedPoint) -> CoreResult<FixedPoint>;

    /// Withdraws enough shares to pay out `base_amount` base, returning the
    /// shares burned.
    fn withdraw_with_base(&mut self, base_amount: FixedPoint) -> CoreResult<FixedPoint>;

    /// Withdraws shares in kind, returning the shares burned.
    fn withdraw_with_shares(&mut self, share_amount: FixedPoint) -> CoreResult<FixedPoint>;

    /// Total shares the pool holds in the yield source. Backs the solvency
    /// invariant: holdings never fall below the pool's recorded obligations.
    fn total_shares(&self) -> CoreResult<FixedPoint>;

    /// The price of one share in base. Fails when the source's oracle is
    /// unavailable; callers must fail closed rather than reuse a stale
    /// price.
    fn vault_share_price(&self) -> CoreResult<FixedPoint> {
        self.convert_to_base(FixedPoint::one())
    }
}

/// An interest-accruing in-memory yield source for tests and simulation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockVault {
    share_price: FixedPoint,
    total_shares: FixedPoint,
    accepts_base: bool,
    accepts_shares: bool,
}

impl MockVault {
    pub fn new(share_price: FixedPoint) -> MockVault {
        MockVault {
            share_price,
            total_shares: FixedPoint::zero(),
            accepts_base: true,
            accepts_shares: true,
        }
    }

    /// Restricts which asset forms the mock accepts, to exercise the
    /// unsupported-form paths.
    pub fn with_supported_forms(mut self, base: bool, shares: bool) -> MockVault {
        self.accepts_base = base;
        self.accepts_shares = shares;
        self
    }

    /// Multiplies the share price by `1 + rate`, simulating accrued yield
    /// (or a loss for negative-looking rates below one).
    pub fn accrue(&mut self, rate: FixedPoint) {
        self.share_price = self.share_price.mul_down(FixedPoint::one() + rate);
    }

    pub fn set_share_price(&mut self, share_price: FixedPoint) {
        self.share_price = share_price;
    }
}

impl YieldSource for MockVault {
    fn convert_to_base(&self, share_amount: FixedPoint) -> CoreResult<FixedPoint> {
        Ok(share_amount.mul_down(self.share_price))
    }

    fn convert_to_shares(&self, base_amount: FixedPoint) -> CoreResult<FixedPoint> {
        Ok(base_amount.div_down(self.share_price))
    }

    fn deposit_with_base(&mut self, base_amount: FixedPoint) -> CoreResult<FixedPoint> {
        if !self.accepts_base {
            return Err(CoreError::UnsupportedAssetForm);
        }
        let shares = self.convert_to_shares(base_amount)?;
        self.total_shares += shares;
        Ok(shares)
    }

    fn deposit_with_shares(&mut self, share_amount: FixedPoint) -> CoreResult<FixedPoint> {
        if !self.accepts_shares {
            return Err(CoreError::UnsupportedAssetForm);
        }
        self.total_shares += share_amount;
        Ok(share_amount)
    }

    fn withdraw_with_base(&mut self, base_amount: FixedPoint) -> CoreResult<FixedPoint> {
        if !self.accepts_base {
            return Err(CoreError::UnsupportedAssetForm);
        }
        let shares = self.convert_to_shares(base_amount)?;
        if shares > self.total_shares {
            return Err(CoreError::TransferFailed);
        }
        self.total_shares -= shares;
        Ok(shares)
    }

    fn withdraw_with_shares(&mut self, share_amount: FixedPoint) -> CoreResult<FixedPoint> {
        if !self.accepts_shares {
            return Err(CoreError::UnsupportedAssetForm);
        }
        if share_amount > self.total_shares {
            return Err(CoreError::TransferFailed);
        }
        self.total_shares -= share_amount;
        Ok(share_amount)
    }

    fn total_shares(&self) -> CoreResult<FixedPoint> {
        Ok(self.total_shares)
    }
}
