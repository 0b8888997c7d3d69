//! Multi-asset position ledger.
//!
//! One balance table holds every asset class the pool issues: LP shares,
//! withdrawal shares, and longs and shorts keyed by maturity. The pool
//! controller is the only holder of a mutable reference, so mint and burn
//! are controller-only by construction; holders move balances through
//! transfer with per-asset or blanket operator approvals.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use termflow_math::FixedPoint;

use crate::errors::{CoreError, CoreResult};

/// An account in the host ledger's address space.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct AccountId(pub [u8; 32]);

impl AccountId {
    /// The burn address; balances minted here are locked forever.
    pub fn zero() -> AccountId {
        AccountId([0; 32])
    }

    /// A short deterministic test address.
    pub fn from_low_u64(value: u64) -> AccountId {
        let mut bytes = [0u8; 32];
        bytes[24..].copy_from_slice(&value.to_be_bytes());
        AccountId(bytes)
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x")?;
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// The four asset classes, maturity-keyed for positions.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum AssetId {
    LpShare,
    WithdrawalShare,
    Long { maturity_time: u64 },
    Short { maturity_time: u64 },
}

const LONG_PREFIX: u128 = 1;
const SHORT_PREFIX: u128 = 2;
const WITHDRAWAL_PREFIX: u128 = 3;

impl AssetId {
    /// Packs the class prefix and maturity into one integer identifier.
    pub fn to_raw(self) -> u128 {
        match self {
            AssetId::LpShare => 0,
            AssetId::Long { maturity_time } => (LONG_PREFIX << 64) | maturity_time as u128,
            AssetId::Short { maturity_time } => (SHORT_PREFIX << 64) | maturity_time as u128,
            AssetId::WithdrawalShare => WITHDRAWAL_PREFIX << 64,
        }
    }

    pub fn from_raw(raw: u128) -> Option<AssetId> {
        let prefix = raw >> 64;
        let maturity_time = raw as u64;
        match (prefix, maturity_time) {
            (0, 0) => Some(AssetId::LpShare),
            (LONG_PREFIX, m) => Some(AssetId::Long { maturity_time: m }),
            (SHORT_PREFIX, m) => Some(AssetId::Short { maturity_time: m }),
            (WITHDRAWAL_PREFIX, 0) => Some(AssetId::WithdrawalShare),
            _ => None,
        }
    }
}

/// Balance table with per-asset supply tracking and operator approvals.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionLedger {
    balances: BTreeMap<AssetId, BTreeMap<AccountId, FixedPoint>>,
    total_supply: BTreeMap<AssetId, FixedPoint>,
    /// (owner, spender, asset) -> remaining allowance.
    approvals: BTreeMap<(AccountId, AccountId, AssetId), FixedPoint>,
    /// Operators approved for every asset an owner holds.
    operators: BTreeSet<(AccountId, AccountId)>,
}

impl PositionLedger {
    pub fn new() -> PositionLedger {
        PositionLedger::default()
    }

    pub fn balance_of(&self, owner: AccountId, asset: AssetId) -> FixedPoint {
        self.balances
            .get(&asset)
            .and_then(|holders| holders.get(&owner))
            .copied()
            .unwrap_or_else(FixedPoint::zero)
    }

    pub fn total_supply(&self, asset: AssetId) -> FixedPoint {
        self.total_supply
            .get(&asset)
            .copied()
            .unwrap_or_else(FixedPoint::zero)
    }

    pub fn mint(&mut self, asset: AssetId, to: AccountId, amount: FixedPoint) {
        if amount.is_zero() {
            return;
        }
        let holders = self.balances.entry(asset).or_default();
        let balance = holders.entry(to).or_insert_with(FixedPoint::zero);
        *balance += amount;
        let supply = self
            .total_supply
            .entry(asset)
            .or_insert_with(FixedPoint::zero);
        *supply += amount;
    }

    pub fn burn(&mut self, asset: AssetId, from: AccountId, amount: FixedPoint) -> CoreResult<()> {
        if amount.is_zero() {
            return Ok(());
        }
        let balance = self
            .balances
            .get_mut(&asset)
            .and_then(|holders| holders.get_mut(&from))
            .ok_or(CoreError::InsufficientBalance)?;
        if *balance < amount {
            return Err(CoreError::InsufficientBalance);
        }
        *balance -= amount;
        // The supply entry exists whenever a balance does.
        let supply = self
            .total_supply
            .get_mut(&asset)
            .ok_or(CoreError::InsufficientBalance)?;
        *supply -= amount;
        Ok(())
    }

    /// Moves a balance. `caller` must be the owner, an approved-for-all
    /// operator, or hold a sufficient per-asset allowance (which is then
    /// reduced).
    pub fn transfer_from(
        &mut self,
        asset: AssetId,
        from: AccountId,
        to: AccountId,
        amount: FixedPoint,
        caller: AccountId,
    ) -> CoreResult<()> {
        if amount.is_zero() {
            return Ok(());
        }
        if self.balance_of(from, asset) < amount {
            return Err(CoreError::InsufficientBalance);
        }
        if caller != from && !self.operators.contains(&(from, caller)) {
            let allowance = self
                .approvals
                .get_mut(&(from, caller, asset))
                .ok_or(CoreError::NotApproved)?;
            if *allowance < amount {
                return Err(CoreError::NotApproved);
            }
            *allowance -= amount;
        }

        let holders = self.balances.entry(asset).or_default();
        *holders.get_mut(&from).ok_or(CoreError::InsufficientBalance)? -= amount;
        *holders.entry(to).or_insert_with(FixedPoint::zero) += amount;
        Ok(())
    }

    /// Sets `spender`'s allowance over one of `owner`'s assets.
    pub fn approve(
        &mut self,
        owner: AccountId,
        spender: AccountId,
        asset: AssetId,
        amount: FixedPoint,
    ) {
        if amount.is_zero() {
            self.approvals.remove(&(owner, spender, asset));
        } else {
            self.approvals.insert((owner, spender, asset), amount);
        }
    }

    /// Grants or revokes `operator`'s control over every asset of `owner`.
    pub fn set_approval_for_all(&mut self, owner: AccountId, operator: AccountId, approved: bool) {
        if approved {
            self.operators.insert((owner, operator));
        } else {
            self.operators.remove(&(owner, operator));
        }
    }

    pub fn is_approved_for_all(&self, owner: AccountId, operator: AccountId) -> bool {
        self.operators.contains(&(owner, operator))
    }

    pub fn allowance(&self, owner: AccountId, spender: AccountId, asset: AssetId) -> FixedPoint {
        self.approvals
            .get(&(owner, spender, asset))
            .copied()
            .unwrap_or_else(FixedPoint::zero)
    }

    /// Checks `sum(balances) == total_supply` for every asset. Test hook for
    /// the conservation invariant.
    pub fn check_conservation(&self) -> bool {
        for (asset, supply) in &self.total_supply {
            let sum = self
                .balances
                .get(asset)
                .map(|holders| {
                    holders
                        .values()
                        .fold(FixedPoint::zero(), |acc, b| acc + *b)
                })
                .unwrap_or_else(FixedPoint::zero);
            if sum != *supply {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(s: &str) -> FixedPoint {
        s.parse().unwrap()
    }

    #[test]
    fn asset_id_raw_round_trip() {
        let assets = [
            AssetId::LpShare,
            AssetId::WithdrawalShare,
            AssetId::Long { maturity_time: 86400 },
            AssetId::Short { maturity_time: 31536000 },
        ];
        for asset in assets {
            assert_eq!(AssetId::from_raw(asset.to_raw()), Some(asset));
        }
        assert_eq!(AssetId::from_raw(99 << 64), None);
    }

    #[test]
    fn mint_burn_conserve_supply() {
        let mut ledger = PositionLedger::new();
        let alice = AccountId::from_low_u64(1);
        let bob = AccountId::from_low_u64(2);
        let asset = AssetId::Long { maturity_time: 86400 };

        ledger.mint(asset, alice, fp("100"));
        ledger.mint(asset, bob, fp("50"));
        assert_eq!(ledger.total_supply(asset), fp("150"));
        assert!(ledger.check_conservation());

        ledger.burn(asset, alice, fp("40")).unwrap();
        assert_eq!(ledger.balance_of(alice, asset), fp("60"));
        assert_eq!(ledger.total_supply(asset), fp("110"));
        assert!(ledger.check_conservation());

        assert_eq!(
            ledger.burn(asset, bob, fp("51")),
            Err(CoreError::InsufficientBalance)
        );
    }

    #[test]
    fn transfer_requires_approval() {
        let mut ledger = PositionLedger::new();
        let alice = AccountId::from_low_u64(1);
        let bob = AccountId::from_low_u64(2);
        let carol = AccountId::from_low_u64(3);
        let asset = AssetId::LpShare;

        ledger.mint(asset, alice, fp("100"));

        // Strangers cannot move the balance.
        assert_eq!(
            ledger.transfer_from(asset, alice, bob, fp("10"), carol),
            Err(CoreError::NotApproved)
        );

        // A per-asset allowance is consumed by the transfer.
        ledger.approve(alice, carol, asset, fp("25"));
        ledger
            .transfer_from(asset, alice, bob, fp("10"), carol)
            .unwrap();
        assert_eq!(ledger.allowance(alice, carol, asset), fp("15"));
        assert_eq!(
            ledger.transfer_from(asset, alice, bob, fp("20"), carol),
            Err(CoreError::NotApproved)
        );

        // An operator moves anything.
        ledger.set_approval_for_all(alice, carol, true);
        ledger
            .transfer_from(asset, alice, bob, fp("20"), carol)
            .unwrap();
        assert_eq!(ledger.balance_of(bob, asset), fp("30"));
        assert!(ledger.check_conservation());
    }

    #[test]
    fn owner_transfers_freely() {
        let mut ledger = PositionLedger::new();
        let alice = AccountId::from_low_u64(1);
        let bob = AccountId::from_low_u64(2);
        let asset = AssetId::Short { maturity_time: 86400 };

        ledger.mint(asset, alice, fp("5"));
        ledger
            .transfer_from(asset, alice, bob, fp("5"), alice)
            .unwrap();
        assert_eq!(ledger.balance_of(alice, asset), FixedPoint::zero());
        assert_eq!(ledger.balance_of(bob, asset), fp("5"));
    }
}
