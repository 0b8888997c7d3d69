//! Time-bucketed checkpoints.
//!
//! Every position matures on a checkpoint boundary, so one checkpoint record
//! settles every position maturing in its bucket at once. Checkpoints are
//! created lazily by the first operation that touches a bucket and are never
//! deleted; the recorded vault share price is immutable once set.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use termflow_math::FixedPoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Vault share price observed when this checkpoint was first created.
    /// Immutable afterwards.
    pub vault_share_price: FixedPoint,
    /// Face value of longs maturing in this bucket that are still unsettled.
    pub longs_outstanding: FixedPoint,
    /// Face value of shorts maturing in this bucket that are still
    /// unsettled.
    pub shorts_outstanding: FixedPoint,
    /// Base the LPs paid to back the shorts in this bucket.
    pub short_base_volume: FixedPoint,
    /// Whether maturity settlement has run for this bucket.
    pub settled: bool,
    /// Aggregate base proceeds recorded for settled shorts, apportioned to
    /// holders on redemption.
    pub settled_short_proceeds: FixedPoint,
    /// Face value of shorts settled at maturity, the denominator for
    /// apportioning `settled_short_proceeds`.
    pub settled_shorts: FixedPoint,
}

impl Checkpoint {
    fn new(vault_share_price: FixedPoint) -> Checkpoint {
        Checkpoint {
            vault_share_price,
            longs_outstanding: FixedPoint::zero(),
            shorts_outstanding: FixedPoint::zero(),
            short_base_volume: FixedPoint::zero(),
            settled: false,
            settled_short_proceeds: FixedPoint::zero(),
            settled_shorts: FixedPoint::zero(),
        }
    }
}

/// Append-only map from bucket time to checkpoint record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointLedger {
    checkpoints: BTreeMap<u64, Checkpoint>,
}

impl CheckpointLedger {
    pub fn new() -> CheckpointLedger {
        CheckpointLedger::default()
    }

    pub fn get(&self, checkpoint_time: u64) -> Option<&Checkpoint> {
        self.checkpoints.get(&checkpoint_time)
    }

    pub fn get_mut(&mut self, checkpoint_time: u64) -> Option<&mut Checkpoint> {
        self.checkpoints.get_mut(&checkpoint_time)
    }

    /// Creates the bucket if it does not exist, recording `vault_share_price`
    /// as its price. Idempotent: a later call with a different price returns
    /// the existing record untouched.
    ///
    /// A bucket may be created ahead of its time by position volume tracking
    /// (maturities land in future buckets); such records carry a zero price
    /// until the first operation at or after the bucket time observes one.
    /// Once non-zero, the price never changes.
    pub fn get_or_create(
        &mut self,
        checkpoint_time: u64,
        vault_share_price: FixedPoint,
    ) -> &mut Checkpoint {
        let checkpoint = self
            .checkpoints
            .entry(checkpoint_time)
            .or_insert_with(|| Checkpoint::new(vault_share_price));
        if checkpoint.vault_share_price.is_zero() {
            checkpoint.vault_share_price = vault_share_price;
        }
        checkpoint
    }

    /// The recorded share price for a bucket, if the bucket exists.
    pub fn vault_share_price(&self, checkpoint_time: u64) -> Option<FixedPoint> {
        self.get(checkpoint_time).map(|c| c.vault_share_price)
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u64, &Checkpoint)> {
        self.checkpoints.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(s: &str) -> FixedPoint {
        s.parse().unwrap()
    }

    #[test]
    fn creation_is_idempotent() {
        let mut ledger = CheckpointLedger::new();
        ledger.get_or_create(86400, fp("1.05"));
        // A second touch with a different observed price changes nothing.
        ledger.get_or_create(86400, fp("1.10"));
        assert_eq!(ledger.vault_share_price(86400), Some(fp("1.05")));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn buckets_are_independent() {
        let mut ledger = CheckpointLedger::new();
        ledger.get_or_create(0, fp("1"));
        ledger.get_or_create(86400, fp("1.01"));
        ledger.get_or_create(86400, fp("9.99")).longs_outstanding = fp("100");
        assert_eq!(ledger.vault_share_price(0), Some(fp("1")));
        assert_eq!(ledger.get(86400).unwrap().longs_outstanding, fp("100"));
        assert!(ledger.get(2 * 86400).is_none());
    }
}
