//! The pool controller.
//!
//! Orchestrates the math layer, the checkpoint ledger, the position ledger,
//! and the yield source into the externally callable operations. Every
//! operation follows the same shape: advance the current checkpoint,
//! validate inputs, compute deltas on a pure snapshot, apply the deltas to
//! the market state and the ledger in one contiguous block, then move value
//! through the yield source. No external call separates the delta
//! computation from the state writes; the single vault transfer comes last,
//! and if it fails the saved pre-operation state is restored, so every
//! operation is all-or-nothing. (The checkpoint advance commits on its own:
//! it is identical to an explicit `checkpoint` call preceding the
//! operation.)

use termflow_math::{FixedPoint, I256};
use tracing::{debug, info};

use crate::checkpoint::CheckpointLedger;
use crate::config::PoolConfig;
use crate::curve::YieldSpace;
use crate::errors::{CoreError, CoreResult};
use crate::ledger::{AccountId, AssetId, PositionLedger};
use crate::lp::calculate_initial_bond_reserves;
use crate::short::short_proceeds;
use crate::state::{update_weighted_average, MarketState, PoolState, WithdrawalPool};
use crate::vault::YieldSource;

/// Per-operation caller configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TradeOptions {
    /// Account credited with the operation's output.
    pub destination: AccountId,
    /// Whether value moves in the base asset (`true`) or in yield-source
    /// shares (`false`).
    pub as_base: bool,
}

impl TradeOptions {
    pub fn base_to(destination: AccountId) -> TradeOptions {
        TradeOptions {
            destination,
            as_base: true,
        }
    }

    pub fn shares_to(destination: AccountId) -> TradeOptions {
        TradeOptions {
            destination,
            as_base: false,
        }
    }
}

/// Copy of every pool field an operation can write, captured before the
/// operation's state block and restored if the trailing vault transfer
/// fails.
struct Saved {
    market: MarketState,
    checkpoints: CheckpointLedger,
    ledger: PositionLedger,
    withdrawal_pool: WithdrawalPool,
    governance_fees_accrued: FixedPoint,
    initialized: bool,
}

/// A fixed-rate term pool over one yield source.
#[derive(Debug, Clone)]
pub struct Pool<Y: YieldSource> {
    config: PoolConfig,
    market: MarketState,
    checkpoints: CheckpointLedger,
    ledger: PositionLedger,
    withdrawal_pool: WithdrawalPool,
    /// Governance's accrued fee take, in vault shares.
    governance_fees_accrued: FixedPoint,
    vault: Y,
    initialized: bool,
}

impl<Y: YieldSource> Pool<Y> {
    pub fn new(config: PoolConfig, vault: Y) -> CoreResult<Pool<Y>> {
        config.validate()?;
        Ok(Pool {
            config,
            market: MarketState::default(),
            checkpoints: CheckpointLedger::new(),
            ledger: PositionLedger::new(),
            withdrawal_pool: WithdrawalPool::default(),
            governance_fees_accrued: FixedPoint::zero(),
            vault,
            initialized: false,
        })
    }

    // ========================================================================
    // Views
    // ========================================================================

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn market(&self) -> &MarketState {
        &self.market
    }

    pub fn withdrawal_pool(&self) -> &WithdrawalPool {
        &self.withdrawal_pool
    }

    pub fn checkpoints(&self) -> &CheckpointLedger {
        &self.checkpoints
    }

    pub fn ledger(&self) -> &PositionLedger {
        &self.ledger
    }

    pub fn vault(&self) -> &Y {
        &self.vault
    }

    /// Mutable access to the yield source, for hosts that drive accrual
    /// (and for tests).
    pub fn vault_mut(&mut self) -> &mut Y {
        &mut self.vault
    }

    pub fn governance_fees_accrued(&self) -> FixedPoint {
        self.governance_fees_accrued
    }

    pub fn balance_of(&self, owner: AccountId, asset: AssetId) -> FixedPoint {
        self.ledger.balance_of(owner, asset)
    }

    pub fn total_supply(&self, asset: AssetId) -> FixedPoint {
        self.ledger.total_supply(asset)
    }

    /// A pure snapshot for pricing; fails if the yield source's oracle is
    /// unavailable.
    pub fn snapshot(&self) -> CoreResult<PoolState> {
        Ok(PoolState {
            config: self.config,
            market: self.market,
            vault_share_price: self.vault.vault_share_price()?,
        })
    }

    pub fn latest_checkpoint(&self, now: u64) -> u64 {
        self.config.to_checkpoint(now)
    }

    /// Maturity assigned to positions opened at `now`.
    pub fn maturity_time_from(&self, now: u64) -> u64 {
        self.latest_checkpoint(now) + self.config.position_duration
    }

    pub fn spot_price(&self) -> CoreResult<FixedPoint> {
        Ok(self.snapshot()?.spot_price())
    }

    pub fn spot_rate(&self) -> CoreResult<FixedPoint> {
        Ok(self.snapshot()?.calculate_spot_rate())
    }

    pub fn present_value(&self, now: u64) -> CoreResult<FixedPoint> {
        self.snapshot()?.calculate_present_value(now)
    }

    /// Present value per active LP share.
    pub fn lp_share_price(&self, now: u64) -> CoreResult<FixedPoint> {
        let supply = self.active_lp_supply();
        if supply.is_zero() {
            return Ok(FixedPoint::zero());
        }
        Ok(self.present_value(now)?.div_down(supply))
    }

    // ========================================================================
    // Position ledger surface
    // ========================================================================

    pub fn transfer_from(
        &mut self,
        asset: AssetId,
        from: AccountId,
        to: AccountId,
        amount: FixedPoint,
        caller: AccountId,
    ) -> CoreResult<()> {
        self.ledger.transfer_from(asset, from, to, amount, caller)
    }

    pub fn approve(
        &mut self,
        owner: AccountId,
        spender: AccountId,
        asset: AssetId,
        amount: FixedPoint,
    ) {
        self.ledger.approve(owner, spender, asset, amount);
    }

    pub fn set_approval_for_all(
        &mut self,
        owner: AccountId,
        operator: AccountId,
        approved: bool,
    ) {
        self.ledger.set_approval_for_all(owner, operator, approved);
    }

    // ========================================================================
    // Admin
    // ========================================================================

    /// Blocks position-opening and liquidity-adding operations. Closes and
    /// redemptions keep working.
    pub fn set_paused(&mut self, paused: bool) {
        self.market.is_paused = paused;
    }

    /// Drains governance's accrued fees, paying them out in the requested
    /// form.
    pub fn collect_governance_fee(&mut self, options: TradeOptions) -> CoreResult<FixedPoint> {
        let shares = self.governance_fees_accrued;
        if shares.is_zero() {
            return Ok(FixedPoint::zero());
        }
        let saved = self.save();
        self.governance_fees_accrued = FixedPoint::zero();
        let output = self.commit_withdraw(saved, shares, options.as_base)?;
        debug!(output = %output, "governance fees collected");
        Ok(output)
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Seeds the pool with its first liquidity and prices the curve at
    /// `target_rate`. Returns the LP shares minted to the destination.
    pub fn initialize(
        &mut self,
        contribution: FixedPoint,
        target_rate: FixedPoint,
        now: u64,
        options: TradeOptions,
    ) -> CoreResult<FixedPoint> {
        if self.initialized {
            return Err(CoreError::AlreadyInitialized);
        }
        if contribution.is_zero() {
            return Err(CoreError::ZeroAmount);
        }

        let share_contribution = if options.as_base {
            self.vault.convert_to_shares(contribution)?
        } else {
            contribution
        };
        // The reserve floor is locked twice over: once as unowned reserves
        // and once as burned LP shares.
        let two_floors = self.config.minimum_share_reserves + self.config.minimum_share_reserves;
        if share_contribution <= two_floors {
            return Err(CoreError::BelowMinimumTransaction);
        }

        let vault_share_price = self.vault.vault_share_price()?;
        let saved = self.save();

        self.market.share_reserves = share_contribution;
        self.market.bond_reserves =
            calculate_initial_bond_reserves(&self.config, share_contribution, target_rate);
        self.initialized = true;

        self.checkpoints
            .get_or_create(self.latest_checkpoint(now), vault_share_price)
            .settled = true;

        let lp_shares = share_contribution - two_floors;
        self.ledger.mint(
            AssetId::LpShare,
            AccountId::zero(),
            self.config.minimum_share_reserves,
        );
        self.ledger
            .mint(AssetId::LpShare, options.destination, lp_shares);

        self.commit_deposit(saved, contribution, options.as_base)?;

        info!(
            contribution = %share_contribution,
            target_rate = %target_rate,
            bond_reserves = %self.market.bond_reserves,
            "pool initialized"
        );
        Ok(lp_shares)
    }

    /// Opens a long with a deposit of `amount` (base or shares per
    /// `options`). Returns the maturity time and the bonds minted.
    pub fn open_long(
        &mut self,
        amount: FixedPoint,
        min_output: FixedPoint,
        now: u64,
        options: TradeOptions,
    ) -> CoreResult<(u64, FixedPoint)> {
        self.ensure_initialized()?;
        self.ensure_not_paused()?;
        if amount.is_zero() {
            return Err(CoreError::ZeroAmount);
        }

        let latest = self.latest_checkpoint(now);
        self.apply_checkpoint(latest, now)?;

        let state = self.snapshot()?;
        let base_amount = if options.as_base {
            amount
        } else {
            self.vault.convert_to_base(amount)?
        };
        if base_amount < self.config.minimum_transaction_amount {
            return Err(CoreError::BelowMinimumTransaction);
        }

        let open = state.calculate_open_long(base_amount)?;
        if open.bond_proceeds < min_output {
            return Err(CoreError::OutputBelowMinimum);
        }

        // The new face value must stay covered by the reserves.
        let new_share_reserves = self.market.share_reserves + open.share_reserves_delta;
        let new_exposure = self.market.long_exposure + open.bond_proceeds;
        if new_share_reserves
            < self.config.minimum_share_reserves
                + new_exposure.div_up(state.vault_share_price)
        {
            return Err(CoreError::InsufficientLiquidity);
        }

        let maturity_time = latest + self.config.position_duration;
        let saved = self.save();

        self.market.long_average_maturity_time = update_weighted_average(
            self.market.long_average_maturity_time,
            self.market.longs_outstanding,
            crate::constants::scaled_seconds(maturity_time),
            open.bond_proceeds,
            true,
        );
        self.market.share_reserves = new_share_reserves;
        self.market.bond_reserves = self.market.bond_reserves - open.bond_reserves_delta;
        self.market.longs_outstanding += open.bond_proceeds;
        self.market.long_exposure = new_exposure;
        self.governance_fees_accrued += open.governance_fee_shares;

        self.checkpoints
            .get_or_create(maturity_time, FixedPoint::zero())
            .longs_outstanding += open.bond_proceeds;
        self.ledger.mint(
            AssetId::Long { maturity_time },
            options.destination,
            open.bond_proceeds,
        );

        self.commit_deposit(saved, amount, options.as_base)?;

        debug!(
            base_amount = %base_amount,
            bond_proceeds = %open.bond_proceeds,
            maturity_time,
            share_reserves = %self.market.share_reserves,
            "long opened"
        );
        Ok((maturity_time, open.bond_proceeds))
    }

    /// Closes `bond_amount` of the owner's long. Before maturity the bonds
    /// trade against the curve; at or after maturity they redeem from the
    /// settled checkpoint at face value. Returns the output in the requested
    /// form.
    pub fn close_long(
        &mut self,
        owner: AccountId,
        maturity_time: u64,
        bond_amount: FixedPoint,
        min_output: FixedPoint,
        now: u64,
        options: TradeOptions,
    ) -> CoreResult<FixedPoint> {
        self.ensure_initialized()?;
        self.validate_close_amount(bond_amount)?;
        self.validate_maturity(maturity_time)?;

        let latest = self.latest_checkpoint(now);
        self.apply_checkpoint(latest, now)?;

        let asset = AssetId::Long { maturity_time };
        if self.ledger.balance_of(owner, asset) < bond_amount {
            return Err(CoreError::InsufficientBalance);
        }

        let output = if maturity_time <= latest {
            // Matured: settle the maturity bucket if nothing has yet, then
            // redeem face value (net of the flat fee levied at settlement)
            // from the zombie reserves.
            self.apply_checkpoint(maturity_time, now)?;
            let base_owed =
                bond_amount - bond_amount.mul_down(self.config.fees.flat);
            let vault_share_price = self.vault.vault_share_price()?;
            let share_proceeds = base_owed.div_down(vault_share_price);

            let output = self.preview_output(share_proceeds, options.as_base)?;
            if output < min_output {
                return Err(CoreError::OutputBelowMinimum);
            }

            let saved = self.save();
            self.ledger.burn(asset, owner, bond_amount)?;
            self.market.zombie_base_proceeds =
                self.market.zombie_base_proceeds.saturating_sub(base_owed);
            self.market.zombie_share_reserves = self
                .market
                .zombie_share_reserves
                .saturating_sub(share_proceeds);

            self.commit_withdraw(saved, share_proceeds, options.as_base)?;
            output
        } else {
            let state = self.snapshot()?;
            let close = state.calculate_close_long(bond_amount, maturity_time, now)?;

            let new_share_reserves = self
                .market
                .share_reserves
                .saturating_sub(close.share_reserves_delta);
            if new_share_reserves < self.config.minimum_share_reserves {
                return Err(CoreError::InsufficientLiquidity);
            }

            let output = self.preview_output(close.share_proceeds, options.as_base)?;
            if output < min_output {
                return Err(CoreError::OutputBelowMinimum);
            }

            let saved = self.save();
            self.ledger.burn(asset, owner, bond_amount)?;
            self.market.long_average_maturity_time = update_weighted_average(
                self.market.long_average_maturity_time,
                self.market.longs_outstanding,
                crate::constants::scaled_seconds(maturity_time),
                bond_amount,
                false,
            );
            self.market.share_reserves = new_share_reserves;
            self.market.share_adjustment =
                self.market.share_adjustment - I256::from(close.flat_shares);
            self.market.bond_reserves += close.bond_reserves_delta;
            self.market.longs_outstanding =
                self.market.longs_outstanding.saturating_sub(bond_amount);
            self.market.long_exposure = self.market.long_exposure.saturating_sub(bond_amount);
            self.governance_fees_accrued += close.governance_fee_shares;

            if let Some(checkpoint) = self.checkpoints.get_mut(maturity_time) {
                checkpoint.longs_outstanding =
                    checkpoint.longs_outstanding.saturating_sub(bond_amount);
            }

            self.commit_withdraw(saved, close.share_proceeds, options.as_base)?;
            output
        };

        self.distribute_excess_idle(now);
        debug!(
            bond_amount = %bond_amount,
            maturity_time,
            output = %output,
            "long closed"
        );
        Ok(output)
    }

    /// Opens a short of `bond_amount` bonds, depositing margin capped at
    /// `max_deposit` (in the requested form). Returns the maturity time and
    /// the deposit taken.
    pub fn open_short(
        &mut self,
        bond_amount: FixedPoint,
        max_deposit: FixedPoint,
        now: u64,
        options: TradeOptions,
    ) -> CoreResult<(u64, FixedPoint)> {
        self.ensure_initialized()?;
        self.ensure_not_paused()?;
        if bond_amount.is_zero() {
            return Err(CoreError::ZeroAmount);
        }
        if bond_amount < self.config.minimum_transaction_amount {
            return Err(CoreError::BelowMinimumTransaction);
        }

        let latest = self.latest_checkpoint(now);
        self.apply_checkpoint(latest, now)?;

        let state = self.snapshot()?;
        let open_vault_share_price = self
            .checkpoints
            .vault_share_price(latest)
            .unwrap_or_else(FixedPoint::zero);
        let open = state.calculate_open_short(bond_amount, open_vault_share_price)?;

        let new_share_reserves = self
            .market
            .share_reserves
            .saturating_sub(open.share_reserves_delta);
        if new_share_reserves
            < self.config.minimum_share_reserves
                + self.market.long_exposure.div_up(state.vault_share_price)
        {
            return Err(CoreError::InsufficientLiquidity);
        }

        let deposit_amount = if options.as_base {
            open.base_deposit
        } else {
            self.vault.convert_to_shares(open.base_deposit)?
        };
        if deposit_amount > max_deposit {
            return Err(CoreError::DepositAboveMaximum);
        }

        let maturity_time = latest + self.config.position_duration;
        let saved = self.save();

        self.market.short_average_maturity_time = update_weighted_average(
            self.market.short_average_maturity_time,
            self.market.shorts_outstanding,
            crate::constants::scaled_seconds(maturity_time),
            bond_amount,
            true,
        );
        self.market.share_reserves = new_share_reserves;
        self.market.bond_reserves += open.bond_reserves_delta;
        self.market.shorts_outstanding += bond_amount;
        self.market.short_base_volume += open.base_volume;
        self.governance_fees_accrued += open.governance_fee_shares;

        let checkpoint = self
            .checkpoints
            .get_or_create(maturity_time, FixedPoint::zero());
        checkpoint.shorts_outstanding += bond_amount;
        checkpoint.short_base_volume += open.base_volume;
        self.ledger.mint(
            AssetId::Short { maturity_time },
            options.destination,
            bond_amount,
        );

        self.commit_deposit(saved, deposit_amount, options.as_base)?;

        debug!(
            bond_amount = %bond_amount,
            deposit = %open.base_deposit,
            maturity_time,
            "short opened"
        );
        Ok((maturity_time, deposit_amount))
    }

    /// Closes `bond_amount` of the owner's short. Returns the output in the
    /// requested form.
    pub fn close_short(
        &mut self,
        owner: AccountId,
        maturity_time: u64,
        bond_amount: FixedPoint,
        min_output: FixedPoint,
        now: u64,
        options: TradeOptions,
    ) -> CoreResult<FixedPoint> {
        self.ensure_initialized()?;
        self.validate_close_amount(bond_amount)?;
        self.validate_maturity(maturity_time)?;

        let latest = self.latest_checkpoint(now);
        self.apply_checkpoint(latest, now)?;

        let asset = AssetId::Short { maturity_time };
        if self.ledger.balance_of(owner, asset) < bond_amount {
            return Err(CoreError::InsufficientBalance);
        }

        let output = if maturity_time <= latest {
            // Matured: the bucket's settlement recorded the aggregate
            // proceeds; redeem this position's proportional slice.
            self.apply_checkpoint(maturity_time, now)?;
            let checkpoint = self
                .checkpoints
                .get(maturity_time)
                .copied()
                .ok_or(CoreError::InsufficientBalance)?;
            let base_owed = if checkpoint.settled_shorts.is_zero() {
                FixedPoint::zero()
            } else {
                checkpoint
                    .settled_short_proceeds
                    .mul_div_down(bond_amount, checkpoint.settled_shorts)
            };
            let vault_share_price = self.vault.vault_share_price()?;
            let share_proceeds = base_owed.div_down(vault_share_price);

            let output = self.preview_output(share_proceeds, options.as_base)?;
            if output < min_output {
                return Err(CoreError::OutputBelowMinimum);
            }

            let saved = self.save();
            self.ledger.burn(asset, owner, bond_amount)?;
            self.market.zombie_base_proceeds =
                self.market.zombie_base_proceeds.saturating_sub(base_owed);
            self.market.zombie_share_reserves = self
                .market
                .zombie_share_reserves
                .saturating_sub(share_proceeds);

            if !share_proceeds.is_zero() {
                self.commit_withdraw(saved, share_proceeds, options.as_base)?;
            }
            output
        } else {
            let state = self.snapshot()?;
            let open_vault_share_price = maturity_time
                .checked_sub(self.config.position_duration)
                .and_then(|t| self.checkpoints.vault_share_price(t))
                .filter(|p| !p.is_zero())
                .unwrap_or(state.vault_share_price);
            let close = state.calculate_close_short(
                bond_amount,
                open_vault_share_price,
                state.vault_share_price,
                maturity_time,
                now,
            )?;

            let output = self.preview_output(close.share_proceeds, options.as_base)?;
            if output < min_output {
                return Err(CoreError::OutputBelowMinimum);
            }

            let saved = self.save();
            self.ledger.burn(asset, owner, bond_amount)?;
            self.market.short_average_maturity_time = update_weighted_average(
                self.market.short_average_maturity_time,
                self.market.shorts_outstanding,
                crate::constants::scaled_seconds(maturity_time),
                bond_amount,
                false,
            );
            self.market.share_reserves = self.market.share_reserves + close.share_payment
                - close.governance_fee_shares;
            self.market.share_adjustment =
                self.market.share_adjustment + I256::from(close.flat_shares);
            self.market.bond_reserves = self
                .market
                .bond_reserves
                .saturating_sub(close.bond_reserves_delta);
            self.market.shorts_outstanding =
                self.market.shorts_outstanding.saturating_sub(bond_amount);
            self.governance_fees_accrued += close.governance_fee_shares;

            // Release this position's slice of the recorded base volume.
            if let Some(checkpoint) = self.checkpoints.get_mut(maturity_time) {
                let released = if checkpoint.shorts_outstanding.is_zero() {
                    FixedPoint::zero()
                } else {
                    checkpoint
                        .short_base_volume
                        .mul_div_down(bond_amount, checkpoint.shorts_outstanding)
                };
                checkpoint.short_base_volume =
                    checkpoint.short_base_volume.saturating_sub(released);
                checkpoint.shorts_outstanding =
                    checkpoint.shorts_outstanding.saturating_sub(bond_amount);
                self.market.short_base_volume =
                    self.market.short_base_volume.saturating_sub(released);
            }

            if !close.share_proceeds.is_zero() {
                self.commit_withdraw(saved, close.share_proceeds, options.as_base)?;
            }
            output
        };

        self.distribute_excess_idle(now);
        debug!(
            bond_amount = %bond_amount,
            maturity_time,
            output = %output,
            "short closed"
        );
        Ok(output)
    }

    /// Adds liquidity at the prevailing LP share price. Returns the LP
    /// shares minted.
    pub fn add_liquidity(
        &mut self,
        contribution: FixedPoint,
        min_lp_share_price: FixedPoint,
        now: u64,
        options: TradeOptions,
    ) -> CoreResult<FixedPoint> {
        self.ensure_initialized()?;
        self.ensure_not_paused()?;
        if contribution.is_zero() {
            return Err(CoreError::ZeroAmount);
        }

        let latest = self.latest_checkpoint(now);
        self.apply_checkpoint(latest, now)?;

        let share_contribution = if options.as_base {
            self.vault.convert_to_shares(contribution)?
        } else {
            contribution
        };
        if share_contribution < self.config.minimum_transaction_amount {
            return Err(CoreError::BelowMinimumTransaction);
        }

        let state = self.snapshot()?;
        let starting_present_value = state.calculate_present_value(now)?;
        let active_supply = self.active_lp_supply();
        if starting_present_value.is_zero() || active_supply.is_zero() {
            return Err(CoreError::InsufficientLiquidity);
        }
        let lp_share_price = starting_present_value.div_down(active_supply);
        if lp_share_price < min_lp_share_price {
            return Err(CoreError::LpSharePriceBelowMinimum);
        }

        // LP shares are priced off the present-value change the deposit
        // causes, so contributions at different vault share prices buy value
        // on equal terms.
        let mut ending_state = state;
        ending_state.market.share_reserves += share_contribution;
        let ending_present_value = ending_state.calculate_present_value(now)?;
        if ending_present_value <= starting_present_value {
            return Err(CoreError::InsufficientLiquidity);
        }
        let lp_shares = active_supply.mul_div_down(
            ending_present_value - starting_present_value,
            starting_present_value,
        );

        let saved = self.save();
        self.market.share_reserves += share_contribution;
        self.ledger
            .mint(AssetId::LpShare, options.destination, lp_shares);
        self.commit_deposit(saved, contribution, options.as_base)?;

        debug!(
            contribution = %share_contribution,
            lp_shares = %lp_shares,
            lp_share_price = %lp_share_price,
            "liquidity added"
        );
        Ok(lp_shares)
    }

    /// Burns LP shares for the holder's slice of the present value. Idle
    /// capital pays out immediately; the rest becomes withdrawal shares that
    /// redeem as positions close. Returns `(output, withdrawal_shares)`.
    pub fn remove_liquidity(
        &mut self,
        owner: AccountId,
        lp_shares: FixedPoint,
        min_output: FixedPoint,
        now: u64,
        options: TradeOptions,
    ) -> CoreResult<(FixedPoint, FixedPoint)> {
        self.ensure_initialized()?;
        if lp_shares.is_zero() {
            return Err(CoreError::ZeroAmount);
        }
        if self.ledger.balance_of(owner, AssetId::LpShare) < lp_shares {
            return Err(CoreError::InsufficientBalance);
        }

        let latest = self.latest_checkpoint(now);
        self.apply_checkpoint(latest, now)?;

        let state = self.snapshot()?;
        let present_value = state.calculate_present_value(now)?;
        let active_supply = self.active_lp_supply();
        if active_supply.is_zero() {
            return Err(CoreError::InsufficientLiquidity);
        }
        let share_proceeds = lp_shares.mul_div_down(present_value, active_supply);

        let idle = state.calculate_idle();
        let paid_shares = if share_proceeds <= idle {
            share_proceeds
        } else {
            idle
        };
        let withdrawal_shares = if share_proceeds > paid_shares && !share_proceeds.is_zero() {
            lp_shares.mul_div_down(share_proceeds - paid_shares, share_proceeds)
        } else {
            FixedPoint::zero()
        };

        let output = self.preview_output(paid_shares, options.as_base)?;
        if output < min_output {
            return Err(CoreError::OutputBelowMinimum);
        }

        let saved = self.save();
        self.ledger.burn(AssetId::LpShare, owner, lp_shares)?;
        self.market.share_reserves = self.market.share_reserves - paid_shares;
        if !withdrawal_shares.is_zero() {
            self.ledger.mint(
                AssetId::WithdrawalShare,
                options.destination,
                withdrawal_shares,
            );
        }
        if !paid_shares.is_zero() {
            self.commit_withdraw(saved, paid_shares, options.as_base)?;
        }

        self.distribute_excess_idle(now);
        debug!(
            lp_shares = %lp_shares,
            output = %output,
            withdrawal_shares = %withdrawal_shares,
            "liquidity removed"
        );
        Ok((output, withdrawal_shares))
    }

    /// Redeems withdrawal shares that have been matched with capital.
    /// Returns `(output, shares_redeemed)`.
    pub fn redeem_withdrawal_shares(
        &mut self,
        owner: AccountId,
        withdrawal_shares: FixedPoint,
        min_output: FixedPoint,
        now: u64,
        options: TradeOptions,
    ) -> CoreResult<(FixedPoint, FixedPoint)> {
        self.ensure_initialized()?;
        if withdrawal_shares.is_zero() {
            return Err(CoreError::ZeroAmount);
        }

        let latest = self.latest_checkpoint(now);
        self.apply_checkpoint(latest, now)?;

        let balance = self.ledger.balance_of(owner, AssetId::WithdrawalShare);
        let mut redeemed = withdrawal_shares;
        if balance < redeemed {
            redeemed = balance;
        }
        if self.withdrawal_pool.ready_to_withdraw < redeemed {
            redeemed = self.withdrawal_pool.ready_to_withdraw;
        }

        let payout_shares = if redeemed.is_zero() {
            FixedPoint::zero()
        } else {
            self.withdrawal_pool
                .proceeds
                .mul_div_down(redeemed, self.withdrawal_pool.ready_to_withdraw)
        };

        let output = self.preview_output(payout_shares, options.as_base)?;
        if output < min_output {
            return Err(CoreError::OutputBelowMinimum);
        }

        let saved = self.save();
        self.ledger
            .burn(AssetId::WithdrawalShare, owner, redeemed)?;
        self.withdrawal_pool.ready_to_withdraw =
            self.withdrawal_pool.ready_to_withdraw.saturating_sub(redeemed);
        self.withdrawal_pool.proceeds =
            self.withdrawal_pool.proceeds.saturating_sub(payout_shares);
        if !payout_shares.is_zero() {
            self.commit_withdraw(saved, payout_shares, options.as_base)?;
        }

        debug!(
            redeemed = %redeemed,
            output = %output,
            "withdrawal shares redeemed"
        );
        Ok((output, redeemed))
    }

    /// Creates (or re-touches) the checkpoint for `checkpoint_time`,
    /// settling every position that matures in its bucket. Idempotent.
    pub fn checkpoint(&mut self, checkpoint_time: u64, now: u64) -> CoreResult<()> {
        self.ensure_initialized()?;
        if checkpoint_time != self.config.to_checkpoint(checkpoint_time) {
            return Err(CoreError::InvalidCheckpointTime);
        }
        if checkpoint_time > now {
            return Err(CoreError::FutureCheckpoint);
        }
        self.apply_checkpoint(checkpoint_time, now)?;
        Ok(())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn ensure_initialized(&self) -> CoreResult<()> {
        if !self.initialized {
            return Err(CoreError::NotInitialized);
        }
        Ok(())
    }

    fn ensure_not_paused(&self) -> CoreResult<()> {
        if self.market.is_paused {
            return Err(CoreError::Paused);
        }
        Ok(())
    }

    fn validate_close_amount(&self, bond_amount: FixedPoint) -> CoreResult<()> {
        if bond_amount.is_zero() {
            return Err(CoreError::ZeroAmount);
        }
        if bond_amount < self.config.minimum_transaction_amount {
            return Err(CoreError::BelowMinimumTransaction);
        }
        Ok(())
    }

    fn validate_maturity(&self, maturity_time: u64) -> CoreResult<()> {
        if maturity_time == 0 || maturity_time % self.config.checkpoint_duration != 0 {
            return Err(CoreError::InvalidMaturityTime);
        }
        Ok(())
    }

    /// LP shares entitled to the present value: live LP shares plus
    /// withdrawal shares not yet matched with capital.
    fn active_lp_supply(&self) -> FixedPoint {
        let withdrawal_outstanding = self
            .ledger
            .total_supply(AssetId::WithdrawalShare)
            .saturating_sub(self.withdrawal_pool.ready_to_withdraw);
        self.ledger.total_supply(AssetId::LpShare) + withdrawal_outstanding
    }

    fn deposit(&mut self, amount: FixedPoint, as_base: bool) -> CoreResult<FixedPoint> {
        if as_base {
            self.vault.deposit_with_base(amount)
        } else {
            self.vault.deposit_with_shares(amount)
        }
    }

    /// Pays `share_amount` of vault shares out of the pool, returning the
    /// amount in the requested form.
    fn withdraw_shares(&mut self, share_amount: FixedPoint, as_base: bool) -> CoreResult<FixedPoint> {
        if as_base {
            let base = self.vault.convert_to_base(share_amount)?;
            self.vault.withdraw_with_shares(share_amount)?;
            Ok(base)
        } else {
            self.vault.withdraw_with_shares(share_amount)?;
            Ok(share_amount)
        }
    }

    fn preview_output(&self, share_amount: FixedPoint, as_base: bool) -> CoreResult<FixedPoint> {
        if as_base {
            self.vault.convert_to_base(share_amount)
        } else {
            Ok(share_amount)
        }
    }

    /// Captures the writable pool state ahead of an operation's state block.
    fn save(&self) -> Saved {
        Saved {
            market: self.market,
            checkpoints: self.checkpoints.clone(),
            ledger: self.ledger.clone(),
            withdrawal_pool: self.withdrawal_pool,
            governance_fees_accrued: self.governance_fees_accrued,
            initialized: self.initialized,
        }
    }

    fn restore(&mut self, saved: Saved) {
        self.market = saved.market;
        self.checkpoints = saved.checkpoints;
        self.ledger = saved.ledger;
        self.withdrawal_pool = saved.withdrawal_pool;
        self.governance_fees_accrued = saved.governance_fees_accrued;
        self.initialized = saved.initialized;
    }

    /// The operation's trailing deposit into the yield source. A failure
    /// restores the saved state, rolling the whole operation back.
    fn commit_deposit(
        &mut self,
        saved: Saved,
        amount: FixedPoint,
        as_base: bool,
    ) -> CoreResult<FixedPoint> {
        match self.deposit(amount, as_base) {
            Ok(shares) => Ok(shares),
            Err(error) => {
                self.restore(saved);
                Err(error)
            }
        }
    }

    /// The operation's trailing withdrawal from the yield source. A failure
    /// restores the saved state, rolling the whole operation back.
    fn commit_withdraw(
        &mut self,
        saved: Saved,
        share_amount: FixedPoint,
        as_base: bool,
    ) -> CoreResult<FixedPoint> {
        match self.withdraw_shares(share_amount, as_base) {
            Ok(output) => Ok(output),
            Err(error) => {
                self.restore(saved);
                Err(error)
            }
        }
    }

    /// Get-or-create the checkpoint for `checkpoint_time`, then run its
    /// one-time transition: settle the bucket's maturities, skim zombie
    /// interest, and distribute freed idle. Fails closed if the share price
    /// oracle is unavailable.
    fn apply_checkpoint(&mut self, checkpoint_time: u64, now: u64) -> CoreResult<FixedPoint> {
        let observed_price = self.vault.vault_share_price()?;
        let (needs_settlement, checkpoint_price) = {
            let checkpoint = self
                .checkpoints
                .get_or_create(checkpoint_time, observed_price);
            (!checkpoint.settled, checkpoint.vault_share_price)
        };
        if !needs_settlement {
            return Ok(checkpoint_price);
        }

        self.settle_matured(checkpoint_time, checkpoint_price);
        self.apply_zombie_interest(observed_price);
        if let Some(checkpoint) = self.checkpoints.get_mut(checkpoint_time) {
            checkpoint.settled = true;
        }
        self.distribute_excess_idle(now);

        debug!(
            checkpoint_time,
            price = %checkpoint_price,
            "checkpoint created"
        );
        Ok(checkpoint_price)
    }

    /// Settles all positions maturing at `checkpoint_time` using the
    /// bucket's recorded price. Proceeds move into the zombie reserve for
    /// holders to redeem; the LPs' side of each trade settles flat.
    fn settle_matured(&mut self, checkpoint_time: u64, checkpoint_price: FixedPoint) {
        let Some(checkpoint) = self.checkpoints.get(checkpoint_time) else {
            return;
        };
        let mut checkpoint = *checkpoint;
        let flat_fee_rate = self.config.fees.flat;
        let governance_rate = self.config.fees.governance_lp;

        let longs = checkpoint.longs_outstanding;
        if !longs.is_zero() {
            // Holders are owed face value net of the flat fee. The fee splits
            // between the LPs (their cut never leaves the reserves) and
            // governance, so the reserves part with exactly what the zombie
            // reserve and the fee accumulator gain.
            let base_owed = longs - longs.mul_down(flat_fee_rate);
            let zombie_shares = base_owed.div_down(checkpoint_price);
            let fee_shares = (longs - base_owed).div_down(checkpoint_price);
            let governance_fee = fee_shares.mul_down(governance_rate);

            let reserves_delta = zombie_shares + governance_fee;
            self.market.share_reserves = self.market.share_reserves - reserves_delta;
            self.market.share_adjustment =
                self.market.share_adjustment - I256::from(reserves_delta);
            self.governance_fees_accrued += governance_fee;

            self.market.zombie_base_proceeds += base_owed;
            self.market.zombie_share_reserves += zombie_shares;

            self.market.long_average_maturity_time = update_weighted_average(
                self.market.long_average_maturity_time,
                self.market.longs_outstanding,
                crate::constants::scaled_seconds(checkpoint_time),
                longs,
                false,
            );
            self.market.longs_outstanding =
                self.market.longs_outstanding.saturating_sub(longs);
            self.market.long_exposure = self.market.long_exposure.saturating_sub(longs);
            checkpoint.longs_outstanding = FixedPoint::zero();
        }

        let shorts = checkpoint.shorts_outstanding;
        if !shorts.is_zero() {
            let open_price = checkpoint_time
                .checked_sub(self.config.position_duration)
                .and_then(|t| self.checkpoints.vault_share_price(t))
                .filter(|p| !p.is_zero())
                .unwrap_or(checkpoint_price);

            let flat_shares = shorts.div_down(checkpoint_price);
            let flat_fee = flat_shares.mul_down(flat_fee_rate);
            let governance_fee = flat_fee.mul_down(governance_rate);

            // The shorts' buy-back returns the face value to the reserves.
            let reserves_delta = flat_shares + (flat_fee - governance_fee);
            self.market.share_reserves += reserves_delta;
            self.market.share_adjustment =
                self.market.share_adjustment + I256::from(reserves_delta);
            self.governance_fees_accrued += governance_fee;

            // What the margin pot holds beyond the buy-back is the shorts'
            // interest for the term.
            let proceeds_shares = short_proceeds(
                shorts,
                flat_shares + flat_fee,
                open_price,
                checkpoint_price,
                checkpoint_price,
                flat_fee_rate,
            );
            let proceeds_base = proceeds_shares.mul_down(checkpoint_price);
            self.market.zombie_base_proceeds += proceeds_base;
            self.market.zombie_share_reserves += proceeds_shares;

            self.market.short_average_maturity_time = update_weighted_average(
                self.market.short_average_maturity_time,
                self.market.shorts_outstanding,
                crate::constants::scaled_seconds(checkpoint_time),
                shorts,
                false,
            );
            self.market.shorts_outstanding =
                self.market.shorts_outstanding.saturating_sub(shorts);
            self.market.short_base_volume = self
                .market
                .short_base_volume
                .saturating_sub(checkpoint.short_base_volume);

            checkpoint.settled_short_proceeds = proceeds_base;
            checkpoint.settled_shorts = shorts;
            checkpoint.shorts_outstanding = FixedPoint::zero();
            checkpoint.short_base_volume = FixedPoint::zero();
        }

        if let Some(slot) = self.checkpoints.get_mut(checkpoint_time) {
            *slot = checkpoint;
        }
    }

    /// Interest accrued on zombie reserves does not belong to the matured
    /// holders (their proceeds froze at maturity): governance takes its cut
    /// and the LPs get the rest.
    fn apply_zombie_interest(&mut self, vault_share_price: FixedPoint) {
        let value = self
            .market
            .zombie_share_reserves
            .mul_down(vault_share_price);
        if value <= self.market.zombie_base_proceeds {
            return;
        }
        let excess_shares =
            (value - self.market.zombie_base_proceeds).div_down(vault_share_price);
        let governance_fee = excess_shares.mul_down(self.config.fees.governance_zombie);
        self.governance_fees_accrued += governance_fee;
        self.market.share_reserves += excess_shares - governance_fee;
        self.market.zombie_share_reserves = self
            .market
            .zombie_share_reserves
            .saturating_sub(excess_shares);
    }

    /// Matches outstanding withdrawal shares with whatever idle capital is
    /// available, at the prevailing LP share price. Runs opportunistically
    /// after closes and checkpoints; never fails the enclosing operation.
    fn distribute_excess_idle(&mut self, now: u64) {
        let withdrawal_outstanding = self
            .ledger
            .total_supply(AssetId::WithdrawalShare)
            .saturating_sub(self.withdrawal_pool.ready_to_withdraw);
        if withdrawal_outstanding.is_zero() {
            return;
        }
        let Ok(state) = self.snapshot() else {
            return;
        };
        let idle = state.calculate_idle();
        if idle.is_zero() {
            return;
        }
        let Ok(present_value) = state.calculate_present_value(now) else {
            return;
        };
        let active_supply = self.active_lp_supply();
        if active_supply.is_zero() {
            return;
        }
        let lp_share_price = present_value.div_down(active_supply);
        let withdrawal_value = withdrawal_outstanding.mul_down(lp_share_price);
        if withdrawal_value.is_zero() {
            return;
        }

        let payout = if idle < withdrawal_value {
            idle
        } else {
            withdrawal_value
        };
        let shares_matched = withdrawal_outstanding.mul_div_down(payout, withdrawal_value);

        self.market.share_reserves = self.market.share_reserves - payout;
        self.withdrawal_pool.ready_to_withdraw += shares_matched;
        self.withdrawal_pool.proceeds += payout;

        debug!(
            payout = %payout,
            shares_matched = %shares_matched,
            "idle distributed to withdrawal pool"
        );
    }
}
