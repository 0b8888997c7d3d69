//! # Termflow Core
//!
//! A fixed-rate, fixed-duration lending AMM engine. Liquidity providers
//! deposit a yield-bearing asset; traders open longs (fixed-rate lending)
//! and shorts (fixed-rate borrowing) against the shared reserves, priced by
//! a time-stretched bonding curve. Positions mature on checkpoint
//! boundaries and settle in batches: the engine never iterates over
//! individual positions, carrying everything in running aggregates.
//!
//! The crate is strictly single-threaded and transactional. Each operation
//! on [`pool::Pool`] runs to completion against an ambient timestamp
//! supplied by the host; an error means the operation did not happen.
//! External yield sources plug in through the [`vault::YieldSource`] trait.

pub mod checkpoint;
pub mod config;
pub mod constants;
pub mod curve;
pub mod errors;
pub mod fees;
pub mod ledger;
pub mod long;
pub mod lp;
pub mod pool;
pub mod short;
pub mod state;
pub mod vault;

pub use config::{Fees, PoolConfig};
pub use errors::{CoreError, CoreResult};
pub use ledger::{AccountId, AssetId};
pub use pool::{Pool, TradeOptions};
pub use state::{MarketState, PoolState, WithdrawalPool};
pub use vault::{MockVault, YieldSource};
