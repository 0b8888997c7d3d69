//! # Core Error Types
//!
//! One taxonomy for every failure the engine can surface. All of these are
//! rejected-before-commit: an `Err` from any operation means no state was
//! changed by that operation.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    // ========================================================================
    // Input validation
    // ========================================================================
    #[error("zero amount")]
    ZeroAmount,

    #[error("amount is below the minimum transaction amount")]
    BelowMinimumTransaction,

    #[error("maturity time is not aligned to a checkpoint boundary")]
    InvalidMaturityTime,

    #[error("checkpoint time is in the future")]
    FutureCheckpoint,

    #[error("checkpoint time is not aligned to a checkpoint boundary")]
    InvalidCheckpointTime,

    #[error("invalid pool configuration: {0}")]
    InvalidConfiguration(&'static str),

    #[error("pool is already initialized")]
    AlreadyInitialized,

    #[error("pool is not initialized")]
    NotInitialized,

    #[error("pool is paused")]
    Paused,

    // ========================================================================
    // Slippage and solvency
    // ========================================================================
    #[error("output is below the caller-specified minimum")]
    OutputBelowMinimum,

    #[error("deposit is above the caller-specified maximum")]
    DepositAboveMaximum,

    #[error("LP share price is below the caller-specified minimum")]
    LpSharePriceBelowMinimum,

    #[error("insufficient liquidity")]
    InsufficientLiquidity,

    #[error("trade would push the spot price above one")]
    NegativeInterest,

    #[error("present value is negative")]
    NegativePresentValue,

    // ========================================================================
    // Position ledger
    // ========================================================================
    #[error("insufficient balance")]
    InsufficientBalance,

    #[error("caller is not approved to move this balance")]
    NotApproved,

    // ========================================================================
    // Yield source collaborator
    // ========================================================================
    #[error("the yield source does not support this asset form")]
    UnsupportedAssetForm,

    #[error("yield source transfer failed")]
    TransferFailed,
}

/// Result type using core errors.
pub type CoreResult<T> = Result<T, CoreError>;
