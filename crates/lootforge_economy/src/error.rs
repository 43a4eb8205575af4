//! # Loot Box Error Types
//!
//! All errors that can occur in the loot box engine.

use alloy_primitives::{Address, U256};
use thiserror::Error;

use crate::asset::{BoxId, RequestId};

/// Failure reported by an asset-custody collaborator.
///
/// A transfer that fails has no partial effect.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// The sender does not hold enough of a fungible or semi-fungible asset.
    #[error("insufficient balance of {token} (id {token_id}): need {required}, have {available}")]
    InsufficientBalance {
        /// Asset contract.
        token: Address,
        /// Token id (zero for fungible assets).
        token_id: U256,
        /// Amount the transfer needed.
        required: U256,
        /// Amount the sender holds.
        available: U256,
    },

    /// The sender does not own the unique item.
    #[error("unique item {token_id} of {token} is not held by {holder}")]
    NotHeld {
        /// Asset contract.
        token: Address,
        /// Item id.
        token_id: U256,
        /// The address that was expected to hold it.
        holder: Address,
    },

    /// A unique item was asked to move with an amount other than one.
    #[error("unique item transfers move exactly one unit, got {0}")]
    InvalidUniqueAmount(U256),

    /// The receiving balance would overflow.
    #[error("balance overflow for {token} (id {token_id})")]
    BalanceOverflow {
        /// Asset contract.
        token: Address,
        /// Token id (zero for fungible assets).
        token_id: U256,
    },
}

/// Errors that can occur in the loot box engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LootBoxError {
    /// Caller lacks owner privilege.
    #[error("unauthorized: {caller} is not the owner")]
    Unauthorized {
        /// The rejected caller.
        caller: Address,
    },

    /// Unknown catalog id.
    #[error("invalid loot box id: {0}")]
    InvalidBoxId(BoxId),

    /// Reward weight must be positive.
    #[error("weight must be greater than 0")]
    InvalidWeight,

    /// A unique reward must pay exactly one item.
    #[error("unique rewards pay exactly one item, got amount {0}")]
    InvalidRewardAmount(U256),

    /// The box exists but is not open for sale.
    #[error("loot box {0} is not active")]
    BoxInactive(BoxId),

    /// Attached payment is below the box price.
    #[error("insufficient payment: price {required}, paid {provided}")]
    InsufficientPayment {
        /// Current box price.
        required: U256,
        /// Value attached to the call.
        provided: U256,
    },

    /// Every unit of the box's supply is opened or reserved.
    #[error("loot box {0} supply exhausted")]
    SupplyExhausted(BoxId),

    /// The reward table is empty or has zero total weight.
    #[error("no rewards available in loot box {0}")]
    NoRewardsAvailable(BoxId),

    /// The payout transfer failed and the fulfillment was rolled back.
    #[error("transfer failed for request {request_id}: {source}")]
    TransferFailed {
        /// The request whose payout failed.
        request_id: RequestId,
        /// The custody failure.
        #[source]
        source: TransferError,
    },

    /// An owner withdrawal or refund claim could not be paid out.
    #[error("withdrawal failed: {0}")]
    WithdrawalFailed(#[source] TransferError),

    /// No pending or failed request with this id.
    #[error("unknown request: {0}")]
    UnknownRequest(RequestId),

    /// Owner tried to withdraw more native currency than the engine holds.
    #[error("insufficient proceeds: requested {requested}, available {available}")]
    InsufficientProceeds {
        /// Amount asked for.
        requested: U256,
        /// Amount held.
        available: U256,
    },

    /// The randomness collaborator refused or lost a request.
    #[error("randomness unavailable: {0}")]
    RandomnessUnavailable(String),

    /// Invalid configuration file.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Journal I/O or framing failure.
    #[error("journal error: {0}")]
    Journal(String),
}

/// Result type for loot box operations.
pub type LootBoxResult<T> = Result<T, LootBoxError>;
