//! # Catalog Records
//!
//! Box configurations and reward entries, plus the id types shared by
//! every other module.

use alloy_primitives::{Address, U256};
use serde::{Deserialize, Serialize};

/// Sequential catalog identifier, assigned at creation starting from 0.
pub type BoxId = u64;

/// Identifier of an in-flight randomness request.
pub type RequestId = u64;

/// Sequential identifier of an opening ticket.
pub type TicketId = u64;

/// Asset-transfer protocol a reward pays out through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    /// Interchangeable balance (ERC20-like). `token_id` is ignored.
    Fungible,
    /// One-of-a-kind item (ERC721-like). Moves exactly one unit.
    Unique,
    /// Balance per token id (ERC1155-like).
    SemiFungible,
}

/// A single possible payout of a loot box.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reward {
    /// Transfer protocol.
    pub kind: TokenKind,
    /// Asset contract to pay out from.
    pub token: Address,
    /// Item id for unique and semi-fungible rewards.
    pub token_id: U256,
    /// Quantity transferred (1 for unique rewards).
    pub amount: U256,
    /// Relative probability mass, always positive once stored.
    pub weight: u32,
}

impl Reward {
    /// Fungible reward paying `amount` of `token`.
    #[must_use]
    pub const fn fungible(token: Address, amount: U256, weight: u32) -> Self {
        Self {
            kind: TokenKind::Fungible,
            token,
            token_id: U256::ZERO,
            amount,
            weight,
        }
    }

    /// Unique reward paying item `token_id` of `token`.
    #[must_use]
    pub fn unique(token: Address, token_id: U256, weight: u32) -> Self {
        Self {
            kind: TokenKind::Unique,
            token,
            token_id,
            amount: U256::from(1u64),
            weight,
        }
    }

    /// Semi-fungible reward paying `amount` units of `token_id`.
    #[must_use]
    pub const fn semi_fungible(token: Address, token_id: U256, amount: U256, weight: u32) -> Self {
        Self {
            kind: TokenKind::SemiFungible,
            token,
            token_id,
            amount,
            weight,
        }
    }
}

/// Snapshot of one catalog entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BoxConfig {
    /// Catalog id.
    pub id: BoxId,
    /// Display name.
    pub name: String,
    /// Display description.
    pub description: String,
    /// Native-currency price to open.
    pub price: U256,
    /// Upper bound on total opens, 0 for unlimited.
    pub max_supply: u64,
    /// Successful opens so far.
    pub total_opened: u64,
    /// Opening is refused while false.
    pub is_active: bool,
}

impl BoxConfig {
    /// Returns true if the box caps its supply.
    #[inline]
    #[must_use]
    pub const fn is_capped(&self) -> bool {
        self.max_supply != 0
    }
}
