//! # LOOTFORGE Economy
//!
//! Weighted-random loot boxes with supply accounting and multi-asset payouts.
//!
//! ## Design Principles
//!
//! 1. **Integer amounts** - Prices and payouts are 256-bit integers, never floats
//! 2. **Two-phase opens** - An open requests randomness and returns; the payout
//!    happens when the random word is delivered
//! 3. **All-or-nothing payouts** - A failed transfer leaves supply, counters and
//!    tickets untouched and queues the request for the owner
//! 4. **External configuration** - Catalogs and vault funding load from TOML
//!
//! ## Thread Safety
//!
//! [`LootBoxEngine`] is `Send + Sync`. All state sits behind a single lock, and
//! supply is reserved when an open is accepted, so concurrent opens can never
//! exceed a box's supply.
//!
//! ## Example
//!
//! ```rust,ignore
//! use lootforge_economy::{AssetLedger, LootBoxEngine, QueuedOracle, Reward};
//!
//! let engine = LootBoxEngine::new(owner, vault, AssetLedger::new(), QueuedOracle::new(7));
//! let id = engine.create_loot_box(owner, "Starter", "Gold", price, 1_000)?;
//! engine.add_reward(owner, id, Reward::fungible(gold, amount, 70))?;
//!
//! let request_id = engine.open_box(player, id, price)?;
//! let word = engine.with_oracle_mut(|o| o.take(request_id)).unwrap_or_default();
//! let receipt = engine.on_randomness_ready(request_id, word)?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod asset;
pub mod catalog;
pub mod config;
pub mod custody;
pub mod engine;
pub mod error;
pub mod events;
pub mod journal;
pub mod randomness;
pub mod selector;

pub use asset::{BoxConfig, BoxId, RequestId, Reward, TicketId, TokenKind};
pub use catalog::Catalog;
pub use config::{BoxSpec, EngineConfig, FundingSpec, RewardSpec};
pub use custody::{AssetCustody, AssetLedger};
pub use engine::{FailedFulfillment, LootBoxEngine, OpenReceipt, PendingRequest};
pub use error::{LootBoxError, LootBoxResult, TransferError};
pub use events::{EventBus, EventReceiver, EventSender, LootBoxEvent};
pub use journal::{JournalOp, JournalRecovery, OpenJournal};
pub use randomness::{QueuedOracle, RandomnessSource, ThreadedOracle};
pub use selector::SelectionStatistics;

pub use alloy_primitives::{Address, U256};
