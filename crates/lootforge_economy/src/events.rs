//! # Loot Box Events
//!
//! Every state transition of the engine publishes a [`LootBoxEvent`].
//!
//! ```text
//! ┌─────────────┐      ┌─────────────┐      ┌─────────────┐
//! │   Engine    │─────>│   Event     │─────>│  Indexer /  │
//! │  (locked)   │      │   Channel   │      │  UI / Sim   │
//! └─────────────┘      └─────────────┘      └─────────────┘
//! ```
//!
//! The channel is unbounded: payouts are not allowed to be lost because a
//! consumer fell behind.

use alloy_primitives::{Address, U256};
use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::asset::{BoxId, RequestId, TicketId, TokenKind};

/// Events published by the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LootBoxEvent {
    // =========================================================================
    // Catalog
    // =========================================================================
    /// A box was added to the catalog.
    Created {
        /// New box id.
        box_id: BoxId,
        /// Display name.
        name: String,
        /// Opening price.
        price: U256,
        /// Supply cap, 0 for unlimited.
        max_supply: u64,
    },

    /// Price or activation changed. Carries the post-mutation snapshot.
    Updated {
        /// Box id.
        box_id: BoxId,
        /// Display name.
        name: String,
        /// Current price.
        price: U256,
        /// Supply cap.
        max_supply: u64,
        /// Whether the box is open for sale.
        is_active: bool,
    },

    /// A reward was appended to a table.
    RewardAdded {
        /// Box id.
        box_id: BoxId,
        /// Index of the new reward.
        index: usize,
        /// Transfer protocol.
        kind: TokenKind,
        /// Asset contract.
        token: Address,
        /// Item id.
        token_id: U256,
        /// Payout quantity.
        amount: U256,
        /// Relative weight.
        weight: u32,
    },

    // =========================================================================
    // Opening
    // =========================================================================
    /// An open passed validation and is waiting for randomness.
    OpenRequested {
        /// Opener.
        caller: Address,
        /// Box id.
        box_id: BoxId,
        /// Randomness request id.
        request_id: RequestId,
    },

    /// A reward was paid out.
    Opened {
        /// Opener.
        caller: Address,
        /// Box id.
        box_id: BoxId,
        /// Randomness request id.
        request_id: RequestId,
        /// Asset contracts paid out.
        tokens: Vec<Address>,
        /// Item ids paid out.
        token_ids: Vec<U256>,
        /// Quantities paid out.
        amounts: Vec<U256>,
        /// Ticket issued to the opener.
        ticket_id: TicketId,
    },

    /// The payout transfer failed; the request sits in the failed queue.
    FulfillmentFailed {
        /// Opener.
        caller: Address,
        /// Box id.
        box_id: BoxId,
        /// Randomness request id.
        request_id: RequestId,
        /// Selected reward index.
        reward_index: usize,
        /// Rendered transfer error.
        reason: String,
    },

    // =========================================================================
    // Funds
    // =========================================================================
    /// The owner pulled assets or proceeds out of the engine.
    Withdrawn {
        /// Recipient.
        to: Address,
        /// Asset contract, zero address for native currency.
        token: Address,
        /// Item id, zero for fungible and native withdrawals.
        token_id: U256,
        /// Quantity withdrawn.
        amount: U256,
    },

    /// A payment was made claimable again.
    Refunded {
        /// Opener receiving the refund.
        caller: Address,
        /// Request the refund belongs to.
        request_id: RequestId,
        /// Amount credited.
        amount: U256,
    },
}

/// Owns both ends of the event channel.
pub struct EventBus {
    sender: Sender<LootBoxEvent>,
    receiver: Receiver<LootBoxEvent>,
}

impl EventBus {
    /// Creates a new unbounded bus.
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self { sender, receiver }
    }

    /// Creates a sender handle.
    #[must_use]
    pub fn sender(&self) -> EventSender {
        EventSender {
            sender: self.sender.clone(),
        }
    }

    /// Creates a receiver handle.
    #[must_use]
    pub fn receiver(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.receiver.clone(),
        }
    }

    /// Creates a connected sender and receiver.
    #[must_use]
    pub fn create_pair() -> (EventSender, EventReceiver) {
        let bus = Self::new();
        (bus.sender(), bus.receiver())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle for publishing events.
#[derive(Clone, Debug)]
pub struct EventSender {
    sender: Sender<LootBoxEvent>,
}

impl EventSender {
    /// Publishes an event.
    ///
    /// Returns `false` if every receiver has been dropped.
    #[inline]
    pub fn send(&self, event: LootBoxEvent) -> bool {
        self.sender.send(event).is_ok()
    }
}

/// Handle for consuming events.
#[derive(Clone, Debug)]
pub struct EventReceiver {
    receiver: Receiver<LootBoxEvent>,
}

impl EventReceiver {
    /// Receives all pending events (non-blocking).
    #[inline]
    pub fn drain(&self) -> Vec<LootBoxEvent> {
        self.receiver.try_iter().collect()
    }

    /// Receives one event (non-blocking).
    #[inline]
    pub fn try_recv(&self) -> Option<LootBoxEvent> {
        self.receiver.try_recv().ok()
    }

    /// Number of pending events.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.receiver.len()
    }

    /// Checks if there are pending events.
    #[inline]
    #[must_use]
    pub fn has_events(&self) -> bool {
        !self.receiver.is_empty()
    }
}
