//! # Catalog Manager
//!
//! Owns every loot-box definition and its reward table.
//!
//! Boxes live in an arena indexed by their sequential id; reward tables are
//! owned outright by their box record and only ever appended to. External
//! code refers to boxes by [`BoxId`] and to rewards by index.
//!
//! Supply is tracked as `total_opened + reserved`, where `reserved` counts
//! opens that passed validation but whose randomness has not arrived yet.

use alloy_primitives::{Address, U256};
use tracing::{debug, info};

use crate::asset::{BoxConfig, BoxId, Reward, TokenKind};
use crate::error::{LootBoxError, LootBoxResult};
use crate::selector;

/// One catalog entry with its reward table.
#[derive(Clone, Debug)]
struct BoxRecord {
    config: BoxConfig,
    rewards: Vec<Reward>,
    total_weight: u64,
    reserved: u64,
}

impl BoxRecord {
    fn has_capacity(&self) -> bool {
        !self.config.is_capped()
            || self.config.total_opened + self.reserved < self.config.max_supply
    }
}

/// The set of all loot-box configurations and their reward tables.
#[derive(Clone, Debug)]
pub struct Catalog {
    owner: Address,
    boxes: Vec<BoxRecord>,
}

impl Catalog {
    /// Creates an empty catalog administered by `owner`.
    #[must_use]
    pub const fn new(owner: Address) -> Self {
        Self {
            owner,
            boxes: Vec::new(),
        }
    }

    /// The privileged owner address.
    #[inline]
    #[must_use]
    pub const fn owner(&self) -> Address {
        self.owner
    }

    /// Fails with [`LootBoxError::Unauthorized`] unless `caller` is the owner.
    ///
    /// # Errors
    ///
    /// Returns `Unauthorized` for any other caller.
    #[inline]
    pub fn ensure_owner(&self, caller: Address) -> LootBoxResult<()> {
        if caller == self.owner {
            Ok(())
        } else {
            Err(LootBoxError::Unauthorized { caller })
        }
    }

    /// Number of boxes ever created.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    /// Returns true if no box has been created yet.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    /// Creates a box and returns its id.
    ///
    /// Price and supply are taken as given; a zero price and a zero
    /// (unlimited) supply are both valid.
    ///
    /// # Errors
    ///
    /// Returns `Unauthorized` if `caller` is not the owner.
    pub fn create_loot_box(
        &mut self,
        caller: Address,
        name: &str,
        description: &str,
        price: U256,
        max_supply: u64,
    ) -> LootBoxResult<BoxId> {
        self.ensure_owner(caller)?;

        let id = self.boxes.len() as BoxId;
        self.boxes.push(BoxRecord {
            config: BoxConfig {
                id,
                name: name.to_string(),
                description: description.to_string(),
                price,
                max_supply,
                total_opened: 0,
                is_active: true,
            },
            rewards: Vec::new(),
            total_weight: 0,
            reserved: 0,
        });

        info!(box_id = id, name, %price, max_supply, "loot box created");
        Ok(id)
    }

    /// Appends a reward to a box's table and returns its index.
    ///
    /// # Errors
    ///
    /// - `Unauthorized` if `caller` is not the owner
    /// - `InvalidBoxId` if the box does not exist
    /// - `InvalidWeight` if `reward.weight` is zero
    /// - `InvalidRewardAmount` for a unique reward whose amount is not one
    ///
    /// A rejected reward leaves the table unchanged.
    pub fn add_reward(
        &mut self,
        caller: Address,
        box_id: BoxId,
        reward: Reward,
    ) -> LootBoxResult<usize> {
        self.ensure_owner(caller)?;
        let record = self.record_mut(box_id)?;
        if reward.weight == 0 {
            return Err(LootBoxError::InvalidWeight);
        }
        if reward.kind == TokenKind::Unique && reward.amount != U256::from(1u64) {
            return Err(LootBoxError::InvalidRewardAmount(reward.amount));
        }

        record.total_weight += u64::from(reward.weight);
        record.rewards.push(reward);
        let index = record.rewards.len() - 1;

        debug!(box_id, index, total_weight = record.total_weight, "reward added");
        Ok(index)
    }

    /// Sets a new price and returns the updated snapshot.
    ///
    /// # Errors
    ///
    /// `Unauthorized` or `InvalidBoxId`.
    pub fn update_price(
        &mut self,
        caller: Address,
        box_id: BoxId,
        price: U256,
    ) -> LootBoxResult<BoxConfig> {
        self.ensure_owner(caller)?;
        let record = self.record_mut(box_id)?;
        record.config.price = price;
        info!(box_id, %price, "loot box price updated");
        Ok(record.config.clone())
    }

    /// Opens or closes a box for sale and returns the updated snapshot.
    ///
    /// # Errors
    ///
    /// `Unauthorized` or `InvalidBoxId`.
    pub fn set_active(
        &mut self,
        caller: Address,
        box_id: BoxId,
        active: bool,
    ) -> LootBoxResult<BoxConfig> {
        self.ensure_owner(caller)?;
        let record = self.record_mut(box_id)?;
        record.config.is_active = active;
        info!(box_id, active, "loot box activation changed");
        Ok(record.config.clone())
    }

    /// Snapshot of a box's configuration.
    ///
    /// # Errors
    ///
    /// `InvalidBoxId` for unknown ids.
    pub fn config(&self, box_id: BoxId) -> LootBoxResult<BoxConfig> {
        self.record(box_id).map(|r| r.config.clone())
    }

    /// The reward table of a box, in append order.
    ///
    /// # Errors
    ///
    /// `InvalidBoxId` for unknown ids.
    pub fn rewards(&self, box_id: BoxId) -> LootBoxResult<&[Reward]> {
        self.record(box_id).map(|r| r.rewards.as_slice())
    }

    /// A single reward, or `None` when the box or index is out of range.
    #[must_use]
    pub fn reward(&self, box_id: BoxId, index: usize) -> Option<&Reward> {
        self.record(box_id).ok()?.rewards.get(index)
    }

    /// Sum of all reward weights of a box.
    ///
    /// # Errors
    ///
    /// `InvalidBoxId` for unknown ids.
    pub fn total_weight(&self, box_id: BoxId) -> LootBoxResult<u64> {
        self.record(box_id).map(|r| r.total_weight)
    }

    /// Opens accepted but not yet fulfilled.
    ///
    /// # Errors
    ///
    /// `InvalidBoxId` for unknown ids.
    pub fn reserved(&self, box_id: BoxId) -> LootBoxResult<u64> {
        self.record(box_id).map(|r| r.reserved)
    }

    /// Checks that `box_id` can accept one more open for `payment`.
    ///
    /// Validation order: existence, active flag, payment, supply, rewards.
    ///
    /// # Errors
    ///
    /// `InvalidBoxId`, `BoxInactive`, `InsufficientPayment`,
    /// `SupplyExhausted` or `NoRewardsAvailable`.
    pub fn validate_open(&self, box_id: BoxId, payment: U256) -> LootBoxResult<()> {
        let record = self.record(box_id)?;

        if !record.config.is_active {
            return Err(LootBoxError::BoxInactive(box_id));
        }
        if payment < record.config.price {
            return Err(LootBoxError::InsufficientPayment {
                required: record.config.price,
                provided: payment,
            });
        }
        if !record.has_capacity() {
            return Err(LootBoxError::SupplyExhausted(box_id));
        }
        if record.rewards.is_empty() || record.total_weight == 0 {
            return Err(LootBoxError::NoRewardsAvailable(box_id));
        }

        Ok(())
    }

    /// Returns true if another open (or retried payout) fits under the cap.
    ///
    /// # Errors
    ///
    /// `InvalidBoxId` for unknown ids.
    pub fn has_capacity(&self, box_id: BoxId) -> LootBoxResult<bool> {
        self.record(box_id).map(BoxRecord::has_capacity)
    }

    /// Holds one unit of supply for an accepted open.
    pub(crate) fn reserve(&mut self, box_id: BoxId) -> LootBoxResult<()> {
        let record = self.record_mut(box_id)?;
        if !record.has_capacity() {
            return Err(LootBoxError::SupplyExhausted(box_id));
        }
        record.reserved += 1;
        Ok(())
    }

    /// Gives back a unit held by [`Catalog::reserve`].
    pub(crate) fn release(&mut self, box_id: BoxId) {
        if let Ok(record) = self.record_mut(box_id) {
            record.reserved = record.reserved.saturating_sub(1);
        }
    }

    /// Counts a successful open.
    pub(crate) fn record_open(&mut self, box_id: BoxId) -> LootBoxResult<u64> {
        let record = self.record_mut(box_id)?;
        record.config.total_opened += 1;
        Ok(record.config.total_opened)
    }

    /// Picks a reward index for a random word.
    ///
    /// # Errors
    ///
    /// `InvalidBoxId` or `NoRewardsAvailable`.
    pub fn select(&self, box_id: BoxId, word: U256) -> LootBoxResult<usize> {
        let record = self.record(box_id)?;
        selector::pick(box_id, &record.rewards, word)
    }

    fn record(&self, box_id: BoxId) -> LootBoxResult<&BoxRecord> {
        usize::try_from(box_id)
            .ok()
            .and_then(|i| self.boxes.get(i))
            .ok_or(LootBoxError::InvalidBoxId(box_id))
    }

    fn record_mut(&mut self, box_id: BoxId) -> LootBoxResult<&mut BoxRecord> {
        usize::try_from(box_id)
            .ok()
            .and_then(|i| self.boxes.get_mut(i))
            .ok_or(LootBoxError::InvalidBoxId(box_id))
    }
}
