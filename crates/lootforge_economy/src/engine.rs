//! # Fulfillment Engine
//!
//! Drives every open through three states:
//!
//! ```text
//!   open_box ──▶ Requested ──on_randomness_ready──▶ Fulfilling ──▶ Completed
//!                   │                                   │
//!                   │ expire_stale_requests             │ transfer error
//!                   ▼                                   ▼
//!                Refunded  ◀──────refund_failed─────  Failed ──retry_failed──▶ Fulfilling
//! ```
//!
//! All mutable state sits behind one lock, so each open and each
//! fulfillment is serializable and all-or-nothing. Supply is reserved when
//! the open is accepted, which keeps concurrently pending requests from
//! over-issuing a capped box.

use alloy_primitives::{Address, U256};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::asset::{BoxConfig, BoxId, RequestId, Reward, TicketId};
use crate::catalog::Catalog;
use crate::custody::AssetCustody;
use crate::error::{LootBoxError, LootBoxResult, TransferError};
use crate::events::{EventBus, EventReceiver, EventSender, LootBoxEvent};
use crate::journal::{JournalOp, OpenJournal};
use crate::randomness::RandomnessSource;

/// An accepted open waiting for its random word.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingRequest {
    /// Opener.
    pub caller: Address,
    /// Box being opened.
    pub box_id: BoxId,
    /// Payment attached to the open.
    pub payment: U256,
    /// When the open was accepted.
    pub requested_at: Instant,
}

/// A fulfillment whose payout transfer failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailedFulfillment {
    /// The request.
    pub request_id: RequestId,
    /// Opener.
    pub caller: Address,
    /// Box opened.
    pub box_id: BoxId,
    /// Payment attached to the open.
    pub payment: U256,
    /// Reward the draw selected. Retries pay this same reward.
    pub reward_index: usize,
    /// Why the transfer failed.
    pub reason: TransferError,
}

/// Outcome of a completed open.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenReceipt {
    /// The request.
    pub request_id: RequestId,
    /// Opener.
    pub caller: Address,
    /// Box opened.
    pub box_id: BoxId,
    /// Index of the reward paid.
    pub reward_index: usize,
    /// The reward paid.
    pub reward: Reward,
    /// Ticket issued for the open.
    pub ticket_id: TicketId,
}

struct EngineState<C, R> {
    catalog: Catalog,
    custody: C,
    oracle: R,
    vault: Address,
    pending: HashMap<RequestId, PendingRequest>,
    failed: BTreeMap<RequestId, FailedFulfillment>,
    user_opens: HashMap<(BoxId, Address), u64>,
    proceeds: U256,
    refunds: HashMap<Address, U256>,
    /// ticket id -> holder
    tickets: Vec<Address>,
    journal: Option<OpenJournal>,
    subscribers: Vec<EventSender>,
}

impl<C: AssetCustody, R: RandomnessSource> EngineState<C, R> {
    fn emit(&mut self, event: LootBoxEvent) {
        self.subscribers.retain(|s| s.send(event.clone()));
    }

    fn journal_committed(&self, op: JournalOp) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.append_committed(op) {
                error!(error = %e, "failed to journal operation");
            }
        }
    }

    /// Moves `amount` of proceeds into the refund ledger of `to`.
    fn credit_refund(&mut self, request_id: RequestId, to: Address, amount: U256) {
        self.proceeds = self.proceeds.saturating_sub(amount);
        let balance = self.refunds.entry(to).or_insert(U256::ZERO);
        *balance = balance.saturating_add(amount);

        self.journal_committed(JournalOp::Refund {
            request_id,
            caller: to,
            amount,
        });
        info!(request_id, caller = %to, %amount, "payment made refundable");
        self.emit(LootBoxEvent::Refunded {
            caller: to,
            request_id,
            amount,
        });
    }

    /// Transfers the selected reward and commits counters, or records the failure.
    fn settle(
        &mut self,
        request_id: RequestId,
        caller: Address,
        box_id: BoxId,
        payment: U256,
        reward_index: usize,
    ) -> LootBoxResult<OpenReceipt> {
        let reward = self
            .catalog
            .reward(box_id, reward_index)
            .cloned()
            .ok_or(LootBoxError::NoRewardsAvailable(box_id))?;
        let ticket_id = self.tickets.len() as TicketId;

        let transfer = {
            let mut txn = match self.journal.as_ref().map(OpenJournal::begin).transpose() {
                Ok(txn) => txn,
                Err(e) => {
                    error!(request_id, error = %e, "failed to begin payout journal entry");
                    None
                }
            };
            if let Some(t) = txn.as_mut() {
                let op = JournalOp::Payout {
                    request_id,
                    caller,
                    box_id,
                    reward_index: reward_index as u64,
                    ticket_id,
                };
                if let Err(e) = t.add_operation(op) {
                    error!(request_id, error = %e, "failed to journal payout");
                }
            }

            let transfer = self.custody.transfer(
                reward.kind,
                reward.token,
                self.vault,
                caller,
                reward.token_id,
                reward.amount,
            );

            if let Some(t) = txn {
                let finished = if transfer.is_ok() {
                    t.commit().map(|_| ())
                } else {
                    t.rollback()
                };
                if let Err(e) = finished {
                    error!(request_id, error = %e, "failed to finish payout journal entry");
                }
            }
            transfer
        };

        if let Err(source) = transfer {
            warn!(request_id, box_id, reward_index, error = %source, "fulfillment failed");
            self.failed.insert(
                request_id,
                FailedFulfillment {
                    request_id,
                    caller,
                    box_id,
                    payment,
                    reward_index,
                    reason: source.clone(),
                },
            );
            self.emit(LootBoxEvent::FulfillmentFailed {
                caller,
                box_id,
                request_id,
                reward_index,
                reason: source.to_string(),
            });
            return Err(LootBoxError::TransferFailed { request_id, source });
        }

        let total_opened = self.catalog.record_open(box_id)?;
        *self.user_opens.entry((box_id, caller)).or_insert(0) += 1;
        self.tickets.push(caller);

        info!(request_id, box_id, %caller, reward_index, ticket_id, total_opened, "loot box opened");
        self.emit(LootBoxEvent::Opened {
            caller,
            box_id,
            request_id,
            tokens: vec![reward.token],
            token_ids: vec![reward.token_id],
            amounts: vec![reward.amount],
            ticket_id,
        });

        Ok(OpenReceipt {
            request_id,
            caller,
            box_id,
            reward_index,
            reward,
            ticket_id,
        })
    }
}

/// The loot-box engine.
///
/// Share it across threads with `Arc`; every method takes `&self`.
pub struct LootBoxEngine<C, R> {
    state: Mutex<EngineState<C, R>>,
}

impl<C: AssetCustody, R: RandomnessSource> LootBoxEngine<C, R> {
    /// Creates an engine administered by `owner` that pays rewards out of
    /// `vault` through `custody`.
    pub fn new(owner: Address, vault: Address, custody: C, oracle: R) -> Self {
        info!(%owner, %vault, "loot box engine created");
        Self {
            state: Mutex::new(EngineState {
                catalog: Catalog::new(owner),
                custody,
                oracle,
                vault,
                pending: HashMap::new(),
                failed: BTreeMap::new(),
                user_opens: HashMap::new(),
                proceeds: U256::ZERO,
                refunds: HashMap::new(),
                tickets: Vec::new(),
                journal: None,
                subscribers: Vec::new(),
            }),
        }
    }

    /// Journals every payout and refund to `journal`.
    #[must_use]
    pub fn with_journal(self, journal: OpenJournal) -> Self {
        self.state.lock().journal = Some(journal);
        self
    }

    /// Returns a receiver for every event published from now on.
    pub fn subscribe(&self) -> EventReceiver {
        let (sender, receiver) = EventBus::create_pair();
        self.state.lock().subscribers.push(sender);
        receiver
    }

    /// The owner address.
    pub fn owner(&self) -> Address {
        self.state.lock().catalog.owner()
    }

    /// The address rewards are paid from.
    pub fn vault(&self) -> Address {
        self.state.lock().vault
    }

    // =========================================================================
    // Catalog
    // =========================================================================

    /// Creates a box. See [`Catalog::create_loot_box`].
    ///
    /// # Errors
    ///
    /// `Unauthorized`.
    pub fn create_loot_box(
        &self,
        caller: Address,
        name: &str,
        description: &str,
        price: U256,
        max_supply: u64,
    ) -> LootBoxResult<BoxId> {
        let mut state = self.state.lock();
        let box_id = state
            .catalog
            .create_loot_box(caller, name, description, price, max_supply)?;
        state.emit(LootBoxEvent::Created {
            box_id,
            name: name.to_string(),
            price,
            max_supply,
        });
        Ok(box_id)
    }

    /// Appends a reward. See [`Catalog::add_reward`].
    ///
    /// # Errors
    ///
    /// `Unauthorized`, `InvalidBoxId`, `InvalidWeight` or `InvalidRewardAmount`.
    pub fn add_reward(&self, caller: Address, box_id: BoxId, reward: Reward) -> LootBoxResult<usize> {
        let mut state = self.state.lock();
        let (kind, token, token_id, amount, weight) =
            (reward.kind, reward.token, reward.token_id, reward.amount, reward.weight);
        let index = state.catalog.add_reward(caller, box_id, reward)?;
        state.emit(LootBoxEvent::RewardAdded {
            box_id,
            index,
            kind,
            token,
            token_id,
            amount,
            weight,
        });
        Ok(index)
    }

    /// Changes a box's price.
    ///
    /// # Errors
    ///
    /// `Unauthorized` or `InvalidBoxId`.
    pub fn update_price(&self, caller: Address, box_id: BoxId, price: U256) -> LootBoxResult<()> {
        let mut state = self.state.lock();
        let config = state.catalog.update_price(caller, box_id, price)?;
        state.emit(updated(config));
        Ok(())
    }

    /// Opens or closes a box for sale.
    ///
    /// Requests already accepted are still fulfilled after a box is closed.
    ///
    /// # Errors
    ///
    /// `Unauthorized` or `InvalidBoxId`.
    pub fn set_active(&self, caller: Address, box_id: BoxId, active: bool) -> LootBoxResult<()> {
        let mut state = self.state.lock();
        let config = state.catalog.set_active(caller, box_id, active)?;
        state.emit(updated(config));
        Ok(())
    }

    /// Snapshot of a box's configuration.
    ///
    /// # Errors
    ///
    /// `InvalidBoxId`.
    pub fn config(&self, box_id: BoxId) -> LootBoxResult<BoxConfig> {
        self.state.lock().catalog.config(box_id)
    }

    /// Copy of a box's reward table.
    ///
    /// # Errors
    ///
    /// `InvalidBoxId`.
    pub fn rewards(&self, box_id: BoxId) -> LootBoxResult<Vec<Reward>> {
        self.state.lock().catalog.rewards(box_id).map(<[Reward]>::to_vec)
    }

    /// A single reward, `None` when out of range.
    pub fn reward(&self, box_id: BoxId, index: usize) -> Option<Reward> {
        self.state.lock().catalog.reward(box_id, index).cloned()
    }

    /// Sum of a box's reward weights.
    ///
    /// # Errors
    ///
    /// `InvalidBoxId`.
    pub fn total_weight(&self, box_id: BoxId) -> LootBoxResult<u64> {
        self.state.lock().catalog.total_weight(box_id)
    }

    /// Number of boxes in the catalog.
    pub fn box_count(&self) -> usize {
        self.state.lock().catalog.len()
    }

    // =========================================================================
    // Opening
    // =========================================================================

    /// Accepts an open, reserves one unit of supply and requests randomness.
    ///
    /// The payment is kept as proceeds, including any overpayment.
    ///
    /// # Errors
    ///
    /// `InvalidBoxId`, `BoxInactive`, `InsufficientPayment`,
    /// `SupplyExhausted`, `NoRewardsAvailable` or `RandomnessUnavailable`.
    /// Nothing changes on error.
    pub fn open_box(&self, caller: Address, box_id: BoxId, payment: U256) -> LootBoxResult<RequestId> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        state.catalog.validate_open(box_id, payment)?;

        let request_id = state.oracle.request()?;
        if state.pending.contains_key(&request_id) || state.failed.contains_key(&request_id) {
            return Err(LootBoxError::RandomnessUnavailable(format!(
                "oracle reused request id {request_id}"
            )));
        }

        state.catalog.reserve(box_id)?;
        state.pending.insert(
            request_id,
            PendingRequest {
                caller,
                box_id,
                payment,
                requested_at: Instant::now(),
            },
        );
        state.proceeds = state.proceeds.saturating_add(payment);

        info!(request_id, box_id, %caller, %payment, "open requested");
        state.emit(LootBoxEvent::OpenRequested {
            caller,
            box_id,
            request_id,
        });
        Ok(request_id)
    }

    /// Completes an open with the random word delivered for `request_id`.
    ///
    /// Unknown, expired and already-fulfilled ids return `Ok(None)` without
    /// touching any state.
    ///
    /// # Errors
    ///
    /// `TransferFailed` if the payout transfer fails. Supply, counters and
    /// tickets are left unchanged and the request moves to the failed queue.
    ///
    /// `NoRewardsAvailable` if no reward can be selected. The payment is made
    /// refundable when proceeds cover it; otherwise the request stays pending
    /// for [`LootBoxEngine::expire_stale_requests`].
    pub fn on_randomness_ready(
        &self,
        request_id: RequestId,
        word: U256,
    ) -> LootBoxResult<Option<OpenReceipt>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let Some(pending) = state.pending.get(&request_id).cloned() else {
            debug!(request_id, "ignoring randomness for unknown request");
            return Ok(None);
        };

        let reward_index = match state.catalog.select(pending.box_id, word) {
            Ok(index) => index,
            Err(e) => {
                if pending.payment > state.proceeds {
                    warn!(request_id, error = %e, "selection failed and proceeds cannot cover a refund");
                    return Err(e);
                }
                warn!(request_id, error = %e, "selection failed, refunding");
                state.pending.remove(&request_id);
                state.catalog.release(pending.box_id);
                state.credit_refund(request_id, pending.caller, pending.payment);
                return Err(e);
            }
        };
        state.pending.remove(&request_id);
        state.catalog.release(pending.box_id);
        debug!(request_id, reward_index, "reward selected");

        state
            .settle(request_id, pending.caller, pending.box_id, pending.payment, reward_index)
            .map(Some)
    }

    /// Number of requests waiting for randomness.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// The pending entry for `request_id`, if any.
    pub fn pending_request(&self, request_id: RequestId) -> Option<PendingRequest> {
        self.state.lock().pending.get(&request_id).cloned()
    }

    /// Successful opens of `box_id` by `user`.
    pub fn user_opened_count(&self, box_id: BoxId, user: Address) -> u64 {
        self.state
            .lock()
            .user_opens
            .get(&(box_id, user))
            .copied()
            .unwrap_or(0)
    }

    /// Holder of a ticket.
    pub fn ticket_owner(&self, ticket_id: TicketId) -> Option<Address> {
        let state = self.state.lock();
        usize::try_from(ticket_id)
            .ok()
            .and_then(|i| state.tickets.get(i).copied())
    }

    /// Number of tickets issued so far.
    pub fn tickets_issued(&self) -> u64 {
        self.state.lock().tickets.len() as u64
    }

    // =========================================================================
    // Failure and timeout handling
    // =========================================================================

    /// Fulfillments waiting for owner retry or refund, by request id.
    pub fn failed_fulfillments(&self) -> Vec<FailedFulfillment> {
        self.state.lock().failed.values().cloned().collect()
    }

    /// Re-attempts a failed payout with the reward originally selected.
    ///
    /// # Errors
    ///
    /// `Unauthorized`, `UnknownRequest`, `SupplyExhausted` if the supply
    /// has been used up meanwhile, or `TransferFailed` again.
    pub fn retry_failed(&self, caller: Address, request_id: RequestId) -> LootBoxResult<OpenReceipt> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.catalog.ensure_owner(caller)?;

        let failed = state
            .failed
            .get(&request_id)
            .cloned()
            .ok_or(LootBoxError::UnknownRequest(request_id))?;
        if !state.catalog.has_capacity(failed.box_id)? {
            return Err(LootBoxError::SupplyExhausted(failed.box_id));
        }

        state.failed.remove(&request_id);
        info!(request_id, "retrying failed fulfillment");
        state.settle(
            request_id,
            failed.caller,
            failed.box_id,
            failed.payment,
            failed.reward_index,
        )
    }

    /// Drops a failed fulfillment and makes its payment claimable by the opener.
    ///
    /// # Errors
    ///
    /// `Unauthorized`, `UnknownRequest`, or `InsufficientProceeds` if the
    /// payment has already been withdrawn.
    pub fn refund_failed(&self, caller: Address, request_id: RequestId) -> LootBoxResult<U256> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.catalog.ensure_owner(caller)?;

        let failed = state
            .failed
            .get(&request_id)
            .ok_or(LootBoxError::UnknownRequest(request_id))?;
        if failed.payment > state.proceeds {
            return Err(LootBoxError::InsufficientProceeds {
                requested: failed.payment,
                available: state.proceeds,
            });
        }

        let (to, amount) = (failed.caller, failed.payment);
        state.failed.remove(&request_id);
        state.credit_refund(request_id, to, amount);
        Ok(amount)
    }

    /// Cancels every pending request older than `max_age`.
    ///
    /// Reservations are released and payments become claimable. Randomness
    /// that arrives later for these ids is ignored. Returns the cancelled
    /// ids in ascending order.
    ///
    /// # Errors
    ///
    /// `Unauthorized`, or `InsufficientProceeds` if the stale payments are
    /// no longer covered (nothing is cancelled then).
    pub fn expire_stale_requests(
        &self,
        caller: Address,
        max_age: Duration,
    ) -> LootBoxResult<Vec<RequestId>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.catalog.ensure_owner(caller)?;

        let mut stale: Vec<RequestId> = state
            .pending
            .iter()
            .filter(|(_, p)| p.requested_at.elapsed() >= max_age)
            .map(|(&id, _)| id)
            .collect();
        stale.sort_unstable();

        let owed = stale
            .iter()
            .filter_map(|id| state.pending.get(id))
            .fold(U256::ZERO, |sum, p| sum.saturating_add(p.payment));
        if owed > state.proceeds {
            return Err(LootBoxError::InsufficientProceeds {
                requested: owed,
                available: state.proceeds,
            });
        }

        for &request_id in &stale {
            if let Some(pending) = state.pending.remove(&request_id) {
                state.catalog.release(pending.box_id);
                state.credit_refund(request_id, pending.caller, pending.payment);
            }
        }

        if !stale.is_empty() {
            warn!(expired = stale.len(), "expired stale randomness requests");
        }
        Ok(stale)
    }

    /// Refund balance claimable by `user`.
    pub fn refundable(&self, user: Address) -> U256 {
        self.state
            .lock()
            .refunds
            .get(&user)
            .copied()
            .unwrap_or_default()
    }

    /// Pays out `caller`'s refund balance and returns the amount.
    ///
    /// # Errors
    ///
    /// `WithdrawalFailed` if the payout fails; the balance stays claimable.
    pub fn claim_refund(&self, caller: Address) -> LootBoxResult<U256> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let amount = state.refunds.get(&caller).copied().unwrap_or_default();
        if amount.is_zero() {
            return Ok(U256::ZERO);
        }

        state
            .custody
            .send_native(caller, amount)
            .map_err(LootBoxError::WithdrawalFailed)?;
        state.refunds.remove(&caller);

        info!(%caller, %amount, "refund claimed");
        state.emit(LootBoxEvent::Withdrawn {
            to: caller,
            token: Address::ZERO,
            token_id: U256::ZERO,
            amount,
        });
        Ok(amount)
    }

    // =========================================================================
    // Owner withdrawals
    // =========================================================================

    /// Native currency collected from opens and not yet withdrawn or refunded.
    pub fn proceeds(&self) -> U256 {
        self.state.lock().proceeds
    }

    /// Sends `amount` of proceeds to the owner.
    ///
    /// # Errors
    ///
    /// `Unauthorized`, `InsufficientProceeds` or `WithdrawalFailed`.
    pub fn withdraw_proceeds(&self, caller: Address, amount: U256) -> LootBoxResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.catalog.ensure_owner(caller)?;

        if amount > state.proceeds {
            return Err(LootBoxError::InsufficientProceeds {
                requested: amount,
                available: state.proceeds,
            });
        }
        state
            .custody
            .send_native(caller, amount)
            .map_err(LootBoxError::WithdrawalFailed)?;
        state.proceeds -= amount;

        info!(%amount, remaining = %state.proceeds, "proceeds withdrawn");
        state.emit(LootBoxEvent::Withdrawn {
            to: caller,
            token: Address::ZERO,
            token_id: U256::ZERO,
            amount,
        });
        Ok(())
    }

    /// Moves fungible tokens out of the vault to the owner.
    ///
    /// # Errors
    ///
    /// `Unauthorized` or `WithdrawalFailed`.
    pub fn withdraw_fungible(&self, caller: Address, token: Address, amount: U256) -> LootBoxResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.catalog.ensure_owner(caller)?;

        state
            .custody
            .transfer_fungible(token, state.vault, caller, amount)
            .map_err(LootBoxError::WithdrawalFailed)?;

        info!(%token, %amount, "fungible tokens withdrawn");
        state.emit(LootBoxEvent::Withdrawn {
            to: caller,
            token,
            token_id: U256::ZERO,
            amount,
        });
        Ok(())
    }

    /// Moves an item out of the vault to the owner.
    ///
    /// If the vault holds `(token, token_id)` as a unique item that item is
    /// moved and `amount` is ignored; otherwise `amount` units of the
    /// semi-fungible balance are moved.
    ///
    /// # Errors
    ///
    /// `Unauthorized` or `WithdrawalFailed`.
    pub fn withdraw_unique_or_semi_fungible(
        &self,
        caller: Address,
        token: Address,
        token_id: U256,
        amount: U256,
    ) -> LootBoxResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.catalog.ensure_owner(caller)?;

        let vault = state.vault;
        let moved = if state.custody.holds_unique(token, token_id, vault) {
            state
                .custody
                .transfer_unique(token, vault, caller, token_id)
                .map(|()| U256::from(1u64))
        } else {
            state
                .custody
                .transfer_semi_fungible(token, vault, caller, token_id, amount)
                .map(|()| amount)
        }
        .map_err(LootBoxError::WithdrawalFailed)?;

        info!(%token, %token_id, amount = %moved, "item withdrawn");
        state.emit(LootBoxEvent::Withdrawn {
            to: caller,
            token,
            token_id,
            amount: moved,
        });
        Ok(())
    }

    // =========================================================================
    // Collaborators
    // =========================================================================

    /// Runs `f` with shared access to the custody backend.
    ///
    /// The engine lock is held for the duration of `f`; do not call back
    /// into the engine from it.
    pub fn with_custody<T>(&self, f: impl FnOnce(&C) -> T) -> T {
        f(&self.state.lock().custody)
    }

    /// Runs `f` with exclusive access to the custody backend.
    ///
    /// The engine lock is held for the duration of `f`.
    pub fn with_custody_mut<T>(&self, f: impl FnOnce(&mut C) -> T) -> T {
        f(&mut self.state.lock().custody)
    }

    /// Runs `f` with exclusive access to the randomness source.
    ///
    /// The engine lock is held for the duration of `f`.
    pub fn with_oracle_mut<T>(&self, f: impl FnOnce(&mut R) -> T) -> T {
        f(&mut self.state.lock().oracle)
    }
}

fn updated(config: BoxConfig) -> LootBoxEvent {
    LootBoxEvent::Updated {
        box_id: config.id,
        name: config.name,
        price: config.price,
        max_supply: config.max_supply,
        is_active: config.is_active,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custody::AssetLedger;
    use crate::journal::OpenJournal;
    use crate::randomness::QueuedOracle;
    use std::sync::Arc;

    const OWNER: Address = Address::repeat_byte(0x01);
    const VAULT: Address = Address::repeat_byte(0xEE);
    const ALICE: Address = Address::repeat_byte(0xA1);
    const BOB: Address = Address::repeat_byte(0xB0);
    const GOLD: Address = Address::repeat_byte(0x10);
    const SWORD: Address = Address::repeat_byte(0x20);
    const POTION: Address = Address::repeat_byte(0x30);

    type TestEngine = LootBoxEngine<AssetLedger, QueuedOracle>;

    fn u(n: u64) -> U256 {
        U256::from(n)
    }

    fn ether(n: u64) -> U256 {
        u(n) * u(1_000_000_000_000_000_000)
    }

    fn funded_ledger() -> AssetLedger {
        let mut ledger = AssetLedger::new();
        ledger.deposit_fungible(GOLD, VAULT, ether(1_000)).unwrap();
        ledger
    }

    /// Box 0: price 1 ether, weights 30/50/20 paying 1/5/10 gold.
    fn engine_with_box(max_supply: u64) -> TestEngine {
        let engine = LootBoxEngine::new(OWNER, VAULT, funded_ledger(), QueuedOracle::new(5));
        let id = engine
            .create_loot_box(OWNER, "Epic Loot Box", "Contains epic rewards", ether(1), max_supply)
            .unwrap();
        for (amount, weight) in [(1, 30), (5, 50), (10, 20)] {
            engine
                .add_reward(OWNER, id, Reward::fungible(GOLD, ether(amount), weight))
                .unwrap();
        }
        engine
    }

    #[test]
    fn test_engine_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TestEngine>();
    }

    #[test]
    fn test_open_and_fulfill_pays_selected_reward() {
        let engine = engine_with_box(100);
        let events = engine.subscribe();

        let request_id = engine.open_box(ALICE, 0, ether(1)).unwrap();
        assert_eq!(engine.pending_count(), 1);
        assert_eq!(engine.pending_request(request_id).unwrap().caller, ALICE);

        // 130 mod 100 = 30, the first draw of the middle range
        let receipt = engine
            .on_randomness_ready(request_id, u(130))
            .unwrap()
            .unwrap();

        assert_eq!(receipt.reward_index, 1);
        assert_eq!(receipt.ticket_id, 0);
        assert_eq!(engine.pending_count(), 0);
        assert_eq!(engine.config(0).unwrap().total_opened, 1);
        assert_eq!(engine.user_opened_count(0, ALICE), 1);
        assert_eq!(engine.ticket_owner(0), Some(ALICE));
        assert_eq!(engine.tickets_issued(), 1);
        assert_eq!(engine.proceeds(), ether(1));
        engine.with_custody(|c| {
            assert_eq!(c.fungible_balance(GOLD, ALICE), ether(5));
            assert_eq!(c.fungible_balance(GOLD, VAULT), ether(995));
        });

        let events = events.drain();
        assert_eq!(
            events,
            vec![
                LootBoxEvent::OpenRequested {
                    caller: ALICE,
                    box_id: 0,
                    request_id,
                },
                LootBoxEvent::Opened {
                    caller: ALICE,
                    box_id: 0,
                    request_id,
                    tokens: vec![GOLD],
                    token_ids: vec![U256::ZERO],
                    amounts: vec![ether(5)],
                    ticket_id: 0,
                },
            ]
        );
    }

    #[test]
    fn test_unique_and_semi_fungible_payouts() {
        let mut ledger = AssetLedger::new();
        ledger.mint_unique(SWORD, u(42), VAULT);
        ledger.deposit_semi_fungible(POTION, u(7), VAULT, u(10)).unwrap();
        let engine = LootBoxEngine::new(OWNER, VAULT, ledger, QueuedOracle::new(1));

        let id = engine.create_loot_box(OWNER, "Mixed", "", U256::ZERO, 0).unwrap();
        engine.add_reward(OWNER, id, Reward::unique(SWORD, u(42), 1)).unwrap();
        engine
            .add_reward(OWNER, id, Reward::semi_fungible(POTION, u(7), u(3), 1))
            .unwrap();

        let first = engine.open_box(ALICE, id, U256::ZERO).unwrap();
        let second = engine.open_box(BOB, id, U256::ZERO).unwrap();
        engine.on_randomness_ready(first, u(0)).unwrap();
        engine.on_randomness_ready(second, u(1)).unwrap();

        engine.with_custody(|c| {
            assert_eq!(c.owner_of(SWORD, u(42)), Some(ALICE));
            assert_eq!(c.semi_fungible_balance(POTION, u(7), BOB), u(3));
            assert_eq!(c.semi_fungible_balance(POTION, u(7), VAULT), u(7));
        });
    }

    #[test]
    fn test_inactive_box_rejects_opens() {
        let engine = engine_with_box(100);
        engine.set_active(OWNER, 0, false).unwrap();

        assert_eq!(engine.open_box(ALICE, 0, ether(1)), Err(LootBoxError::BoxInactive(0)));
        assert_eq!(engine.config(0).unwrap().total_opened, 0);
        assert_eq!(engine.pending_count(), 0);
        assert_eq!(engine.proceeds(), U256::ZERO);
    }

    #[test]
    fn test_validation_errors_change_nothing() {
        let engine = engine_with_box(100);
        let empty = engine.create_loot_box(OWNER, "Empty", "", U256::ZERO, 10).unwrap();

        assert_eq!(engine.open_box(ALICE, 99, ether(1)), Err(LootBoxError::InvalidBoxId(99)));
        assert_eq!(
            engine.open_box(ALICE, 0, ether(1) - u(1)),
            Err(LootBoxError::InsufficientPayment {
                required: ether(1),
                provided: ether(1) - u(1),
            })
        );
        assert_eq!(
            engine.open_box(ALICE, empty, U256::ZERO),
            Err(LootBoxError::NoRewardsAvailable(empty))
        );
        assert_eq!(engine.pending_count(), 0);
        assert_eq!(engine.with_oracle_mut(|o| o.queued_count()), 0);
    }

    #[test]
    fn test_overpayment_is_kept() {
        let engine = engine_with_box(100);
        engine.open_box(ALICE, 0, ether(3)).unwrap();
        assert_eq!(engine.proceeds(), ether(3));
    }

    #[test]
    fn test_pending_opens_reserve_supply() {
        let engine = engine_with_box(2);

        let a = engine.open_box(ALICE, 0, ether(1)).unwrap();
        let _b = engine.open_box(BOB, 0, ether(1)).unwrap();
        assert_eq!(engine.open_box(ALICE, 0, ether(1)), Err(LootBoxError::SupplyExhausted(0)));

        engine.on_randomness_ready(a, u(0)).unwrap();
        assert_eq!(engine.open_box(BOB, 0, ether(1)), Err(LootBoxError::SupplyExhausted(0)));
        assert_eq!(engine.config(0).unwrap().total_opened, 1);
    }

    #[test]
    fn test_duplicate_and_unknown_callbacks_are_noops() {
        let engine = engine_with_box(100);
        let request_id = engine.open_box(ALICE, 0, ether(1)).unwrap();

        assert!(engine.on_randomness_ready(request_id, u(0)).unwrap().is_some());
        let events = engine.subscribe();
        assert_eq!(engine.on_randomness_ready(request_id, u(99)).unwrap(), None);
        assert_eq!(engine.on_randomness_ready(12_345, u(1)).unwrap(), None);

        assert_eq!(engine.config(0).unwrap().total_opened, 1);
        assert_eq!(engine.user_opened_count(0, ALICE), 1);
        assert!(!events.has_events());
    }

    #[test]
    fn test_out_of_order_delivery_matches_by_id() {
        let engine = engine_with_box(100);
        let alice = engine.open_box(ALICE, 0, ether(1)).unwrap();
        let bob = engine.open_box(BOB, 0, ether(1)).unwrap();

        let bob_receipt = engine.on_randomness_ready(bob, u(99)).unwrap().unwrap();
        let alice_receipt = engine.on_randomness_ready(alice, u(0)).unwrap().unwrap();

        assert_eq!((bob_receipt.caller, bob_receipt.reward_index), (BOB, 2));
        assert_eq!((alice_receipt.caller, alice_receipt.reward_index), (ALICE, 0));
        assert_eq!(bob_receipt.ticket_id, 0);
        assert_eq!(alice_receipt.ticket_id, 1);
        engine.with_custody(|c| {
            assert_eq!(c.fungible_balance(GOLD, BOB), ether(10));
            assert_eq!(c.fungible_balance(GOLD, ALICE), ether(1));
        });
    }

    #[test]
    fn test_oracle_words_drive_fulfillment() {
        let engine = engine_with_box(0);
        for _ in 0..20 {
            engine.open_box(ALICE, 0, ether(1)).unwrap();
        }
        let deliveries = engine.with_oracle_mut(QueuedOracle::take_all);
        for (request_id, word) in deliveries.into_iter().rev() {
            assert!(engine.on_randomness_ready(request_id, word).unwrap().is_some());
        }
        assert_eq!(engine.config(0).unwrap().total_opened, 20);
        assert_eq!(engine.user_opened_count(0, ALICE), 20);
    }

    #[test]
    fn test_deactivated_box_still_fulfills_accepted_requests() {
        let engine = engine_with_box(100);
        let request_id = engine.open_box(ALICE, 0, ether(1)).unwrap();
        engine.set_active(OWNER, 0, false).unwrap();

        assert!(engine.on_randomness_ready(request_id, u(0)).unwrap().is_some());
        assert_eq!(engine.config(0).unwrap().total_opened, 1);
    }

    #[test]
    fn test_transfer_failure_rolls_back_and_queues() {
        let engine = LootBoxEngine::new(OWNER, VAULT, AssetLedger::new(), QueuedOracle::new(2));
        let id = engine.create_loot_box(OWNER, "Dry", "", ether(1), 1).unwrap();
        engine
            .add_reward(OWNER, id, Reward::fungible(GOLD, ether(10), 1))
            .unwrap();
        let events = engine.subscribe();

        let request_id = engine.open_box(ALICE, id, ether(1)).unwrap();
        let err = engine.on_randomness_ready(request_id, u(0)).unwrap_err();

        assert!(matches!(err, LootBoxError::TransferFailed { request_id: r, .. } if r == request_id));
        assert_eq!(engine.config(id).unwrap().total_opened, 0);
        assert_eq!(engine.user_opened_count(id, ALICE), 0);
        assert_eq!(engine.tickets_issued(), 0);
        assert_eq!(engine.pending_count(), 0);

        let failed = engine.failed_fulfillments();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].reward_index, 0);
        assert!(events
            .drain()
            .iter()
            .any(|e| matches!(e, LootBoxEvent::FulfillmentFailed { request_id: r, .. } if *r == request_id)));

        // the failed open no longer holds supply
        let other = engine.open_box(BOB, id, ether(1)).unwrap();
        assert!(engine.pending_request(other).is_some());
    }

    #[test]
    fn test_retry_failed_pays_once_funded() {
        let engine = LootBoxEngine::new(OWNER, VAULT, AssetLedger::new(), QueuedOracle::new(2));
        let id = engine.create_loot_box(OWNER, "Dry", "", ether(1), 5).unwrap();
        engine
            .add_reward(OWNER, id, Reward::fungible(GOLD, ether(10), 1))
            .unwrap();
        let request_id = engine.open_box(ALICE, id, ether(1)).unwrap();
        assert!(engine.on_randomness_ready(request_id, u(0)).is_err());

        assert!(matches!(
            engine.retry_failed(ALICE, request_id),
            Err(LootBoxError::Unauthorized { .. })
        ));
        assert!(engine.retry_failed(OWNER, request_id).is_err());
        assert_eq!(engine.failed_fulfillments().len(), 1);

        engine.with_custody_mut(|c| c.deposit_fungible(GOLD, VAULT, ether(10)).unwrap());
        let receipt = engine.retry_failed(OWNER, request_id).unwrap();

        assert_eq!(receipt.caller, ALICE);
        assert!(engine.failed_fulfillments().is_empty());
        assert_eq!(engine.config(id).unwrap().total_opened, 1);
        assert_eq!(
            engine.retry_failed(OWNER, request_id),
            Err(LootBoxError::UnknownRequest(request_id))
        );
    }

    #[test]
    fn test_retry_respects_supply_taken_meanwhile() {
        let engine = LootBoxEngine::new(OWNER, VAULT, AssetLedger::new(), QueuedOracle::new(2));
        let id = engine.create_loot_box(OWNER, "One", "", U256::ZERO, 1).unwrap();
        engine.add_reward(OWNER, id, Reward::unique(SWORD, u(1), 1)).unwrap();

        let failed = engine.open_box(ALICE, id, U256::ZERO).unwrap();
        assert!(engine.on_randomness_ready(failed, u(0)).is_err());

        engine.with_custody_mut(|c| c.mint_unique(SWORD, u(1), VAULT));
        let winner = engine.open_box(BOB, id, U256::ZERO).unwrap();
        engine.on_randomness_ready(winner, u(0)).unwrap();

        assert_eq!(engine.retry_failed(OWNER, failed), Err(LootBoxError::SupplyExhausted(id)));
        assert_eq!(engine.config(id).unwrap().total_opened, 1);
    }

    #[test]
    fn test_refund_failed_then_claim() {
        let engine = LootBoxEngine::new(OWNER, VAULT, AssetLedger::new(), QueuedOracle::new(2));
        let id = engine.create_loot_box(OWNER, "Dry", "", ether(2), 0).unwrap();
        engine.add_reward(OWNER, id, Reward::fungible(GOLD, u(1), 1)).unwrap();
        let request_id = engine.open_box(ALICE, id, ether(2)).unwrap();
        assert!(engine.on_randomness_ready(request_id, u(0)).is_err());

        assert_eq!(engine.refund_failed(OWNER, request_id).unwrap(), ether(2));
        assert_eq!(engine.refundable(ALICE), ether(2));
        assert_eq!(engine.proceeds(), U256::ZERO);
        assert!(engine.failed_fulfillments().is_empty());
        assert_eq!(
            engine.refund_failed(OWNER, request_id),
            Err(LootBoxError::UnknownRequest(request_id))
        );

        assert_eq!(engine.claim_refund(ALICE).unwrap(), ether(2));
        assert_eq!(engine.claim_refund(ALICE).unwrap(), U256::ZERO);
        engine.with_custody(|c| assert_eq!(c.native_balance(ALICE), ether(2)));
    }

    #[test]
    fn test_refund_needs_unwithdrawn_proceeds() {
        let engine = LootBoxEngine::new(OWNER, VAULT, AssetLedger::new(), QueuedOracle::new(2));
        let id = engine.create_loot_box(OWNER, "Dry", "", ether(1), 0).unwrap();
        engine.add_reward(OWNER, id, Reward::fungible(GOLD, u(1), 1)).unwrap();
        let request_id = engine.open_box(ALICE, id, ether(1)).unwrap();
        assert!(engine.on_randomness_ready(request_id, u(0)).is_err());

        engine.withdraw_proceeds(OWNER, ether(1)).unwrap();
        assert!(matches!(
            engine.refund_failed(OWNER, request_id),
            Err(LootBoxError::InsufficientProceeds { .. })
        ));
        assert_eq!(engine.failed_fulfillments().len(), 1);
    }

    #[test]
    fn test_expired_requests_are_refunded_and_late_words_ignored() {
        let engine = engine_with_box(1);
        let request_id = engine.open_box(ALICE, 0, ether(1)).unwrap();
        assert_eq!(engine.open_box(BOB, 0, ether(1)), Err(LootBoxError::SupplyExhausted(0)));

        assert_eq!(
            engine.expire_stale_requests(OWNER, Duration::from_secs(3_600)).unwrap(),
            Vec::<RequestId>::new()
        );
        assert_eq!(
            engine.expire_stale_requests(OWNER, Duration::ZERO).unwrap(),
            vec![request_id]
        );

        assert_eq!(engine.pending_count(), 0);
        assert_eq!(engine.refundable(ALICE), ether(1));
        assert_eq!(engine.on_randomness_ready(request_id, u(0)).unwrap(), None);
        assert_eq!(engine.config(0).unwrap().total_opened, 0);
        assert!(engine.open_box(BOB, 0, ether(1)).is_ok());
    }

    #[test]
    fn test_owner_only_operations() {
        let engine = engine_with_box(100);
        let unauthorized = LootBoxError::Unauthorized { caller: ALICE };

        assert_eq!(engine.create_loot_box(ALICE, "x", "", U256::ZERO, 0), Err(unauthorized.clone()));
        assert_eq!(engine.update_price(ALICE, 0, U256::ZERO), Err(unauthorized.clone()));
        assert_eq!(engine.set_active(ALICE, 0, false), Err(unauthorized.clone()));
        assert_eq!(engine.withdraw_fungible(ALICE, GOLD, u(1)), Err(unauthorized.clone()));
        assert_eq!(engine.withdraw_proceeds(ALICE, U256::ZERO), Err(unauthorized.clone()));
        assert_eq!(
            engine.withdraw_unique_or_semi_fungible(ALICE, SWORD, u(1), u(1)),
            Err(unauthorized.clone())
        );
        assert_eq!(engine.expire_stale_requests(ALICE, Duration::ZERO), Err(unauthorized.clone()));
        assert_eq!(engine.refund_failed(ALICE, 1), Err(unauthorized));
    }

    #[test]
    fn test_update_events_carry_full_snapshot() {
        let engine = engine_with_box(100);
        let events = engine.subscribe();

        engine.update_price(OWNER, 0, ether(2)).unwrap();
        engine.set_active(OWNER, 0, false).unwrap();

        assert_eq!(
            events.drain(),
            vec![
                LootBoxEvent::Updated {
                    box_id: 0,
                    name: "Epic Loot Box".to_string(),
                    price: ether(2),
                    max_supply: 100,
                    is_active: true,
                },
                LootBoxEvent::Updated {
                    box_id: 0,
                    name: "Epic Loot Box".to_string(),
                    price: ether(2),
                    max_supply: 100,
                    is_active: false,
                },
            ]
        );
        assert_eq!(
            engine.open_box(ALICE, 0, ether(1)),
            Err(LootBoxError::BoxInactive(0))
        );
    }

    #[test]
    fn test_reward_added_event_has_index() {
        let engine = engine_with_box(100);
        let events = engine.subscribe();
        let index = engine
            .add_reward(OWNER, 0, Reward::unique(SWORD, u(9), 4))
            .unwrap();

        assert_eq!(index, 3);
        assert_eq!(
            events.try_recv(),
            Some(LootBoxEvent::RewardAdded {
                box_id: 0,
                index: 3,
                kind: crate::asset::TokenKind::Unique,
                token: SWORD,
                token_id: u(9),
                amount: u(1),
                weight: 4,
            })
        );
        assert_eq!(engine.total_weight(0).unwrap(), 104);
        assert_eq!(engine.reward(0, 3).unwrap().token_id, u(9));
        assert_eq!(engine.reward(0, 4), None);
    }

    #[test]
    fn test_unselectable_request_refunds_only_from_proceeds() {
        let engine = LootBoxEngine::new(OWNER, VAULT, funded_ledger(), QueuedOracle::new(1));
        let id = engine.create_loot_box(OWNER, "Empty", "", ether(1), 0).unwrap();
        let pending = PendingRequest {
            caller: ALICE,
            box_id: id,
            payment: ether(1),
            requested_at: Instant::now(),
        };
        {
            let mut state = engine.state.lock();
            state.pending.insert(90, pending.clone());
            state.catalog.reserve(id).unwrap();
        }

        assert_eq!(
            engine.on_randomness_ready(90, u(3)),
            Err(LootBoxError::NoRewardsAvailable(id))
        );
        assert_eq!(engine.pending_request(90), Some(pending));
        assert_eq!(engine.refundable(ALICE), U256::ZERO);
        assert_eq!(engine.proceeds(), U256::ZERO);

        engine.state.lock().proceeds = ether(1);
        assert_eq!(
            engine.on_randomness_ready(90, u(3)),
            Err(LootBoxError::NoRewardsAvailable(id))
        );
        assert_eq!(engine.pending_count(), 0);
        assert_eq!(engine.state.lock().catalog.reserved(id).unwrap(), 0);
        assert_eq!(engine.refundable(ALICE), ether(1));
        assert_eq!(engine.proceeds(), U256::ZERO);
        assert_eq!(engine.on_randomness_ready(90, u(3)), Ok(None));
    }

    #[test]
    fn test_unique_reward_with_bad_amount_never_reaches_payout() {
        let mut ledger = AssetLedger::new();
        ledger.mint_unique(SWORD, u(7), VAULT);
        let engine = LootBoxEngine::new(OWNER, VAULT, ledger, QueuedOracle::new(1));
        let id = engine.create_loot_box(OWNER, "Blade", "", U256::ZERO, 0).unwrap();
        let events = engine.subscribe();

        let doubled = Reward {
            amount: u(2),
            ..Reward::unique(SWORD, u(7), 1)
        };
        assert_eq!(
            engine.add_reward(OWNER, id, doubled),
            Err(LootBoxError::InvalidRewardAmount(u(2)))
        );
        assert!(!events.has_events());
        assert!(matches!(
            engine.open_box(ALICE, id, U256::ZERO),
            Err(LootBoxError::NoRewardsAvailable(_))
        ));

        engine.add_reward(OWNER, id, Reward::unique(SWORD, u(7), 1)).unwrap();
        let request_id = engine.open_box(ALICE, id, U256::ZERO).unwrap();
        let receipt = engine.on_randomness_ready(request_id, u(0)).unwrap().unwrap();
        assert_eq!(receipt.reward.amount, u(1));
        assert_eq!(engine.with_custody(|c| c.owner_of(SWORD, u(7))), Some(ALICE));
    }

    #[test]
    fn test_withdrawals() {
        let mut ledger = funded_ledger();
        ledger.mint_unique(SWORD, u(1), VAULT);
        ledger.deposit_semi_fungible(POTION, u(1), VAULT, u(10)).unwrap();
        let engine = LootBoxEngine::new(OWNER, VAULT, ledger, QueuedOracle::new(0));

        engine.withdraw_fungible(OWNER, GOLD, ether(100)).unwrap();
        engine
            .withdraw_unique_or_semi_fungible(OWNER, SWORD, u(1), u(0))
            .unwrap();
        engine
            .withdraw_unique_or_semi_fungible(OWNER, POTION, u(1), u(4))
            .unwrap();
        assert!(matches!(
            engine.withdraw_fungible(OWNER, GOLD, ether(10_000)),
            Err(LootBoxError::WithdrawalFailed(_))
        ));

        engine.with_custody(|c| {
            assert_eq!(c.fungible_balance(GOLD, OWNER), ether(100));
            assert_eq!(c.owner_of(SWORD, u(1)), Some(OWNER));
            assert_eq!(c.semi_fungible_balance(POTION, u(1), OWNER), u(4));
            assert_eq!(c.semi_fungible_balance(POTION, u(1), VAULT), u(6));
        });
    }

    #[test]
    fn test_withdraw_proceeds() {
        let engine = engine_with_box(100);
        engine.open_box(ALICE, 0, ether(1)).unwrap();
        engine.open_box(BOB, 0, ether(2)).unwrap();

        assert_eq!(
            engine.withdraw_proceeds(OWNER, ether(4)),
            Err(LootBoxError::InsufficientProceeds {
                requested: ether(4),
                available: ether(3),
            })
        );
        engine.withdraw_proceeds(OWNER, ether(2)).unwrap();

        assert_eq!(engine.proceeds(), ether(1));
        engine.with_custody(|c| assert_eq!(c.native_balance(OWNER), ether(2)));
    }

    #[test]
    fn test_concurrent_opens_never_exceed_supply() {
        let engine = Arc::new(engine_with_box(25));
        let handles: Vec<_> = (0..8u8)
            .map(|t| {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || {
                    let player = Address::repeat_byte(0x40 + t);
                    (0..10)
                        .filter(|_| engine.open_box(player, 0, ether(1)).is_ok())
                        .count()
                })
            })
            .collect();
        let accepted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(accepted, 25);

        for (request_id, word) in engine.with_oracle_mut(QueuedOracle::take_all) {
            engine.on_randomness_ready(request_id, word).unwrap();
        }
        assert_eq!(engine.config(0).unwrap().total_opened, 25);
    }

    #[test]
    fn test_journal_records_committed_payouts_only() {
        let path = std::env::temp_dir().join(format!(
            "test_engine_journal_{}.lfj",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        let mut ledger = AssetLedger::new();
        ledger.deposit_fungible(GOLD, VAULT, u(1)).unwrap();
        let engine = LootBoxEngine::new(OWNER, VAULT, ledger, QueuedOracle::new(0))
            .with_journal(OpenJournal::open(&path).unwrap());
        let id = engine.create_loot_box(OWNER, "j", "", U256::ZERO, 0).unwrap();
        engine.add_reward(OWNER, id, Reward::fungible(GOLD, u(1), 1)).unwrap();

        let paid = engine.open_box(ALICE, id, U256::ZERO).unwrap();
        let dry = engine.open_box(BOB, id, U256::ZERO).unwrap();
        engine.on_randomness_ready(paid, u(0)).unwrap();
        assert!(engine.on_randomness_ready(dry, u(0)).is_err());
        engine.refund_failed(OWNER, dry).unwrap();
        drop(engine);

        let recovery = OpenJournal::replay(&path).unwrap();
        assert_eq!(
            recovery.committed,
            vec![
                JournalOp::Payout {
                    request_id: paid,
                    caller: ALICE,
                    box_id: id,
                    reward_index: 0,
                    ticket_id: 0,
                },
                JournalOp::Refund {
                    request_id: dry,
                    caller: BOB,
                    amount: U256::ZERO,
                },
            ]
        );
        assert_eq!(recovery.in_doubt, 0);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_journaled_settlements_emit_events() {
        let path = std::env::temp_dir().join(format!(
            "test_engine_journal_events_{}.lfj",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        let mut ledger = AssetLedger::new();
        ledger.deposit_fungible(GOLD, VAULT, u(1)).unwrap();
        let engine = LootBoxEngine::new(OWNER, VAULT, ledger, QueuedOracle::new(0))
            .with_journal(OpenJournal::open(&path).unwrap());
        let id = engine.create_loot_box(OWNER, "j", "", U256::ZERO, 0).unwrap();
        engine.add_reward(OWNER, id, Reward::fungible(GOLD, u(1), 1)).unwrap();
        let events = engine.subscribe();

        let paid = engine.open_box(ALICE, id, U256::ZERO).unwrap();
        let dry = engine.open_box(BOB, id, U256::ZERO).unwrap();
        engine.on_randomness_ready(paid, u(0)).unwrap();
        assert!(engine.on_randomness_ready(dry, u(0)).is_err());

        let events = events.drain();
        assert!(events
            .iter()
            .any(|e| matches!(e, LootBoxEvent::Opened { request_id, ticket_id: 0, .. } if *request_id == paid)));
        assert!(events
            .iter()
            .any(|e| matches!(e, LootBoxEvent::FulfillmentFailed { request_id, .. } if *request_id == dry)));
        drop(engine);

        let recovery = OpenJournal::replay(&path).unwrap();
        assert_eq!(recovery.committed.len(), 1);
        assert_eq!(recovery.in_doubt, 0);
        std::fs::remove_file(&path).ok();
    }
}
