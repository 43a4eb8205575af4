//! # Asset Custody
//!
//! The transfer protocols the engine pays out through.
//!
//! Balances live outside the engine; [`AssetCustody`] is the seam. Every
//! call either fully succeeds or fails with no effect, which is what lets
//! the engine roll a fulfillment back as a whole.
//!
//! [`AssetLedger`] is the in-memory implementation used by tests, the
//! simulator and the TOML bootstrap.

use alloy_primitives::{Address, U256};
use std::collections::HashMap;

use crate::asset::TokenKind;
use crate::error::TransferError;

/// External holder of fungible, unique and semi-fungible balances.
pub trait AssetCustody: Send {
    /// Moves `amount` of a fungible token.
    ///
    /// # Errors
    ///
    /// Fails without effect if `from` holds less than `amount`.
    fn transfer_fungible(
        &mut self,
        token: Address,
        from: Address,
        to: Address,
        amount: U256,
    ) -> Result<(), TransferError>;

    /// Moves the unique item `token_id`.
    ///
    /// # Errors
    ///
    /// Fails without effect if `from` does not own the item.
    fn transfer_unique(
        &mut self,
        token: Address,
        from: Address,
        to: Address,
        token_id: U256,
    ) -> Result<(), TransferError>;

    /// Moves `amount` units of a semi-fungible `token_id`.
    ///
    /// # Errors
    ///
    /// Fails without effect if `from` holds less than `amount`.
    fn transfer_semi_fungible(
        &mut self,
        token: Address,
        from: Address,
        to: Address,
        token_id: U256,
        amount: U256,
    ) -> Result<(), TransferError>;

    /// Returns true if `holder` owns the unique item `(token, token_id)`.
    fn holds_unique(&self, token: Address, token_id: U256, holder: Address) -> bool;

    /// Pays native currency held by the engine out to `to`.
    ///
    /// # Errors
    ///
    /// Fails without effect if the recipient balance would overflow.
    fn send_native(&mut self, to: Address, amount: U256) -> Result<(), TransferError>;

    /// Dispatches to the protocol matching `kind`.
    ///
    /// # Errors
    ///
    /// Whatever the underlying protocol reports. A unique transfer with an
    /// amount other than one is rejected up front.
    fn transfer(
        &mut self,
        kind: TokenKind,
        token: Address,
        from: Address,
        to: Address,
        token_id: U256,
        amount: U256,
    ) -> Result<(), TransferError> {
        match kind {
            TokenKind::Fungible => self.transfer_fungible(token, from, to, amount),
            TokenKind::Unique => {
                if amount != U256::from(1u64) {
                    return Err(TransferError::InvalidUniqueAmount(amount));
                }
                self.transfer_unique(token, from, to, token_id)
            }
            TokenKind::SemiFungible => {
                self.transfer_semi_fungible(token, from, to, token_id, amount)
            }
        }
    }
}

/// In-memory balances for every asset kind.
#[derive(Clone, Debug, Default)]
pub struct AssetLedger {
    /// (token, holder) -> balance
    fungible: HashMap<(Address, Address), U256>,
    /// (token, token_id) -> owner
    unique: HashMap<(Address, U256), Address>,
    /// (token, token_id, holder) -> balance
    semi_fungible: HashMap<(Address, U256, Address), U256>,
    /// holder -> native currency received from the engine
    native: HashMap<Address, U256>,
}

impl AssetLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Credits `amount` of a fungible token to `holder`.
    ///
    /// # Errors
    ///
    /// `BalanceOverflow` if the balance would exceed `U256::MAX`.
    pub fn deposit_fungible(
        &mut self,
        token: Address,
        holder: Address,
        amount: U256,
    ) -> Result<(), TransferError> {
        let balance = self.fungible.entry((token, holder)).or_insert(U256::ZERO);
        *balance = balance
            .checked_add(amount)
            .ok_or(TransferError::BalanceOverflow {
                token,
                token_id: U256::ZERO,
            })?;
        Ok(())
    }

    /// Assigns a unique item to `holder`, replacing any previous owner.
    pub fn mint_unique(&mut self, token: Address, token_id: U256, holder: Address) {
        self.unique.insert((token, token_id), holder);
    }

    /// Credits `amount` units of a semi-fungible id to `holder`.
    ///
    /// # Errors
    ///
    /// `BalanceOverflow` if the balance would exceed `U256::MAX`.
    pub fn deposit_semi_fungible(
        &mut self,
        token: Address,
        token_id: U256,
        holder: Address,
        amount: U256,
    ) -> Result<(), TransferError> {
        let balance = self
            .semi_fungible
            .entry((token, token_id, holder))
            .or_insert(U256::ZERO);
        *balance = balance
            .checked_add(amount)
            .ok_or(TransferError::BalanceOverflow { token, token_id })?;
        Ok(())
    }

    /// Fungible balance of `holder`.
    #[must_use]
    pub fn fungible_balance(&self, token: Address, holder: Address) -> U256 {
        self.fungible.get(&(token, holder)).copied().unwrap_or_default()
    }

    /// Current owner of a unique item.
    #[must_use]
    pub fn owner_of(&self, token: Address, token_id: U256) -> Option<Address> {
        self.unique.get(&(token, token_id)).copied()
    }

    /// Semi-fungible balance of `holder`.
    #[must_use]
    pub fn semi_fungible_balance(&self, token: Address, token_id: U256, holder: Address) -> U256 {
        self.semi_fungible
            .get(&(token, token_id, holder))
            .copied()
            .unwrap_or_default()
    }

    /// Native currency paid out to `holder`.
    #[must_use]
    pub fn native_balance(&self, holder: Address) -> U256 {
        self.native.get(&holder).copied().unwrap_or_default()
    }

    /// Number of unique items of `token` held by `holder`.
    #[must_use]
    pub fn unique_count(&self, token: Address, holder: Address) -> usize {
        self.unique
            .iter()
            .filter(|((t, _), owner)| *t == token && **owner == holder)
            .count()
    }
}

/// Moves `amount` between two balances in a map, checking both sides first.
fn move_balance<K: std::hash::Hash + Eq>(
    balances: &mut HashMap<K, U256>,
    from: K,
    to: K,
    amount: U256,
    insufficient: impl FnOnce(U256) -> TransferError,
    overflow: impl FnOnce() -> TransferError,
) -> Result<(), TransferError> {
    let available = balances.get(&from).copied().unwrap_or_default();
    if available < amount {
        return Err(insufficient(available));
    }
    if from == to {
        return Ok(());
    }

    let received = balances.get(&to).copied().unwrap_or_default();
    let received = received.checked_add(amount).ok_or_else(overflow)?;

    balances.insert(from, available - amount);
    balances.insert(to, received);
    Ok(())
}

impl AssetCustody for AssetLedger {
    fn transfer_fungible(
        &mut self,
        token: Address,
        from: Address,
        to: Address,
        amount: U256,
    ) -> Result<(), TransferError> {
        move_balance(
            &mut self.fungible,
            (token, from),
            (token, to),
            amount,
            |available| TransferError::InsufficientBalance {
                token,
                token_id: U256::ZERO,
                required: amount,
                available,
            },
            || TransferError::BalanceOverflow {
                token,
                token_id: U256::ZERO,
            },
        )
    }

    fn transfer_unique(
        &mut self,
        token: Address,
        from: Address,
        to: Address,
        token_id: U256,
    ) -> Result<(), TransferError> {
        match self.unique.get_mut(&(token, token_id)) {
            Some(owner) if *owner == from => {
                *owner = to;
                Ok(())
            }
            _ => Err(TransferError::NotHeld {
                token,
                token_id,
                holder: from,
            }),
        }
    }

    fn transfer_semi_fungible(
        &mut self,
        token: Address,
        from: Address,
        to: Address,
        token_id: U256,
        amount: U256,
    ) -> Result<(), TransferError> {
        move_balance(
            &mut self.semi_fungible,
            (token, token_id, from),
            (token, token_id, to),
            amount,
            |available| TransferError::InsufficientBalance {
                token,
                token_id,
                required: amount,
                available,
            },
            || TransferError::BalanceOverflow { token, token_id },
        )
    }

    fn holds_unique(&self, token: Address, token_id: U256, holder: Address) -> bool {
        self.owner_of(token, token_id) == Some(holder)
    }

    fn send_native(&mut self, to: Address, amount: U256) -> Result<(), TransferError> {
        let balance = self.native.entry(to).or_insert(U256::ZERO);
        *balance = balance
            .checked_add(amount)
            .ok_or(TransferError::BalanceOverflow {
                token: Address::ZERO,
                token_id: U256::ZERO,
            })?;
        Ok(())
    }
}
