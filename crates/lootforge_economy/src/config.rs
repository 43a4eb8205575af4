//! # Engine Configuration
//!
//! Catalogs, vault funding and engine settings loaded from TOML.
//!
//! Addresses and 256-bit amounts are written as strings (`0x…` hex or
//! decimal) since TOML integers stop at 64 bits.
//!
//! ```toml
//! owner = "0x0101010101010101010101010101010101010101"
//! vault = "0xeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee"
//! oracle_seed = 7
//!
//! [[boxes]]
//! name = "Starter"
//! price = "1000000000000000000"
//! max_supply = 100
//!
//! [[boxes.rewards]]
//! kind = "fungible"
//! token = "0x1010101010101010101010101010101010101010"
//! amount = "5"
//! weight = 70
//! ```
//!
//! The whole file is validated before anything is applied, so a bad entry
//! leaves the engine untouched.

use alloy_primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::asset::{BoxId, Reward, TokenKind};
use crate::custody::{AssetCustody, AssetLedger};
use crate::engine::LootBoxEngine;
use crate::error::{LootBoxError, LootBoxResult};
use crate::journal::OpenJournal;
use crate::randomness::RandomnessSource;

const fn default_request_timeout_secs() -> u64 {
    3_600
}

const fn default_active() -> bool {
    true
}

/// Top-level engine configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Owner address.
    pub owner: String,
    /// Vault address rewards are paid from.
    pub vault: String,
    /// Payout journal location. No journal when absent.
    #[serde(default)]
    pub journal_path: Option<PathBuf>,
    /// Seed for the bundled oracles.
    #[serde(default)]
    pub oracle_seed: u64,
    /// Age after which pending requests may be expired.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Catalog entries, created in file order.
    #[serde(default)]
    pub boxes: Vec<BoxSpec>,
    /// Initial vault holdings.
    #[serde(default)]
    pub funding: Vec<FundingSpec>,
}

/// One `[[boxes]]` entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BoxSpec {
    /// Display name.
    pub name: String,
    /// Display description.
    #[serde(default)]
    pub description: String,
    /// Opening price.
    pub price: String,
    /// Supply cap, 0 for unlimited.
    #[serde(default)]
    pub max_supply: u64,
    /// Whether the box starts open for sale.
    #[serde(default = "default_active")]
    pub active: bool,
    /// Reward table, in append order.
    #[serde(default)]
    pub rewards: Vec<RewardSpec>,
}

/// One `[[boxes.rewards]]` entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RewardSpec {
    /// Transfer protocol.
    pub kind: TokenKind,
    /// Asset contract.
    pub token: String,
    /// Item id, required for unique and semi-fungible rewards.
    #[serde(default)]
    pub token_id: Option<String>,
    /// Quantity, required for fungible and semi-fungible rewards.
    #[serde(default)]
    pub amount: Option<String>,
    /// Relative weight.
    pub weight: u32,
}

/// One `[[funding]]` entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FundingSpec {
    /// Asset kind.
    pub kind: TokenKind,
    /// Asset contract.
    pub token: String,
    /// Recipient, the vault when absent.
    #[serde(default)]
    pub holder: Option<String>,
    /// Item id for unique and semi-fungible assets.
    #[serde(default)]
    pub token_id: Option<String>,
    /// Quantity for fungible and semi-fungible assets.
    #[serde(default)]
    pub amount: Option<String>,
}

/// A box entry with every field parsed.
struct ParsedBox<'a> {
    spec: &'a BoxSpec,
    price: U256,
    rewards: Vec<Reward>,
}

fn invalid(msg: impl Into<String>) -> LootBoxError {
    LootBoxError::InvalidConfig(msg.into())
}

/// Parses a `0x`-prefixed hex address.
///
/// # Errors
///
/// `InvalidConfig` naming `field`.
pub fn parse_address(field: &str, value: &str) -> LootBoxResult<Address> {
    value
        .trim()
        .parse::<Address>()
        .map_err(|e| invalid(format!("{field}: bad address {value:?}: {e}")))
}

/// Parses a decimal or `0x`-prefixed hex 256-bit integer.
///
/// # Errors
///
/// `InvalidConfig` naming `field`.
pub fn parse_u256(field: &str, value: &str) -> LootBoxResult<U256> {
    value
        .trim()
        .replace('_', "")
        .parse::<U256>()
        .map_err(|e| invalid(format!("{field}: bad amount {value:?}: {e}")))
}

fn required<'a>(field: &str, value: Option<&'a String>) -> LootBoxResult<&'a str> {
    value
        .map(String::as_str)
        .ok_or_else(|| invalid(format!("{field} is required")))
}

impl RewardSpec {
    /// Builds the catalog reward.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` for missing or malformed fields, a zero weight, or a
    /// unique reward with an amount other than one.
    pub fn to_reward(&self, at: &str) -> LootBoxResult<Reward> {
        if self.weight == 0 {
            return Err(invalid(format!("{at}: weight must be greater than 0")));
        }
        let token = parse_address(&format!("{at}.token"), &self.token)?;
        let field = |name: &str| format!("{at}.{name}");

        match self.kind {
            TokenKind::Fungible => {
                let amount = parse_u256(&field("amount"), required(&field("amount"), self.amount.as_ref())?)?;
                Ok(Reward::fungible(token, amount, self.weight))
            }
            TokenKind::Unique => {
                let token_id =
                    parse_u256(&field("token_id"), required(&field("token_id"), self.token_id.as_ref())?)?;
                if let Some(amount) = &self.amount {
                    if parse_u256(&field("amount"), amount)? != U256::from(1u64) {
                        return Err(invalid(format!("{at}: unique rewards pay exactly one item")));
                    }
                }
                Ok(Reward::unique(token, token_id, self.weight))
            }
            TokenKind::SemiFungible => {
                let token_id =
                    parse_u256(&field("token_id"), required(&field("token_id"), self.token_id.as_ref())?)?;
                let amount = parse_u256(&field("amount"), required(&field("amount"), self.amount.as_ref())?)?;
                Ok(Reward::semi_fungible(token, token_id, amount, self.weight))
            }
        }
    }
}

impl EngineConfig {
    /// Parses a configuration from TOML text.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` on syntax errors, unknown keys or bad addresses.
    pub fn from_toml_str(text: &str) -> LootBoxResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| invalid(e.to_string()))?;
        config.owner_address()?;
        config.vault_address()?;
        Ok(config)
    }

    /// Reads and parses a configuration file.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> LootBoxResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| invalid(format!("failed to read {}: {e}", path.display())))?;
        let config = Self::from_toml_str(&text)?;
        info!(path = %path.display(), boxes = config.boxes.len(), "configuration loaded");
        Ok(config)
    }

    /// Parsed owner address.
    ///
    /// # Errors
    ///
    /// `InvalidConfig`.
    pub fn owner_address(&self) -> LootBoxResult<Address> {
        parse_address("owner", &self.owner)
    }

    /// Parsed vault address.
    ///
    /// # Errors
    ///
    /// `InvalidConfig`.
    pub fn vault_address(&self) -> LootBoxResult<Address> {
        parse_address("vault", &self.vault)
    }

    /// Age after which pending requests count as stale.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    fn parse_boxes(&self) -> LootBoxResult<Vec<ParsedBox<'_>>> {
        self.boxes
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                let at = format!("boxes[{i}]");
                let price = parse_u256(&format!("{at}.price"), &spec.price)?;
                let rewards = spec
                    .rewards
                    .iter()
                    .enumerate()
                    .map(|(j, r)| r.to_reward(&format!("{at}.rewards[{j}]")))
                    .collect::<LootBoxResult<Vec<_>>>()?;
                Ok(ParsedBox { spec, price, rewards })
            })
            .collect()
    }

    /// Creates every configured box on `engine` as its owner.
    ///
    /// Returns the new box ids in file order.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if any entry is malformed (nothing is created then),
    /// or `Unauthorized` if the engine has a different owner.
    pub fn apply_catalog<C: AssetCustody, R: RandomnessSource>(
        &self,
        engine: &LootBoxEngine<C, R>,
    ) -> LootBoxResult<Vec<BoxId>> {
        let owner = self.owner_address()?;
        let parsed = self.parse_boxes()?;

        let mut ids = Vec::with_capacity(parsed.len());
        for entry in parsed {
            let id = engine.create_loot_box(
                owner,
                &entry.spec.name,
                &entry.spec.description,
                entry.price,
                entry.spec.max_supply,
            )?;
            for reward in entry.rewards {
                engine.add_reward(owner, id, reward)?;
            }
            if !entry.spec.active {
                engine.set_active(owner, id, false)?;
            }
            ids.push(id);
        }

        info!(boxes = ids.len(), "catalog applied");
        Ok(ids)
    }

    /// Deposits every `[[funding]]` entry into `ledger`.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` for malformed entries or balance overflow.
    pub fn fund_ledger(&self, ledger: &mut AssetLedger) -> LootBoxResult<()> {
        let vault = self.vault_address()?;

        for (i, entry) in self.funding.iter().enumerate() {
            let at = format!("funding[{i}]");
            let field = |name: &str| format!("{at}.{name}");
            let token = parse_address(&field("token"), &entry.token)?;
            let holder = match &entry.holder {
                Some(h) => parse_address(&field("holder"), h)?,
                None => vault,
            };
            let overflow = |e: crate::error::TransferError| invalid(format!("{at}: {e}"));

            match entry.kind {
                TokenKind::Fungible => {
                    let amount =
                        parse_u256(&field("amount"), required(&field("amount"), entry.amount.as_ref())?)?;
                    ledger.deposit_fungible(token, holder, amount).map_err(overflow)?;
                }
                TokenKind::Unique => {
                    let token_id =
                        parse_u256(&field("token_id"), required(&field("token_id"), entry.token_id.as_ref())?)?;
                    ledger.mint_unique(token, token_id, holder);
                }
                TokenKind::SemiFungible => {
                    let token_id =
                        parse_u256(&field("token_id"), required(&field("token_id"), entry.token_id.as_ref())?)?;
                    let amount =
                        parse_u256(&field("amount"), required(&field("amount"), entry.amount.as_ref())?)?;
                    ledger
                        .deposit_semi_fungible(token, token_id, holder, amount)
                        .map_err(overflow)?;
                }
            }
        }

        Ok(())
    }

    /// Opens the configured journal, if any.
    ///
    /// # Errors
    ///
    /// `Journal` if the file cannot be opened.
    pub fn open_journal(&self) -> LootBoxResult<Option<OpenJournal>> {
        self.journal_path.as_ref().map(OpenJournal::open).transpose()
    }

    /// Builds a funded in-memory engine with the configured catalog and journal.
    ///
    /// # Errors
    ///
    /// Any error from [`Self::fund_ledger`], [`Self::open_journal`] or
    /// [`Self::apply_catalog`].
    pub fn build_engine<R: RandomnessSource>(
        &self,
        oracle: R,
    ) -> LootBoxResult<LootBoxEngine<AssetLedger, R>> {
        let mut ledger = AssetLedger::new();
        self.fund_ledger(&mut ledger)?;
        // reject a bad catalog before the journal file is touched
        self.parse_boxes()?;

        let mut engine = LootBoxEngine::new(self.owner_address()?, self.vault_address()?, ledger, oracle);
        if let Some(journal) = self.open_journal()? {
            engine = engine.with_journal(journal);
        }
        self.apply_catalog(&engine)?;
        Ok(engine)
    }
}
