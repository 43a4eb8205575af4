//! # LOOTFORGE Simulation
//!
//! Drives a configured engine the way a live deployment would: many players
//! open boxes at once while a separate thread feeds oracle deliveries back
//! into the engine.
//!
//! ```text
//! ┌──────────┐ open_box ┌──────────┐ request ┌──────────────┐
//! │ players  │ ───────▶ │  engine  │ ──────▶ │ oracle thread │
//! │ (N thr.) │          └──────────┘         └──────────────┘
//! └──────────┘               ▲                      │ (id, word)
//!                            │ on_randomness_ready  ▼
//!                            └────────────── fulfiller thread
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::pedantic)]

use crossbeam_channel::{select, unbounded, Receiver};
use lootforge_economy::config::parse_u256;
use lootforge_economy::{
    Address, AssetLedger, BoxId, EngineConfig, LootBoxEngine, LootBoxError, LootBoxResult,
    RequestId, ThreadedOracle, U256,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

/// A simulation file: an `[engine]` table plus a `[simulation]` table.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimFile {
    /// Engine and catalog configuration.
    pub engine: EngineConfig,
    /// Load to generate.
    pub simulation: SimulationConfig,
}

/// Load parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimulationConfig {
    /// Number of concurrent players.
    pub players: u32,
    /// Opens attempted by each player.
    pub opens_per_player: u32,
    /// Payment attached to every open.
    pub payment: String,
    /// Seconds the fulfiller waits for a delivery before giving up.
    #[serde(default = "default_delivery_timeout_secs")]
    pub delivery_timeout_secs: u64,
}

const fn default_delivery_timeout_secs() -> u64 {
    5
}

impl SimFile {
    /// Parses a simulation file from TOML text.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` on syntax errors or unknown keys.
    pub fn from_toml_str(text: &str) -> LootBoxResult<Self> {
        let file: Self =
            toml::from_str(text).map_err(|e| LootBoxError::InvalidConfig(e.to_string()))?;
        file.engine.owner_address()?;
        file.engine.vault_address()?;
        parse_u256("simulation.payment", &file.simulation.payment)?;
        Ok(file)
    }

    /// Reads and parses a simulation file.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> LootBoxResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            LootBoxError::InvalidConfig(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }
}

/// Per-box outcome.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BoxSummary {
    /// Box id.
    pub id: BoxId,
    /// Display name.
    pub name: String,
    /// Successful opens.
    pub total_opened: u64,
    /// Supply cap, 0 for unlimited.
    pub max_supply: u64,
    /// Payouts per reward index.
    pub hits: Vec<u64>,
}

/// Outcome of a simulation run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SimulationReport {
    /// Opens attempted.
    pub attempted: u64,
    /// Opens accepted by the engine.
    pub accepted: u64,
    /// Rejected opens by error kind.
    pub rejected: BTreeMap<String, u64>,
    /// Opens paid out.
    pub fulfilled: u64,
    /// Payouts that failed and were refunded by the owner.
    pub refunded_failures: u64,
    /// Requests cancelled because their randomness never arrived.
    pub expired: u64,
    /// Opening tickets the engine issued.
    pub tickets: u64,
    /// Native currency kept by the engine.
    pub proceeds: U256,
    /// Per-box results.
    pub boxes: Vec<BoxSummary>,
}

impl fmt::Display for SimulationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "opens attempted : {}", self.attempted)?;
        writeln!(f, "opens accepted  : {}", self.accepted)?;
        for (reason, count) in &self.rejected {
            writeln!(f, "  rejected {reason:<18}: {count}")?;
        }
        writeln!(f, "fulfilled       : {}", self.fulfilled)?;
        writeln!(f, "refunded        : {}", self.refunded_failures)?;
        writeln!(f, "expired         : {}", self.expired)?;
        writeln!(f, "tickets         : {}", self.tickets)?;
        writeln!(f, "proceeds        : {}", self.proceeds)?;
        for summary in &self.boxes {
            let cap = if summary.max_supply == 0 {
                "unlimited".to_string()
            } else {
                summary.max_supply.to_string()
            };
            writeln!(
                f,
                "box {} {:?}: opened {} / {cap}, hits {:?}",
                summary.id, summary.name, summary.total_opened, summary.hits
            )?;
        }
        Ok(())
    }
}

fn rejection_kind(err: &LootBoxError) -> &'static str {
    match err {
        LootBoxError::SupplyExhausted(_) => "supply_exhausted",
        LootBoxError::BoxInactive(_) => "box_inactive",
        LootBoxError::InsufficientPayment { .. } => "insufficient_payment",
        LootBoxError::NoRewardsAvailable(_) => "no_rewards",
        LootBoxError::InvalidBoxId(_) => "invalid_box",
        _ => "other",
    }
}

fn player_address(index: u32) -> Address {
    let mut bytes = [0u8; 20];
    bytes[0] = 0xAA;
    bytes[16..].copy_from_slice(&index.to_be_bytes());
    Address::from(bytes)
}

type SimEngine = LootBoxEngine<AssetLedger, ThreadedOracle>;

/// Feeds deliveries into the engine until `expected` requests have been seen.
///
/// `expected` arrives on `total_rx` once every player has finished.
fn run_fulfiller(
    engine: &SimEngine,
    deliveries: &Receiver<(RequestId, U256)>,
    total_rx: &Receiver<u64>,
    timeout: Duration,
) -> (BTreeMap<(BoxId, usize), u64>, u64) {
    let mut hits = BTreeMap::new();
    let mut seen = 0u64;
    let mut expected: Option<u64> = None;

    while expected.map_or(true, |total| seen < total) {
        select! {
            recv(deliveries) -> msg => {
                let Ok((request_id, word)) = msg else { break };
                seen += 1;
                match engine.on_randomness_ready(request_id, word) {
                    Ok(Some(receipt)) => {
                        *hits.entry((receipt.box_id, receipt.reward_index)).or_insert(0) += 1;
                    }
                    Ok(None) => {}
                    Err(e) => warn!(request_id, error = %e, "fulfillment failed"),
                }
            }
            recv(total_rx) -> msg => match msg {
                Ok(total) => expected = Some(total),
                // the driver gave up before counting its players
                Err(_) => break,
            },
            default(timeout) => {
                warn!(seen, "oracle delivery timed out");
                break;
            }
        }
    }

    (hits, seen)
}

/// Runs the simulation described by `file` and returns its report.
///
/// # Errors
///
/// Configuration errors, or engine errors during the owner's cleanup.
pub fn run_simulation(file: &SimFile) -> LootBoxResult<SimulationReport> {
    let payment = parse_u256("simulation.payment", &file.simulation.payment)?;
    let (oracle, deliveries) = ThreadedOracle::new(file.engine.oracle_seed)?;
    let engine = Arc::new(file.engine.build_engine(oracle)?);
    let owner = engine.owner();
    let box_count = engine.box_count() as u64;

    info!(
        players = file.simulation.players,
        opens_per_player = file.simulation.opens_per_player,
        boxes = box_count,
        "simulation starting"
    );

    let (total_tx, total_rx) = unbounded();
    let timeout = Duration::from_secs(file.simulation.delivery_timeout_secs);
    let fulfiller = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || run_fulfiller(&engine, &deliveries, &total_rx, timeout))
    };

    let players: Vec<_> = (0..file.simulation.players)
        .map(|index| {
            let engine = Arc::clone(&engine);
            let opens = file.simulation.opens_per_player;
            thread::spawn(move || {
                let player = player_address(index);
                let mut accepted = 0u64;
                let mut rejected: BTreeMap<String, u64> = BTreeMap::new();
                for n in 0..opens {
                    let box_id = if box_count == 0 {
                        0
                    } else {
                        (u64::from(index) + u64::from(n)) % box_count
                    };
                    match engine.open_box(player, box_id, payment) {
                        Ok(_) => accepted += 1,
                        Err(e) => *rejected.entry(rejection_kind(&e).to_string()).or_insert(0) += 1,
                    }
                }
                (accepted, rejected)
            })
        })
        .collect();

    let mut report = SimulationReport {
        attempted: u64::from(file.simulation.players) * u64::from(file.simulation.opens_per_player),
        ..SimulationReport::default()
    };
    for handle in players {
        let (accepted, rejected) = handle
            .join()
            .map_err(|_| LootBoxError::InvalidConfig("player thread panicked".to_string()))?;
        report.accepted += accepted;
        for (kind, count) in rejected {
            *report.rejected.entry(kind).or_insert(0) += count;
        }
    }
    // the fulfiller may already have exited on timeout
    let _ = total_tx.send(report.accepted);

    let (hits, _seen) = fulfiller
        .join()
        .map_err(|_| LootBoxError::InvalidConfig("fulfiller thread panicked".to_string()))?;

    for failed in engine.failed_fulfillments() {
        engine.refund_failed(owner, failed.request_id)?;
        report.refunded_failures += 1;
    }
    report.expired = engine
        .expire_stale_requests(owner, Duration::ZERO)?
        .len() as u64;

    for id in 0..box_count {
        let config = engine.config(id)?;
        let rewards = engine.rewards(id)?.len();
        report.fulfilled += config.total_opened;
        report.boxes.push(BoxSummary {
            id,
            name: config.name,
            total_opened: config.total_opened,
            max_supply: config.max_supply,
            hits: (0..rewards)
                .map(|i| hits.get(&(id, i)).copied().unwrap_or(0))
                .collect(),
        });
    }
    report.tickets = engine.tickets_issued();
    report.proceeds = engine.proceeds();

    info!(
        accepted = report.accepted,
        fulfilled = report.fulfilled,
        refunded = report.refunded_failures,
        expired = report.expired,
        tickets = report.tickets,
        "simulation finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_player_addresses_are_distinct() {
        assert_ne!(player_address(0), player_address(1));
        assert_eq!(player_address(0x0102_0304).as_slice()[16..], [1, 2, 3, 4]);
    }

    #[test]
    fn test_rejection_kinds() {
        assert_eq!(rejection_kind(&LootBoxError::SupplyExhausted(1)), "supply_exhausted");
        assert_eq!(rejection_kind(&LootBoxError::InvalidWeight), "other");
    }

    #[test]
    fn test_report_display_lists_boxes() {
        let report = SimulationReport {
            attempted: 4,
            accepted: 3,
            boxes: vec![BoxSummary {
                id: 0,
                name: "Starter".to_string(),
                total_opened: 3,
                max_supply: 0,
                hits: vec![2, 1],
            }],
            ..SimulationReport::default()
        };
        let text = report.to_string();
        assert!(text.contains("opens accepted  : 3"));
        assert!(text.contains("opened 3 / unlimited, hits [2, 1]"));
    }
}
