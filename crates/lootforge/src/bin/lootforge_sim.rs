//! # LOOTFORGE Simulator
//!
//! Loads a simulation file (the shipped `data/lootbox.toml` by default),
//! runs concurrent opens against a threaded oracle and prints the report.
//!
//! ```text
//! RUST_LOG=lootforge_economy=debug cargo run --bin lootforge_sim -- path/to/sim.toml
//! ```

use lootforge::{run_simulation, SimFile};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let path = std::env::args_os().nth(1).map_or_else(
        || PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/data/lootbox.toml")),
        PathBuf::from,
    );
    info!(path = %path.display(), "loading simulation");

    let file = SimFile::from_file(&path)?;
    let report = run_simulation(&file)?;

    println!("═══════════════════════════════════════════════════════════");
    println!("  LOOTFORGE SIMULATION REPORT");
    println!("═══════════════════════════════════════════════════════════");
    print!("{report}");

    Ok(())
}
