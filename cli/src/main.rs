//! Operator CLI (spec §6.2): a thin shell over the persisted state
//! directory, never duplicating domain logic. Talks to the same on-disk
//! files (`kill_switch_state.json`, `halt_state.latch`, the positions log)
//! that a running process reads and writes — there is no separate RPC
//! surface, so these commands work whether or not the engine is currently
//! running.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use perp_core::config::Config;
use perp_core::persistence::{HaltStore, PositionStore};
use perp_core::reconciler::kill_switch::{build_record, KillSwitchTrigger};
use std::path::PathBuf;
use std::time::SystemTime;

#[derive(Parser)]
#[command(name = "perp-cli", about = "Operator surface for the perpetual-futures execution core")]
struct Cli {
    /// Path to a TOML config file. Falls back to compiled defaults plus
    /// environment overrides if omitted or missing.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print a machine-readable summary of halt state and position counts.
    Status,
    /// Kill-switch controls.
    Kill {
        #[command(subcommand)]
        action: KillAction,
    },
}

#[derive(Subcommand)]
enum KillAction {
    /// Latch the halt file and record an operator-triggered kill switch.
    Activate {
        /// Free-text reason, stored in the kill switch record for audit.
        reason: String,
    },
    /// Clear the halt latch. Required for every trigger except a
    /// margin-critical auto-recovery, which the reconciler handles itself.
    Acknowledge,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;

    let halt_store = HaltStore::new(&config.persistence.data_dir).context("opening halt store")?;
    let position_store = PositionStore::new(&config.persistence.data_dir).context("opening position store")?;

    match cli.command {
        Command::Status => print_status(&halt_store, &position_store),
        Command::Kill { action } => match action {
            KillAction::Activate { reason } => activate(&halt_store, reason),
            KillAction::Acknowledge => acknowledge(&halt_store),
        },
    }
}

fn print_status(halt_store: &HaltStore, position_store: &PositionStore) -> Result<()> {
    let latched = halt_store.is_latched();
    let record = halt_store.read_kill_switch_state().context("reading kill switch state")?;
    let positions = position_store.load_positions().context("loading positions")?;

    println!("halted: {}", latched);
    match &record {
        Some(r) => {
            println!("last kill switch trigger: {}", r.trigger);
            println!("reason: {}", r.reason);
            println!("auto-recoveries recorded: {}", r.auto_recoveries.len());
        }
        None => println!("no kill switch record on disk"),
    }
    println!("active positions: {}", positions.len());
    for position in &positions {
        println!(
            "  {} {} {:?} {}",
            position.position_id(),
            position.symbol(),
            position.side(),
            position.current_state()
        );
    }
    Ok(())
}

fn activate(halt_store: &HaltStore, reason: String) -> Result<()> {
    let record = build_record(KillSwitchTrigger::Operator, reason, SystemTime::now());
    halt_store.write_kill_switch_state(&record).context("writing kill switch state")?;
    halt_store.write_halt_latch().context("writing halt latch")?;
    println!("kill switch activated; halt latch written");
    Ok(())
}

fn acknowledge(halt_store: &HaltStore) -> Result<()> {
    halt_store.clear_halt_latch().context("clearing halt latch")?;
    println!("halt latch cleared; new entries are permitted once the running process re-reads state");
    Ok(())
}
