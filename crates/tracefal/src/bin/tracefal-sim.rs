//! Run trace plans against the simulated array.
//!
//! # Usage
//!
//! ```bash
//! # Reserve and start a plan, print the slot assignment
//! tracefal-sim run --plan plan.json
//!
//! # Also write the session report as JSON
//! tracefal-sim run --plan plan.json --json report.json
//!
//! # Show the tile layout of the default array
//! tracefal-sim tiles
//! ```

use std::path::PathBuf;
use std::rc::Rc;

use clap::{Parser, Subcommand};
use snafu::Snafu;
use tracefal::devices::sim::{SimConfig, SimDevice};
use tracefal::plan::{PlanError, SessionReport, TracePlan};
use tracefal::{DeviceHandle, Resource, RscError, TileKind, TileLoc, TileTopology};

/// CLI errors for the simulator binary.
#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("Plan error: {source}"), context(false))]
    Plan { source: PlanError },
    #[snafu(display("Trace error: {source}"), context(false))]
    Trace { source: RscError },
}

#[derive(Parser)]
#[command(name = "tracefal-sim")]
#[command(about = "Trace slot allocation on a simulated AI-engine array")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build, reserve and start the session described by a plan.
    Run {
        /// Path to the plan file (JSON).
        #[arg(short, long)]
        plan: PathBuf,

        /// Write the session report to this file.
        #[arg(short, long)]
        json: Option<PathBuf>,
    },

    /// Print the tile kinds of the simulated array.
    Tiles {
        /// Read the array geometry from this plan instead of the default.
        #[arg(short, long)]
        plan: Option<PathBuf>,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run { plan, json } => cmd_run(plan, json),
        Commands::Tiles { plan } => cmd_tiles(plan),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn cmd_run(plan_path: PathBuf, json: Option<PathBuf>) -> Result<(), CliError> {
    println!("Loading plan from {:?}...", plan_path);
    let plan = TracePlan::load(&plan_path)?;
    plan.device.validate()?;

    let sim = Rc::new(SimDevice::new(plan.device.clone()));
    let device = DeviceHandle::from_backend(sim.clone());
    let mut session = plan.run(device.clone())?;
    let report = SessionReport::capture(&session, &device);

    println!("\n=== Trace Session {} ({}) ===", report.tile, module_name(&report));
    println!(
        "Start: {}  Stop: {}  Mode: {:?}",
        report.start_event, report.stop_event, report.mode
    );
    for slot in &report.slots {
        let source = slot
            .source
            .map(|s| format!("{} {}", s.module, s.event))
            .unwrap_or_else(|| "-".to_string());
        let via = slot
            .broadcast_channel
            .map(|id| format!(" via broadcast {}", id))
            .unwrap_or_default();
        let hw = slot
            .hw_event
            .map(|hw| hw.to_string())
            .unwrap_or_else(|| "?".to_string());
        println!("  slot {}: {} (hw {}) <- {}{}", slot.slot, slot.event, hw, source, via);
    }
    println!("Free slots: {}", report.available_slots);

    if let Some(path) = json {
        report.save(&path)?;
        println!("Report written to {:?}", path);
    }

    session.stop()?;
    session.release()?;

    let stats = sim.stats();
    println!("\n=== Device ===");
    println!(
        "Broadcast channels: {} acquired, {} released",
        stats.broadcast_acquired, stats.broadcast_released
    );
    println!(
        "Programming: {} slot writes, {} control writes, {} control resets, {} slot resets",
        stats.trace_programs, stats.control_programs, stats.control_resets, stats.event_resets
    );
    Ok(())
}

fn cmd_tiles(plan: Option<PathBuf>) -> Result<(), CliError> {
    let config = match plan {
        Some(path) => TracePlan::load(path)?.device,
        None => SimConfig::default(),
    };
    let sim = SimDevice::new(config);
    let config = sim.config();

    println!(
        "{} columns x {} rows, {} broadcast channels per tile",
        config.columns, config.rows, config.broadcast_channels
    );
    for row in (0..config.rows).rev() {
        let line: Vec<&str> = (0..config.columns)
            .map(|col| match sim.tile_kind(TileLoc::new(col, row)) {
                TileKind::Core => "core",
                TileKind::MemTile => "mem ",
                TileKind::ShimNoc => "noc ",
                TileKind::ShimPl => "pl  ",
                TileKind::Unsupported => "----",
            })
            .collect();
        println!("row {:>2}: {}", row, line.join(" "));
    }
    Ok(())
}

fn module_name(report: &SessionReport) -> String {
    report
        .module
        .map(|m| m.to_string())
        .unwrap_or_else(|| "unbound".to_string())
}
