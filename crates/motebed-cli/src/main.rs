//! CLI for motebed: drive a sensor-node testbed and build per-state power
//! models from its energy traces.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "motebed")]
#[command(about = "motebed: sensor-node testbed control and per-state power estimation")]
#[command(version = motebed_core::VERSION)]
struct Cli {
    /// Testbed configuration file (JSON)
    #[arg(long, short, global = true, default_value = "testbed.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the configured nodes
    Nodes {
        /// Print as JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Build the firmware with the configured make command
    Compile,

    /// Flash the firmware onto every node in parallel
    Install {
        /// Build the firmware first
        #[arg(long)]
        compile: bool,
    },

    /// Reset every node
    Reset {
        /// Reset nodes one at a time with a random pause of up to this many
        /// milliseconds between them
        #[arg(long)]
        stagger_ms: Option<u64>,
    },

    /// Capture serial output of every node into <BASE>.<label>.log
    Capture {
        /// Base path of the per-node capture files
        base: PathBuf,

        /// Stop capturing after this many seconds (default: until every
        /// listener exits or Ctrl+C)
        #[arg(long)]
        timeout_sec: Option<f64>,
    },

    /// Calibrate every node's energy meter and save the result
    Calibrate {
        /// Calibration file to write
        #[arg(long, default_value = "calibration.json")]
        output: PathBuf,

        /// Build and install the calibration firmware first
        #[arg(long)]
        flash: bool,
    },

    /// Decode and post-process captured logs into power traces
    Parse {
        /// Base path of the per-node capture files
        base: PathBuf,

        /// Only run the decode step
        #[arg(long)]
        decode_only: bool,
    },

    /// Estimate per-state average power of every node
    Estimate {
        /// Base path of the per-node trace files (<BASE>.<label>.log.pwr)
        base: PathBuf,

        /// Calibration file written by `calibrate`
        #[arg(long, default_value = "calibration.json")]
        calibration: PathBuf,

        /// Least squares solver: normal (closed form) or nnls (non-negative)
        #[arg(long, default_value = "normal", value_parser = ["normal", "nnls"])]
        solver: String,

        /// Write the full report as JSON to this path
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = cli.config.as_path();

    match cli.command {
        Commands::Nodes { json } => commands::nodes::run(config, json),
        Commands::Compile => commands::compile::run(config),
        Commands::Install { compile } => commands::install::run(config, compile),
        Commands::Reset { stagger_ms } => commands::reset::run(config, stagger_ms),
        Commands::Capture { base, timeout_sec } => {
            commands::capture::run(config, &base, timeout_sec)
        }
        Commands::Calibrate { output, flash } => commands::calibrate::run(config, &output, flash),
        Commands::Parse { base, decode_only } => commands::parse::run(config, &base, decode_only),
        Commands::Estimate {
            base,
            calibration,
            solver,
            output,
        } => commands::estimate::run(commands::estimate::EstimateCommandConfig {
            config,
            base: &base,
            calibration: &calibration,
            solver: &solver,
            output: output.as_deref(),
        }),
    }
}
