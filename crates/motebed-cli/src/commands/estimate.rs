use std::path::Path;

use motebed_core::{NodeEstimate, Solver};

use super::{fail, load_testbed};

pub struct EstimateCommandConfig<'a> {
    pub config: &'a Path,
    pub base: &'a Path,
    pub calibration: &'a Path,
    pub solver: &'a str,
    pub output: Option<&'a Path>,
}

pub fn run(cfg: EstimateCommandConfig<'_>) {
    let mut testbed = load_testbed(cfg.config);
    if let Err(e) = testbed.calibrate_from_file(cfg.calibration) {
        fail(&e);
    }

    let solver = match cfg.solver {
        "nnls" => Solver::NonNegative,
        _ => Solver::NormalEquations,
    };
    let report = testbed.estimate_all(cfg.base, solver);

    for node in &report.nodes {
        println!("{} (node {})", node.label, node.node);
        match &node.outcome {
            NodeEstimate::Solved { profile } => {
                for (state, power) in &profile.state_power {
                    println!("  {state:<20} {power:>12.4}");
                }
                if !profile.always_off.is_empty() {
                    println!("  always off: {}", profile.always_off.join(", "));
                }
                if !profile.always_on.is_empty() {
                    println!("  always on:  {}", profile.always_on.join(", "));
                }
                println!("  {:<20} {:>12.4}", "average", profile.average_power);
            }
            NodeEstimate::Singular { reason } => println!("  singular: {reason}"),
            NodeEstimate::Failed { error } => println!("  failed: {error}"),
        }
        println!();
    }
    println!(
        "{}/{} node(s) solved with {}",
        report.solved(),
        report.nodes.len(),
        report.solver
    );

    if let Some(path) = cfg.output {
        let written = serde_json::to_string_pretty(&report)
            .map_err(std::io::Error::other)
            .and_then(|json| std::fs::write(path, json));
        match written {
            Ok(()) => println!("Report written to {}", path.display()),
            Err(e) => {
                eprintln!("Error writing {}: {e}", path.display());
                std::process::exit(1);
            }
        }
    }
}
