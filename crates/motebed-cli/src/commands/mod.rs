pub mod calibrate;
pub mod capture;
pub mod compile;
pub mod estimate;
pub mod install;
pub mod nodes;
pub mod parse;
pub mod reset;

use std::path::Path;

use motebed_core::{FanOutReport, MotebedError, Testbed};

/// Load the testbed or exit with the configuration error.
pub fn load_testbed(config: &Path) -> Testbed {
    match Testbed::load(config) {
        Ok(testbed) => testbed,
        Err(e) => fail(&e),
    }
}

/// Print an error (with any per-node detail it carries) and exit.
pub fn fail(e: &MotebedError) -> ! {
    eprintln!("Error: {e}");
    match e {
        MotebedError::Install { report, .. } | MotebedError::FanOut { report, .. } => {
            print_fanout(report);
        }
        MotebedError::Compile { stdout, stderr, .. } => {
            eprint!("{stdout}{stderr}");
        }
        MotebedError::Parse { failures } => {
            for failure in failures {
                eprintln!("  {failure}");
                for line in failure.stderr.lines() {
                    eprintln!("    {line}");
                }
            }
        }
        _ => {}
    }
    std::process::exit(1);
}

/// One line per node: id, OK/FAIL, and the failure detail.
pub fn print_fanout(report: &FanOutReport) {
    for outcome in &report.outcomes {
        let mark = if outcome.success { "OK  " } else { "FAIL" };
        match &outcome.detail {
            Some(detail) => println!("  {mark} node {:<4} {detail}", outcome.node),
            None => println!("  {mark} node {}", outcome.node),
        }
    }
}
