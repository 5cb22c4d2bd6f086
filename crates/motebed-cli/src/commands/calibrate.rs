use std::path::Path;

use motebed_core::MotebedError;

use super::{fail, load_testbed, print_fanout};

pub fn run(config: &Path, output: &Path, flash: bool) {
    let mut testbed = load_testbed(config);
    match testbed.calibrate_live(output, flash) {
        Ok(report) => {
            println!(
                "Calibrated {} node(s), saved to {}",
                report.outcomes.len(),
                output.display()
            );
            for node in testbed.nodes() {
                println!(
                    "  {:<16} {} points",
                    node.label(),
                    node.state().calibration.len()
                );
            }
        }
        Err(e) => {
            // successful nodes were still merged into the output
            if let MotebedError::FanOut { report, .. } = &e {
                print_fanout(report);
                if report.outcomes.iter().any(|o| o.success) {
                    eprintln!("Partial calibration saved to {}", output.display());
                }
            }
            fail(&e);
        }
    }
}
