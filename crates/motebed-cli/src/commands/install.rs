use std::path::Path;

use super::{fail, load_testbed, print_fanout};

pub fn run(config: &Path, compile: bool) {
    let mut testbed = load_testbed(config);
    if compile && let Err(e) = testbed.compile() {
        fail(&e);
    }

    match testbed.install_all() {
        Ok(report) => {
            println!(
                "Installed {} node(s) in {:.1}s",
                report.outcomes.len(),
                report.elapsed_ms as f64 / 1000.0
            );
            print_fanout(&report);
        }
        Err(e) => fail(&e),
    }
}
