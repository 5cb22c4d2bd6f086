use std::path::Path;
use std::time::Duration;

use super::{fail, load_testbed, print_fanout};

pub fn run(config: &Path, stagger_ms: Option<u64>) {
    let mut testbed = load_testbed(config);
    let result = match stagger_ms {
        Some(ms) => testbed.reset_staggered(Duration::from_millis(ms)),
        None => testbed.reset_all(),
    };
    match result {
        Ok(report) => {
            println!("Reset {} node(s)", report.outcomes.len());
            print_fanout(&report);
        }
        Err(e) => fail(&e),
    }
}
