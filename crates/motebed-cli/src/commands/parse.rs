use std::path::Path;

use super::{fail, load_testbed};

pub fn run(config: &Path, base: &Path, decode_only: bool) {
    let testbed = load_testbed(config);

    if let Err(e) = testbed.parse_logs_all(base) {
        fail(&e);
    }
    println!("Decoded {} log(s)", testbed.nodes().len());

    if decode_only {
        return;
    }
    if let Err(e) = testbed.process_logs_all(base) {
        fail(&e);
    }
    println!("Processed {} log(s)", testbed.nodes().len());
}
