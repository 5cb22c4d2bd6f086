use std::path::Path;

use super::{fail, load_testbed};

pub fn run(config: &Path) {
    let testbed = load_testbed(config);
    if let Err(e) = testbed.compile() {
        fail(&e);
    }
    println!("Compilation succeeded");
}
