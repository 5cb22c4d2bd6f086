use std::path::Path;

use serde_json::json;

use super::load_testbed;

pub fn run(config: &Path, as_json: bool) {
    let testbed = load_testbed(config);

    if as_json {
        let nodes: Vec<_> = testbed
            .nodes()
            .iter()
            .map(|n| {
                json!({
                    "id": n.id(),
                    "label": n.label(),
                    "family": n.family().name(),
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&nodes).unwrap_or_default()
        );
        return;
    }

    println!(
        "{} {} node(s) in {}:\n",
        testbed.nodes().len(),
        testbed.family(),
        config.display()
    );
    for node in testbed.nodes() {
        println!("  {:>4}  {}", node.id(), node.label());
    }
}
