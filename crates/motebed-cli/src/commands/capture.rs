use std::path::Path;
use std::time::Duration;

use motebed_core::CaptureMode;

use super::{fail, load_testbed};

pub fn run(config: &Path, base: &Path, timeout_sec: Option<f64>) {
    let mut testbed = load_testbed(config);

    // Ctrl+C stops the listeners instead of killing us mid-capture
    let stop = testbed.capture_stop_signal();
    ctrlc::set_handler(move || stop.trigger()).unwrap_or_else(|e| {
        eprintln!("Error setting Ctrl+C handler: {e}");
        std::process::exit(1);
    });

    let timeout = timeout_sec.map(Duration::from_secs_f64);
    println!("Capturing {} node(s)", testbed.nodes().len());
    println!("  Output:    {}.<label>.log", base.display());
    match timeout {
        Some(t) => println!("  Duration:  {}s", t.as_secs_f64()),
        None => println!("  Duration:  until listeners exit or Ctrl+C"),
    }
    println!();

    let report = match testbed.capture(base, CaptureMode::Blocking { timeout }) {
        Ok(report) => report,
        Err(e) => fail(&e),
    };

    for session in &report.sessions {
        println!(
            "  {:<16} {:>8} messages  exit {}",
            session.label,
            session.messages,
            session
                .returncode
                .map_or_else(|| "-".to_string(), |c| c.to_string())
        );
    }
    println!();
    let ending = if report.cancelled {
        "cancelled"
    } else if report.timed_out {
        "timed out"
    } else {
        "finished"
    };
    println!(
        "Capture {} {ending} after {:.1}s: {} messages total",
        report.generation,
        report.elapsed_ms as f64 / 1000.0,
        report.total_messages()
    );
}
