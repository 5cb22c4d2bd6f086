//! # motebed-core
//!
//! **Drive a testbed of instrumented sensor nodes and find out where their
//! energy goes.**
//!
//! `motebed-core` builds and flashes firmware on many nodes in parallel,
//! supervises one serial capture per node, and turns the decoded energy
//! traces into a per-state power model: how much power each firmware state
//! (CPU, radio, LEDs, ...) draws on average.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::path::Path;
//! use motebed_core::{CaptureMode, Solver, Testbed};
//!
//! let mut testbed = Testbed::load(Path::new("testbed.json"))?;
//! testbed.calibrate_from_file(Path::new("calibration.json"))?;
//!
//! testbed.compile()?;
//! testbed.install_all()?;
//!
//! let base = Path::new("runs/boot");
//! testbed.capture(base, CaptureMode::Blocking { timeout: Some(std::time::Duration::from_secs(60)) })?;
//! testbed.parse_logs_all(base)?;
//! testbed.process_logs_all(base)?;
//!
//! let report = testbed.estimate_all(base, Solver::NormalEquations);
//! println!("{}/{} nodes solved", report.solved(), report.nodes.len());
//! # Ok::<(), motebed_core::MotebedError>(())
//! ```
//!
//! ## Architecture
//!
//! Trace file → [`TraceSampleFilter`] → [`EnergyModel`] (per sample) →
//! [`StatePowerEstimator`] → per-node [`PowerProfile`]
//!
//! Around that pipeline, [`FanOutController`] runs install/reset/calibrate on
//! every node at once and [`CaptureSessionManager`] owns the serial
//! listeners. External tools all run under [`ManagedProcess`].

pub mod calibration;
pub mod capture;
pub mod config;
pub mod energy;
pub mod error;
pub mod estimator;
pub mod fanout;
pub mod node;
pub mod process;
pub mod testbed;
pub mod trace;

pub use calibration::{
    CALIBRATION_FORMAT_VERSION, CalibrationEntry, CalibrationFile, CalibrationRecord,
    CalibrationTable, parse_calibration_line,
};
pub use capture::{
    CaptureMode, CaptureReport, CaptureSessionManager, CaptureTarget, SessionStatus, StopSignal,
};
pub use config::{NodeConfig, TestbedConfig, render_template};
pub use energy::{EnergyModel, SUPPLY_VOLTAGE};
pub use error::{CommandFailure, MotebedError, Result};
pub use estimator::{
    Estimate, PowerProfile, RegressionProblem, Solver, StatePowerEstimator,
    non_negative_available,
};
pub use fanout::{FanOutController, FanOutReport, NodeOutcome};
pub use node::{Node, NodeFamily, NodeState, QuantoMote, TelosMote};
pub use process::{Completed, ManagedProcess, ProcessSpec};
pub use testbed::{EstimateReport, NodeEstimate, NodeEstimateReport, Testbed};
pub use trace::{
    CONST_STATE, FilterStats, STATES_MARKER, TraceLines, TraceSample, TraceSampleFilter,
};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
