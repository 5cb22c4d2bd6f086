//! The testbed registry: all configured nodes plus the workflows that span
//! them.
//!
//! Per-node files share a base path chosen by the caller. For base
//! `runs/boot` and node label `node3`:
//!
//! | File                        | Written by            |
//! |-----------------------------|-----------------------|
//! | `runs/boot.node3.log`       | capture (stdout)      |
//! | `runs/boot.node3.stderr.log`| capture (stderr)      |
//! | `runs/boot.node3.log.pwr`   | decode/process helpers|
//!
//! The decoded trace may also be gzip-compressed (`.log.pwr.gz`).

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

use crate::calibration::{CalibrationFile, CalibrationTable, parse_calibration_line};
use crate::capture::{
    CaptureMode, CaptureReport, CaptureSessionManager, CaptureTarget, StopSignal,
};
use crate::config::{TestbedConfig, render_template};
use crate::error::{CommandFailure, MotebedError, Result};
use crate::estimator::{Estimate, PowerProfile, Solver, StatePowerEstimator};
use crate::fanout::{FanOutController, FanOutReport};
use crate::node::{Node, NodeFamily};
use crate::process::{Completed, ManagedProcess, ProcessSpec};
use crate::trace::TraceSampleFilter;

/// Outcome of estimating one node within a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NodeEstimate {
    Solved { profile: PowerProfile },
    /// The regression could not separate the states; the node's power map
    /// was cleared.
    Singular { reason: String },
    /// Estimation aborted for this node (uncalibrated, unreadable trace).
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeEstimateReport {
    pub node: u32,
    pub label: String,
    #[serde(flatten)]
    pub outcome: NodeEstimate,
}

/// Results of one estimation batch, one entry per node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EstimateReport {
    pub solver: String,
    pub nodes: Vec<NodeEstimateReport>,
}

impl EstimateReport {
    pub fn outcome(&self, node: u32) -> Option<&NodeEstimate> {
        self.nodes.iter().find(|n| n.node == node).map(|n| &n.outcome)
    }

    pub fn solved(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n.outcome, NodeEstimate::Solved { .. }))
            .count()
    }
}

/// Every configured node plus the controllers that drive them.
pub struct Testbed {
    config: TestbedConfig,
    family: NodeFamily,
    nodes: Vec<Box<dyn Node>>,
    fanout: FanOutController,
    capture: CaptureSessionManager,
}

impl Testbed {
    /// Build all nodes described by `config`.
    pub fn from_config(config: TestbedConfig) -> Result<Self> {
        let family: NodeFamily = config.node_type.parse()?;
        let mut seen = BTreeSet::new();
        let mut nodes = Vec::with_capacity(config.nodes.len());

        for entry in &config.nodes {
            let node = family.build(entry, &config)?;
            if !seen.insert(node.id()) {
                return Err(MotebedError::configuration(format!(
                    "duplicate node id {}",
                    node.id()
                )));
            }
            nodes.push(node);
        }
        log::info!("testbed: {} {family} nodes", nodes.len());

        Ok(Self {
            config,
            family,
            nodes,
            fanout: FanOutController::new(),
            capture: CaptureSessionManager::new(),
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_config(TestbedConfig::load(path)?)
    }

    /// Use a custom capture manager (e.g. a shorter poll interval).
    pub fn with_capture_manager(mut self, capture: CaptureSessionManager) -> Self {
        self.capture = capture;
        self
    }

    pub fn config(&self) -> &TestbedConfig {
        &self.config
    }

    pub fn family(&self) -> NodeFamily {
        self.family
    }

    pub fn nodes(&self) -> &[Box<dyn Node>] {
        &self.nodes
    }

    pub fn nodes_mut(&mut self) -> &mut [Box<dyn Node>] {
        &mut self.nodes
    }

    pub fn node(&self, id: u32) -> Option<&dyn Node> {
        self.nodes.iter().find(|n| n.id() == id).map(|n| n.as_ref())
    }

    // -----------------------------------------------------------------------
    // Firmware
    // -----------------------------------------------------------------------

    /// Build the firmware.
    pub fn compile(&self) -> Result<()> {
        let command = render_template(&self.config.make_cmd, &self.config.global_vars())?;
        log::info!("compiling: {command}");
        let done = ManagedProcess::run(command.as_str())?;
        if done.success() {
            return Ok(());
        }
        log::error!(
            "compilation failed ({:?})\n{}{}",
            done.status.code(),
            done.stdout,
            done.stderr
        );
        Err(MotebedError::Compile {
            command,
            stdout: done.stdout,
            stderr: done.stderr,
        })
    }

    /// Flash every node in parallel. Fails with the aggregate
    /// [`MotebedError::Install`] after all nodes were attempted.
    pub fn install_all(&mut self) -> Result<FanOutReport> {
        self.fanout
            .run_all(
                "install",
                &mut self.nodes,
                |n| n.install(),
                |n| n.is_install_success(),
            )
            .into_result("install")
    }

    pub fn reset_all(&mut self) -> Result<FanOutReport> {
        self.fanout
            .run_all("reset", &mut self.nodes, |n| n.reset(), |_| true)
            .into_result("reset")
    }

    /// Reset nodes one after another with a random pause of up to
    /// `max_delay` between them.
    pub fn reset_staggered(&mut self, max_delay: Duration) -> Result<FanOutReport> {
        self.fanout
            .run_staggered("reset", &mut self.nodes, max_delay, |n| n.reset())
            .into_result("reset")
    }

    /// Hold every node in reset.
    pub fn stop_all(&mut self) -> Result<FanOutReport> {
        self.fanout
            .run_all("stop", &mut self.nodes, |n| n.stop(), |_| true)
            .into_result("stop")
    }

    /// Release every node from reset.
    pub fn start_all(&mut self) -> Result<FanOutReport> {
        self.fanout
            .run_all("start", &mut self.nodes, |n| n.start(), |_| true)
            .into_result("start")
    }

    /// Press and then release the user button on every node.
    pub fn press_user_all(&mut self) -> Result<FanOutReport> {
        self.fanout
            .run_all("press", &mut self.nodes, |n| n.set_user_button(true), |_| true)
            .into_result("press")?;
        self.fanout
            .run_all(
                "release",
                &mut self.nodes,
                |n| n.set_user_button(false),
                |_| true,
            )
            .into_result("release")
    }

    // -----------------------------------------------------------------------
    // Calibration
    // -----------------------------------------------------------------------

    /// Load every node's calibration from a file. Nothing is applied unless
    /// the file has a section for every configured node.
    pub fn calibrate_from_file(&mut self, path: &Path) -> Result<()> {
        let file = CalibrationFile::load(path)?;
        let tables = self
            .nodes
            .iter()
            .map(|n| file.table_for(n.label()))
            .collect::<Result<Vec<_>>>()?;
        for (node, table) in self.nodes.iter_mut().zip(tables) {
            node.state_mut().set_calibration(table);
        }
        log::info!(
            "loaded calibration of {} nodes from {}",
            self.nodes.len(),
            path.display()
        );
        Ok(())
    }

    /// Calibrate every node live by running `calibrate_cmd` on it, then
    /// merge all calibrated nodes into `output`. Sections of other nodes
    /// already in `output` are kept. With `flash`, the firmware is built and
    /// installed first.
    pub fn calibrate_live(&mut self, output: &Path, flash: bool) -> Result<FanOutReport> {
        let template = self.config.calibrate_cmd.clone().ok_or_else(|| {
            MotebedError::configuration("live calibration needs calibrate_cmd")
        })?;
        if flash {
            self.compile()?;
            self.install_all()?;
        }

        let report = self.fanout.run_all(
            "calibrate",
            &mut self.nodes,
            |n| calibrate_node(n, &template),
            |n| n.state().is_calibrated(),
        );
        self.merge_calibration(output)?;
        report.into_result("calibrate")
    }

    /// Add every calibrated node to the file at `path`. The file is left
    /// untouched when no node is calibrated.
    fn merge_calibration(&self, path: &Path) -> Result<()> {
        let calibrated: Vec<_> = self
            .nodes
            .iter()
            .filter(|n| n.state().is_calibrated())
            .collect();
        if calibrated.is_empty() {
            log::warn!("no node calibrated, not writing {}", path.display());
            return Ok(());
        }

        let mut file = if path.exists() {
            CalibrationFile::load(path)?
        } else {
            CalibrationFile::default()
        };
        for node in &calibrated {
            file.insert(node.label(), &node.state().calibration);
        }
        file.save(path)?;
        log::info!(
            "saved calibration of {} nodes to {} ({} sections)",
            calibrated.len(),
            path.display(),
            file.nodes.len()
        );
        Ok(())
    }

    /// Write the calibration of every calibrated node.
    pub fn save_calibration(&self, path: &Path) -> Result<()> {
        let mut file = CalibrationFile::default();
        for node in self.nodes.iter().filter(|n| n.state().is_calibrated()) {
            file.insert(node.label(), &node.state().calibration);
        }
        file.save(path)?;
        log::info!(
            "saved calibration of {} nodes to {}",
            file.nodes.len(),
            path.display()
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Capture and log processing
    // -----------------------------------------------------------------------

    /// Start one serial listener per node writing to `<base>.<label>.log`.
    pub fn capture(&mut self, base: &Path, mode: CaptureMode) -> Result<CaptureReport> {
        let base_var = [("base", base.display().to_string())];
        let targets = self
            .nodes
            .iter()
            .map(|n| {
                let command = n.state().render(self.config.capture_cmd(), &base_var)?;
                Ok(CaptureTarget {
                    node: n.id(),
                    label: n.label().to_string(),
                    counter: n.state().message_counter(),
                    spec: ProcessSpec::new(command)
                        .stdout_to(node_file(base, n.label(), "log"))
                        .stderr_to(node_file(base, n.label(), "stderr.log")),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        self.capture.start_all(targets, mode)
    }

    /// Stop a detached capture.
    pub fn stop_capture(&mut self) -> Option<CaptureReport> {
        self.capture.stop_all()
    }

    /// Handle that cancels a blocking [`capture`](Self::capture).
    pub fn capture_stop_signal(&self) -> StopSignal {
        self.capture.stop_signal()
    }

    /// Decode every node's raw capture.
    pub fn parse_logs_all(&self, base: &Path) -> Result<()> {
        self.run_helpers("decode", self.config.decode_cmd(), base)
    }

    /// Turn every node's decoded capture into a power trace.
    pub fn process_logs_all(&self, base: &Path) -> Result<()> {
        self.run_helpers("process", self.config.process_cmd(), base)
    }

    /// Run one helper per node concurrently; every failing helper ends up
    /// in a single [`MotebedError::Parse`].
    fn run_helpers(&self, what: &str, template: &str, base: &Path) -> Result<()> {
        let base_var = [("base", base.display().to_string())];
        let commands = self
            .nodes
            .iter()
            .map(|n| n.state().render(template, &base_var).map(|c| (n.id(), c)))
            .collect::<Result<Vec<_>>>()?;

        let mut failures = Vec::new();
        let mut running = Vec::with_capacity(commands.len());
        for (id, command) in commands {
            log::debug!("node {id}: {what}: {command}");
            match ManagedProcess::start(ProcessSpec::new(command.clone()).capture()) {
                Ok(process) => running.push((id, process)),
                Err(e) => failures.push(CommandFailure::io(Some(id), command, &e)),
            }
        }

        for (id, process) in running {
            let failure = match process.wait() {
                Ok(status) if status.success() => continue,
                Ok(status) => CommandFailure::new(
                    Some(id),
                    process.command(),
                    Completed {
                        status,
                        stdout: process.captured_stdout(),
                        stderr: process.captured_stderr(),
                    },
                ),
                Err(e) => CommandFailure::io(Some(id), process.command(), &e),
            };
            failures.push(failure);
        }

        for failure in &failures {
            log::error!("{what}: {failure}\n{}", failure.stderr);
        }
        failures.sort_by_key(|f| f.node);

        if failures.is_empty() {
            Ok(())
        } else {
            Err(MotebedError::Parse { failures })
        }
    }

    // -----------------------------------------------------------------------
    // Estimation
    // -----------------------------------------------------------------------

    /// Estimate the per-state power of every node from its decoded trace.
    ///
    /// One node's failure never stops the batch: every node gets an entry
    /// in the report. Solved and singular outcomes are also recorded on the
    /// node itself.
    pub fn estimate_all(&mut self, base: &Path, solver: Solver) -> EstimateReport {
        let estimator = StatePowerEstimator::new(solver);
        let mut reports = Vec::with_capacity(self.nodes.len());

        for node in self.nodes.iter_mut() {
            let outcome = match estimate_node(&estimator, node.as_ref(), base) {
                Ok(estimate) => {
                    node.state_mut().apply_estimate(&estimate);
                    match estimate {
                        Estimate::Solved(profile) => NodeEstimate::Solved { profile },
                        Estimate::Singular { reason } => NodeEstimate::Singular { reason },
                    }
                }
                Err(e) => {
                    log::error!("node {}: estimation failed: {e}", node.id());
                    NodeEstimate::Failed {
                        error: e.to_string(),
                    }
                }
            };
            reports.push(NodeEstimateReport {
                node: node.id(),
                label: node.label().to_string(),
                outcome,
            });
        }

        EstimateReport {
            solver: solver.to_string(),
            nodes: reports,
        }
    }
}

/// `<base>.<label>.<suffix>`
pub fn node_file(base: &Path, label: &str, suffix: &str) -> PathBuf {
    PathBuf::from(format!("{}.{label}.{suffix}", base.display()))
}

/// Decoded trace of a node, preferring the plain file over a gzipped one.
pub fn trace_path(base: &Path, label: &str) -> PathBuf {
    let plain = node_file(base, label, "log.pwr");
    let gz = node_file(base, label, "log.pwr.gz");
    if !plain.exists() && gz.exists() { gz } else { plain }
}

fn estimate_node(
    estimator: &StatePowerEstimator,
    node: &dyn Node,
    base: &Path,
) -> Result<Estimate> {
    if !node.state().is_calibrated() {
        return Err(MotebedError::calibration(node.id(), "node is not calibrated"));
    }
    let trace = TraceSampleFilter::open(&trace_path(base, node.label()))?;
    estimator.estimate_trace(node.id(), trace, &node.state().calibration)
}

fn calibrate_node(node: &mut dyn Node, template: &str) -> Result<()> {
    let command = node.state().render(template, &[])?;
    let done = ManagedProcess::run(command.as_str())?;
    if !done.success() {
        return Err(MotebedError::Command(CommandFailure::new(
            Some(node.id()),
            command,
            done,
        )));
    }
    let table =
        CalibrationTable::from_entries(done.stdout.lines().filter_map(parse_calibration_line));
    if table.is_empty() {
        return Err(MotebedError::calibration(
            node.id(),
            "calibration command printed no calibration points",
        ));
    }
    log::info!("node {}: {} calibration points", node.id(), table.len());
    node.state_mut().set_calibration(table);
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::calibration::CalibrationEntry;
    use crate::config::NodeConfig;

    fn config(nodes: Vec<NodeConfig>) -> TestbedConfig {
        TestbedConfig {
            node_type: "TelosMote".to_string(),
            make_cmd: "true".to_string(),
            toolchain_root: None,
            capture_cmd: None,
            decode_cmd: None,
            process_cmd: None,
            calibrate_cmd: None,
            verify_serial: false,
            nodes,
        }
    }

    fn telos(id: u32) -> NodeConfig {
        NodeConfig::new()
            .with("id", id)
            .with("serial", format!("/dev/ttyUSB{id}"))
            .with("install_cmd", "true")
            .with("reset_cmd", "true")
    }

    // -----------------------------------------------------------------------
    // Registry
    // -----------------------------------------------------------------------

    #[test]
    fn test_builds_all_nodes() {
        let tb = Testbed::from_config(config(vec![telos(1), telos(2)])).unwrap();
        assert_eq!(tb.nodes().len(), 2);
        assert_eq!(tb.family(), NodeFamily::Telos);
        assert_eq!(tb.node(2).unwrap().label(), "node2");
        assert!(tb.node(3).is_none());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let err = Testbed::from_config(config(vec![telos(1), telos(1)])).err().unwrap();
        assert!(err.to_string().contains("duplicate node id 1"));
    }

    #[test]
    fn test_unknown_node_type() {
        let mut c = config(vec![telos(1)]);
        c.node_type = "Mica2".to_string();
        assert!(matches!(
            Testbed::from_config(c),
            Err(MotebedError::Configuration { .. })
        ));
    }

    #[test]
    fn test_node_file_names() {
        let base = Path::new("runs/boot");
        assert_eq!(
            node_file(base, "node3", "log"),
            PathBuf::from("runs/boot.node3.log")
        );
        assert_eq!(
            trace_path(base, "node3"),
            PathBuf::from("runs/boot.node3.log.pwr")
        );
    }

    // -----------------------------------------------------------------------
    // Workflows
    // -----------------------------------------------------------------------

    #[test]
    fn test_compile_failure_carries_output() {
        let mut c = config(vec![telos(1)]);
        c.make_cmd = "echo building; echo missing header >&2; exit 2".to_string();
        let tb = Testbed::from_config(c).unwrap();
        match tb.compile() {
            Err(MotebedError::Compile { stdout, stderr, .. }) => {
                assert_eq!(stdout, "building\n");
                assert_eq!(stderr, "missing header\n");
            }
            other => panic!("expected compile error, got {other:?}"),
        }
    }

    #[test]
    fn test_install_partial_failure() {
        let bad = telos(2).with("install_cmd", "exit 1");
        let mut tb = Testbed::from_config(config(vec![telos(1), bad, telos(3)])).unwrap();
        match tb.install_all() {
            Err(MotebedError::Install { failed, report }) => {
                assert_eq!(failed, vec![2]);
                assert!(report.outcome(1).unwrap().success);
                assert!(report.outcome(3).unwrap().success);
            }
            other => panic!("expected install error, got {other:?}"),
        }
        assert!(tb.node(1).unwrap().is_install_success());
        assert!(!tb.node(2).unwrap().is_install_success());
    }

    #[test]
    fn test_stop_and_start_drive_reset_line() {
        let tmp = tempfile::tempdir().unwrap();
        let quanto = |id: u32| {
            NodeConfig::new()
                .with("id", id)
                .with("host", format!("rci-{id}"))
                .with("serial", "/dev/null")
                .with("install_cmd", "true")
                .with("time_offset", 0)
                .with(
                    "line_control_cmd",
                    format!("echo $line $level >> {}/lines.$id", tmp.path().display()),
                )
        };
        let mut c = config(vec![quanto(1), quanto(2)]);
        c.node_type = "QuantoMote".to_string();
        let mut tb = Testbed::from_config(c).unwrap();

        assert!(tb.stop_all().unwrap().all_succeeded());
        assert!(tb.start_all().unwrap().all_succeeded());
        for id in [1, 2] {
            let lines = std::fs::read_to_string(tmp.path().join(format!("lines.{id}"))).unwrap();
            assert_eq!(lines, "rts low\nrts high\n");
        }
    }

    #[test]
    fn test_stop_unsupported_on_telos() {
        let mut tb = Testbed::from_config(config(vec![telos(1)])).unwrap();
        match tb.stop_all() {
            Err(MotebedError::FanOut {
                operation, failed, ..
            }) => {
                assert_eq!(operation, "stop");
                assert_eq!(failed, vec![1]);
            }
            other => panic!("expected fan-out error, got {other:?}"),
        }
    }

    #[test]
    fn test_press_user_unsupported_on_telos() {
        let mut tb = Testbed::from_config(config(vec![telos(1)])).unwrap();
        assert!(matches!(
            tb.press_user_all(),
            Err(MotebedError::FanOut {
                operation: "press",
                ..
            })
        ));
    }

    #[test]
    fn test_parse_failures_aggregated() {
        let mut c = config(vec![telos(1), telos(2), telos(3)]);
        c.decode_cmd = Some("test $id -ne 2 || { echo bad trace >&2; exit 4; }".to_string());
        let tb = Testbed::from_config(c).unwrap();
        let tmp = tempfile::tempdir().unwrap();
        match tb.parse_logs_all(&tmp.path().join("run")) {
            Err(MotebedError::Parse { failures }) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].node, Some(2));
                assert_eq!(failures[0].code, Some(4));
                assert_eq!(failures[0].stderr, "bad trace\n");
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_reports_every_failing_node() {
        let mut c = config(vec![telos(1), telos(2), telos(3)]);
        c.process_cmd = Some("test $id -eq 2 || exit $id".to_string());
        let tb = Testbed::from_config(c).unwrap();
        let tmp = tempfile::tempdir().unwrap();
        match tb.process_logs_all(&tmp.path().join("run")) {
            Err(MotebedError::Parse { failures }) => {
                let nodes: Vec<_> = failures.iter().map(|f| (f.node, f.code)).collect();
                assert_eq!(nodes, vec![(Some(1), Some(1)), (Some(3), Some(3))]);
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_live_calibration_written() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("calibration.json");
        let mut c = config(vec![telos(1), telos(2)]);
        c.calibrate_cmd = Some("printf '1 2000 4.0\\n2 1000 2.0\\n'".to_string());
        let mut tb = Testbed::from_config(c).unwrap();

        let report = tb.calibrate_live(&out, false).unwrap();
        assert!(report.all_succeeded());
        assert_eq!(tb.node(1).unwrap().state().calibration.len(), 2);

        let file = CalibrationFile::load(&out).unwrap();
        assert_eq!(file.nodes.len(), 2);
        assert_eq!(file.table_for("node2").unwrap().quantum_at(1000.0), Some(2.0));
    }

    #[test]
    fn test_live_calibration_keeps_sections_of_failed_nodes() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("calibration.json");
        let mut previous = CalibrationFile::default();
        for label in ["node1", "node2"] {
            previous.insert(
                label,
                &CalibrationTable::from_entries([CalibrationEntry {
                    resistor: 1,
                    frequency: 500.0,
                    energy_quantum: 9.0,
                }]),
            );
        }
        previous.save(&out).unwrap();

        let mut c = config(vec![telos(1), telos(2)]);
        c.calibrate_cmd = Some("test $id -ne 2 || exit 1; printf '1 2000 4.0\\n'".to_string());
        let mut tb = Testbed::from_config(c).unwrap();
        match tb.calibrate_live(&out, false) {
            Err(MotebedError::FanOut { failed, .. }) => assert_eq!(failed, vec![2]),
            other => panic!("expected fan-out error, got {other:?}"),
        }

        let file = CalibrationFile::load(&out).unwrap();
        assert_eq!(file.table_for("node1").unwrap().quantum_at(2000.0), Some(4.0));
        assert_eq!(file.table_for("node2").unwrap().quantum_at(500.0), Some(9.0));
    }

    #[test]
    fn test_live_calibration_failing_everywhere_writes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("calibration.json");
        let mut c = config(vec![telos(1), telos(2)]);
        c.calibrate_cmd = Some("exit 1".to_string());
        let mut tb = Testbed::from_config(c).unwrap();
        assert!(tb.calibrate_live(&out, false).is_err());
        assert!(!out.exists());
    }

    #[test]
    fn test_live_calibration_requires_command() {
        let tmp = tempfile::tempdir().unwrap();
        let mut tb = Testbed::from_config(config(vec![telos(1)])).unwrap();
        assert!(matches!(
            tb.calibrate_live(&tmp.path().join("c.json"), false),
            Err(MotebedError::Configuration { .. })
        ));
    }

    #[test]
    fn test_capture_writes_per_node_logs() {
        let mut c = config(vec![telos(1), telos(2)]);
        c.capture_cmd = Some("echo packet from $id; echo packet from $id".to_string());
        let mut tb = Testbed::from_config(c).unwrap().with_capture_manager(
            CaptureSessionManager::new().with_poll_interval(Duration::from_millis(10)),
        );
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("run");

        let report = tb
            .capture(&base, CaptureMode::Blocking { timeout: None })
            .unwrap();
        assert_eq!(report.total_messages(), 4);
        assert_eq!(tb.node(2).unwrap().state().messages(), 2);
        let log = std::fs::read_to_string(node_file(&base, "node2", "log")).unwrap();
        assert_eq!(log, "packet from 2\npacket from 2\n");
    }

    #[test]
    fn test_estimate_uncalibrated_node_fails_alone() {
        let mut tb = Testbed::from_config(config(vec![telos(1)])).unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let report = tb.estimate_all(&tmp.path().join("run"), Solver::NormalEquations);
        assert_eq!(report.nodes.len(), 1);
        match report.outcome(1).unwrap() {
            NodeEstimate::Failed { error } => assert!(error.contains("not calibrated")),
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
