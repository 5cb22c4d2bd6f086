//! Testbed nodes and their device families.
//!
//! A [`Node`] is a capability set: every family can be configured,
//! installed and reset; stop/start and the user button are optional and
//! report [`MotebedError::Unsupported`] when a family lacks them. Common
//! per-node data (identity, calibration, estimated power profile, message
//! counter) lives in [`NodeState`].
//!
//! Families:
//!
//! | Family       | Required keys                                        | Label     |
//! |--------------|------------------------------------------------------|-----------|
//! | `TelosMote`  | `id`, `serial`, `install_cmd`                        | `node<id>`|
//! | `QuantoMote` | `id`, `host`, `serial`, `install_cmd`, `time_offset` | `host`    |

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::calibration::CalibrationTable;
use crate::config::{NodeConfig, TestbedConfig, render_template};
use crate::error::{CommandFailure, MotebedError, Result};
use crate::estimator::{Estimate, PowerProfile};
use crate::process::{Completed, ManagedProcess};

/// Reset command of Telos nodes when `reset_cmd` is not configured.
pub const DEFAULT_TELOS_RESET_CMD: &str = "tos-bsl --telosb -c $serial -r";

/// How long the reset line is held low on line-controlled nodes.
const RESET_PULSE: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Shared node state
// ---------------------------------------------------------------------------

/// Data every node carries regardless of family.
#[derive(Debug)]
pub struct NodeState {
    id: u32,
    label: String,
    /// Energy meter calibration. Empty until calibrated.
    pub calibration: CalibrationTable,
    /// Result of the most recent power estimation.
    pub profile: PowerProfile,
    install_success: bool,
    messages: Arc<AtomicU64>,
    vars: Vec<(&'static str, String)>,
}

impl NodeState {
    pub fn new(id: u32, label: impl Into<String>) -> Self {
        let label = label.into();
        Self {
            id,
            vars: vec![("id", id.to_string()), ("label", label.clone())],
            label,
            calibration: CalibrationTable::new(),
            profile: PowerProfile::default(),
            install_success: false,
            messages: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Add a command template variable.
    pub fn with_var(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.vars.push((name, value.into()));
        self
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Template variables of this node (`$id`, `$label`, family keys and the
    /// testbed-wide ones).
    pub fn vars(&self) -> &[(&'static str, String)] {
        &self.vars
    }

    /// Render a command template with this node's variables plus `extra`.
    pub fn render(&self, template: &str, extra: &[(&'static str, String)]) -> Result<String> {
        let mut vars = self.vars.clone();
        vars.extend_from_slice(extra);
        render_template(template, &vars)
    }

    pub fn install_success(&self) -> bool {
        self.install_success
    }

    pub fn set_install_success(&mut self, success: bool) {
        self.install_success = success;
    }

    /// Shared counter of serial messages received from this node.
    pub fn message_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.messages)
    }

    pub fn messages(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    pub fn is_calibrated(&self) -> bool {
        !self.calibration.is_empty()
    }

    pub fn set_calibration(&mut self, table: CalibrationTable) {
        if self.is_calibrated() {
            log::info!("node {}: replacing existing calibration", self.id);
        }
        self.calibration = table;
    }

    /// Record an estimation outcome. A singular outcome clears the state
    /// power map and leaves everything else untouched.
    pub fn apply_estimate(&mut self, estimate: &Estimate) {
        match estimate {
            Estimate::Solved(profile) => self.profile = profile.clone(),
            Estimate::Singular { .. } => self.profile.state_power.clear(),
        }
    }
}

// ---------------------------------------------------------------------------
// Capability trait
// ---------------------------------------------------------------------------

/// One device on the testbed.
pub trait Node: Send {
    /// Build a node from its configuration entry.
    fn configure(config: &NodeConfig, testbed: &TestbedConfig) -> Result<Self>
    where
        Self: Sized;

    fn family(&self) -> NodeFamily;

    fn state(&self) -> &NodeState;

    fn state_mut(&mut self) -> &mut NodeState;

    /// Flash the installed firmware. A failing flash is recorded in the
    /// node's install flag, not returned as an error.
    fn install(&mut self) -> Result<()>;

    fn reset(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()> {
        Err(self.unsupported("stop"))
    }

    fn start(&mut self) -> Result<()> {
        Err(self.unsupported("start"))
    }

    fn set_user_button(&mut self, _pressed: bool) -> Result<()> {
        Err(self.unsupported("user_button"))
    }

    fn id(&self) -> u32 {
        self.state().id()
    }

    fn label(&self) -> &str {
        self.state().label()
    }

    fn is_install_success(&self) -> bool {
        self.state().install_success()
    }

    fn unsupported(&self, capability: &'static str) -> MotebedError {
        MotebedError::Unsupported {
            node: self.id(),
            capability,
        }
    }
}

/// Device families a testbed can be made of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeFamily {
    Telos,
    Quanto,
}

impl NodeFamily {
    /// Build a node of this family.
    pub fn build(self, config: &NodeConfig, testbed: &TestbedConfig) -> Result<Box<dyn Node>> {
        Ok(match self {
            Self::Telos => Box::new(TelosMote::configure(config, testbed)?),
            Self::Quanto => Box::new(QuantoMote::configure(config, testbed)?),
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Telos => "TelosMote",
            Self::Quanto => "QuantoMote",
        }
    }
}

impl FromStr for NodeFamily {
    type Err = MotebedError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "TelosMote" | "telos" => Ok(Self::Telos),
            "QuantoMote" | "QuantoTestbedMote" | "quanto" => Ok(Self::Quanto),
            other => Err(MotebedError::configuration(format!(
                "unknown node type '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for NodeFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Run a per-node command and fail on non-zero exit.
fn run_checked(node: u32, command: String) -> Result<Completed> {
    let done = ManagedProcess::run(command.as_str())?;
    if done.success() {
        Ok(done)
    } else {
        Err(MotebedError::Command(CommandFailure::new(
            Some(node),
            command,
            done,
        )))
    }
}

/// Run the install command and record its outcome on the node.
fn install_with(state: &mut NodeState, template: &str) -> Result<()> {
    let command = state.render(template, &[])?;
    log::info!("node {}: installing with '{command}'", state.id());
    let done = ManagedProcess::run(command.as_str())?;
    if done.success() {
        state.set_install_success(true);
    } else {
        log::error!(
            "node {}: install failed ({:?})\n{}{}",
            state.id(),
            done.status.code(),
            done.stdout,
            done.stderr
        );
        state.set_install_success(false);
    }
    Ok(())
}

fn check_serial(serial: &str, testbed: &TestbedConfig) -> Result<()> {
    if testbed.verify_serial && !Path::new(serial).exists() {
        return Err(MotebedError::configuration(format!(
            "serial port '{serial}' does not exist"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Telos
// ---------------------------------------------------------------------------

/// USB-attached node flashed and reset through its bootstrap loader.
#[derive(Debug)]
pub struct TelosMote {
    state: NodeState,
    install_cmd: String,
    reset_cmd: String,
}

impl TelosMote {
    pub fn serial(&self) -> &str {
        self.state
            .vars()
            .iter()
            .find(|(k, _)| *k == "serial")
            .map(|(_, v)| v.as_str())
            .unwrap_or_default()
    }
}

impl Node for TelosMote {
    fn configure(config: &NodeConfig, testbed: &TestbedConfig) -> Result<Self> {
        config.require_keys(&["id", "serial", "install_cmd"])?;
        let id = config.id()?;
        let serial = config.string("serial")?;
        check_serial(&serial, testbed)?;

        let mut state = NodeState::new(id, format!("node{id}"))
            .with_var("serial", serial)
            .with_var("time_offset", "0");
        for (name, value) in testbed.global_vars() {
            state = state.with_var(name, value);
        }

        Ok(Self {
            state,
            install_cmd: config.string("install_cmd")?,
            reset_cmd: config
                .optional_string("reset_cmd")?
                .unwrap_or_else(|| DEFAULT_TELOS_RESET_CMD.to_string()),
        })
    }

    fn family(&self) -> NodeFamily {
        NodeFamily::Telos
    }

    fn state(&self) -> &NodeState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut NodeState {
        &mut self.state
    }

    fn install(&mut self) -> Result<()> {
        install_with(&mut self.state, &self.install_cmd)
    }

    fn reset(&mut self) -> Result<()> {
        let command = self.state.render(&self.reset_cmd, &[])?;
        run_checked(self.id(), command).map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// Quanto
// ---------------------------------------------------------------------------

/// Control lines of a networked serial adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlLine {
    /// Drives the node's reset/run input.
    Rts,
    /// Drives the node's user button.
    Dsr,
}

impl ControlLine {
    fn as_str(self) -> &'static str {
        match self {
            Self::Rts => "rts",
            Self::Dsr => "dsr",
        }
    }
}

/// Level a control line is driven to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineLevel {
    Low,
    High,
    /// Hand the line to the serial port (needed while flashing).
    Serial,
}

impl LineLevel {
    fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::High => "high",
            Self::Serial => "serial",
        }
    }
}

/// Node behind a networked serial adapter whose control lines drive reset
/// and the user button.
///
/// Line changes run `line_control_cmd` with `$line` and `$level` set. Without
/// that command the node can only be installed.
#[derive(Debug)]
pub struct QuantoMote {
    state: NodeState,
    install_cmd: String,
    line_control_cmd: Option<String>,
    time_offset: i64,
}

impl QuantoMote {
    pub fn time_offset(&self) -> i64 {
        self.time_offset
    }

    fn set_line(&self, line: ControlLine, level: LineLevel) -> Result<()> {
        let Some(template) = &self.line_control_cmd else {
            return Err(self.unsupported("line_control"));
        };
        let command = self.state.render(
            template,
            &[
                ("line", line.as_str().to_string()),
                ("level", level.as_str().to_string()),
            ],
        )?;
        log::debug!("node {}: {} -> {}", self.id(), line.as_str(), level.as_str());
        run_checked(self.id(), command).map(|_| ())
    }
}

impl Node for QuantoMote {
    fn configure(config: &NodeConfig, testbed: &TestbedConfig) -> Result<Self> {
        config.require_keys(&["id", "host", "serial", "install_cmd", "time_offset"])?;
        let id = config.id()?;
        let host = config.string("host")?;
        let serial = config.string("serial")?;
        check_serial(&serial, testbed)?;
        let time_offset = config
            .optional_i64("time_offset")?
            .ok_or_else(|| MotebedError::configuration("time_offset must be set"))?;

        let mut state = NodeState::new(id, host.clone())
            .with_var("host", host)
            .with_var("serial", serial)
            .with_var("time_offset", time_offset.to_string());
        for (name, value) in testbed.global_vars() {
            state = state.with_var(name, value);
        }

        Ok(Self {
            state,
            install_cmd: config.string("install_cmd")?,
            line_control_cmd: config.optional_string("line_control_cmd")?,
            time_offset,
        })
    }

    fn family(&self) -> NodeFamily {
        NodeFamily::Quanto
    }

    fn state(&self) -> &NodeState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut NodeState {
        &mut self.state
    }

    fn install(&mut self) -> Result<()> {
        if self.line_control_cmd.is_some() {
            self.set_line(ControlLine::Rts, LineLevel::Serial)?;
        }
        install_with(&mut self.state, &self.install_cmd)?;
        if self.line_control_cmd.is_some() {
            self.set_line(ControlLine::Rts, LineLevel::High)?;
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.set_line(ControlLine::Rts, LineLevel::Low)?;
        std::thread::sleep(RESET_PULSE);
        self.set_line(ControlLine::Rts, LineLevel::High)
    }

    fn stop(&mut self) -> Result<()> {
        self.set_line(ControlLine::Rts, LineLevel::Low)
    }

    fn start(&mut self) -> Result<()> {
        self.set_line(ControlLine::Rts, LineLevel::High)
    }

    fn set_user_button(&mut self, pressed: bool) -> Result<()> {
        let level = if pressed { LineLevel::Low } else { LineLevel::High };
        self.set_line(ControlLine::Dsr, level)
    }
}
