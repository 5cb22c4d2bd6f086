//! Error types for testbed operations.

use thiserror::Error;

use crate::fanout::FanOutReport;
use crate::process::Completed;

/// Result type alias for motebed operations.
pub type Result<T> = std::result::Result<T, MotebedError>;

/// Output of an external command that exited unsuccessfully.
#[derive(Debug, Clone)]
pub struct CommandFailure {
    /// Node the command ran for, if it was a per-node command.
    pub node: Option<u32>,
    /// Full command line as handed to the shell.
    pub command: String,
    /// Exit code, `None` if the process was killed by a signal.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Set when the command could not be started or waited on at all.
    pub io_error: Option<String>,
}

impl CommandFailure {
    pub fn new(node: Option<u32>, command: impl Into<String>, completed: Completed) -> Self {
        Self {
            node,
            command: command.into(),
            code: completed.status.code(),
            stdout: completed.stdout,
            stderr: completed.stderr,
            io_error: None,
        }
    }

    /// A command that never produced an exit status.
    pub fn io(node: Option<u32>, command: impl Into<String>, err: &std::io::Error) -> Self {
        Self {
            node,
            command: command.into(),
            code: None,
            stdout: String::new(),
            stderr: String::new(),
            io_error: Some(err.to_string()),
        }
    }
}

impl std::fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(id) = self.node {
            write!(f, "node {id}: ")?;
        }
        if let Some(err) = &self.io_error {
            return write!(f, "'{}' could not be run: {err}", self.command);
        }
        match self.code {
            Some(code) => write!(f, "'{}' exited with {code}", self.command),
            None => write!(f, "'{}' terminated by signal", self.command),
        }
    }
}

/// Errors that can occur while driving the testbed or building power models.
#[derive(Debug, Error)]
pub enum MotebedError {
    /// Missing or invalid testbed/node settings, unknown node type, or a
    /// calibration file without a section for a configured node.
    #[error("Configuration error: {reason}")]
    Configuration {
        /// What is wrong with the configuration
        reason: String,
    },

    /// The firmware build command exited unsuccessfully.
    #[error("Compilation with command '{command}' failed")]
    Compile {
        /// Build command line
        command: String,
        /// Captured standard output
        stdout: String,
        /// Captured standard error
        stderr: String,
    },

    /// At least one node failed to install. Raised only after every node was
    /// attempted; the report holds the outcome of each node.
    #[error("Installation failed on {} of {} nodes: {failed:?}", failed.len(), report.outcomes.len())]
    Install {
        /// Ids of the nodes that reported failure
        failed: Vec<u32>,
        /// Per-node outcomes of the whole install round
        report: FanOutReport,
    },

    /// A fan-out operation other than install failed on at least one node.
    #[error("{operation} failed on {} of {} nodes: {failed:?}", failed.len(), report.outcomes.len())]
    FanOut {
        /// Operation name (e.g. "reset")
        operation: &'static str,
        /// Ids of the nodes that reported failure
        failed: Vec<u32>,
        /// Per-node outcomes of the whole round
        report: FanOutReport,
    },

    /// A per-node command (reset, line control, calibration) exited
    /// unsuccessfully.
    #[error("Command failed: {0}")]
    Command(CommandFailure),

    /// A node was used for power estimation without valid calibration.
    #[error("Calibration error on node {node}: {reason}")]
    Calibration {
        /// Node id
        node: u32,
        /// Why the calibration is unusable
        reason: String,
    },

    /// One or more log decode/parse helper commands exited unsuccessfully.
    #[error("{} log processing command(s) failed", failures.len())]
    Parse {
        /// Every failing command with its captured output
        failures: Vec<CommandFailure>,
    },

    /// The node's device family does not offer the requested capability.
    #[error("Node {node} does not support '{capability}'")]
    Unsupported {
        /// Node id
        node: u32,
        /// Capability name (e.g. "user_button")
        capability: &'static str,
    },

    /// I/O error while reading traces, writing captures or spawning commands.
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Malformed JSON in a configuration or calibration file.
    #[error("JSON error: {source}")]
    Json {
        /// Underlying serde error
        #[from]
        source: serde_json::Error,
    },
}

impl MotebedError {
    /// Create a configuration error
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a calibration error
    pub fn calibration(node: u32, reason: impl Into<String>) -> Self {
        Self::Calibration {
            node,
            reason: reason.into(),
        }
    }

    /// Whether this error is fatal to the whole workflow.
    ///
    /// Calibration errors only abort the estimation of one node; unsupported
    /// capabilities and failing per-node commands only fail that node of a
    /// fan-out.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::Calibration { .. } | Self::Unsupported { .. } | Self::Command(_)
        )
    }
}
