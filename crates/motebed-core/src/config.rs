//! Testbed configuration.
//!
//! A testbed is described by one JSON document:
//!
//! ```text
//! {
//!   "node_type": "TelosMote",
//!   "make_cmd": "make telosb",
//!   "nodes": [
//!     { "id": 1, "serial": "/dev/ttyUSB0", "install_cmd": "make telosb reinstall,$id bsl,$serial" }
//!   ]
//! }
//! ```
//!
//! Node entries are free-form maps; which keys are required depends on the
//! device family named by `node_type` (see [`crate::node`]). Commands are
//! templates where `$name` (or `${name}`) is replaced by a per-node value
//! and `$$` is a literal dollar sign.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MotebedError, Result};

/// Serial listener used when `capture_cmd` is not configured.
pub const DEFAULT_CAPTURE_CMD: &str = "java net.tinyos.tools.Listen -comm serial@$serial:tmote";
/// Trace decoder used when `decode_cmd` is not configured.
pub const DEFAULT_DECODE_CMD: &str = "read_log.py $base.$label.log $time_offset";
/// Trace post-processor used when `process_cmd` is not configured.
pub const DEFAULT_PROCESS_CMD: &str = "process.pl -f $base.$label.log.parsed";

/// Template variable that refers to the external toolchain root.
const TOOLCHAIN_ROOT_VAR: &str = "toolchain_root";

/// Top-level testbed configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestbedConfig {
    /// Device family of every node (e.g. `TelosMote`, `QuantoMote`).
    pub node_type: String,

    /// Firmware build command.
    pub make_cmd: String,

    /// Root directory of the external firmware toolchain, available to
    /// command templates as `$toolchain_root`.
    #[serde(default)]
    pub toolchain_root: Option<PathBuf>,

    /// Serial capture command per node.
    #[serde(default)]
    pub capture_cmd: Option<String>,

    /// Trace decode command per node.
    #[serde(default)]
    pub decode_cmd: Option<String>,

    /// Trace post-processing command per node.
    #[serde(default)]
    pub process_cmd: Option<String>,

    /// Live calibration command per node. Must print one
    /// `<resistor> <frequency> <energy_quantum>` line per calibration point.
    #[serde(default)]
    pub calibrate_cmd: Option<String>,

    /// Check that configured serial device paths exist. Default: true.
    #[serde(default = "default_verify_serial")]
    pub verify_serial: bool,

    /// One entry per node.
    pub nodes: Vec<NodeConfig>,
}

fn default_verify_serial() -> bool {
    true
}

impl TestbedConfig {
    /// Read and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            MotebedError::configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| MotebedError::configuration(format!("invalid testbed config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn capture_cmd(&self) -> &str {
        self.capture_cmd.as_deref().unwrap_or(DEFAULT_CAPTURE_CMD)
    }

    pub fn decode_cmd(&self) -> &str {
        self.decode_cmd.as_deref().unwrap_or(DEFAULT_DECODE_CMD)
    }

    pub fn process_cmd(&self) -> &str {
        self.process_cmd.as_deref().unwrap_or(DEFAULT_PROCESS_CMD)
    }

    /// Template variables shared by every command.
    pub fn global_vars(&self) -> Vec<(&'static str, String)> {
        match &self.toolchain_root {
            Some(root) => vec![(TOOLCHAIN_ROOT_VAR, root.display().to_string())],
            None => Vec::new(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(MotebedError::configuration("testbed has no nodes"));
        }
        if self.make_cmd.trim().is_empty() {
            return Err(MotebedError::configuration("make_cmd is empty"));
        }

        if self.toolchain_root.is_none() {
            let mut templates: Vec<&str> = vec![
                &self.make_cmd,
                self.capture_cmd(),
                self.decode_cmd(),
                self.process_cmd(),
            ];
            templates.extend(self.calibrate_cmd.as_deref());
            for node in &self.nodes {
                templates.extend(node.values.values().filter_map(Value::as_str));
            }
            if let Some(t) = templates
                .iter()
                .find(|t| template_vars(t).iter().any(|v| v == TOOLCHAIN_ROOT_VAR))
            {
                return Err(MotebedError::configuration(format!(
                    "'{t}' uses $toolchain_root but no toolchain_root is configured"
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Node entries
// ---------------------------------------------------------------------------

/// Settings of one node, as written in the configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeConfig {
    pub values: BTreeMap<String, Value>,
}

impl NodeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    /// Fail unless every key in `keys` is present.
    pub fn require_keys(&self, keys: &[&str]) -> Result<()> {
        match keys.iter().find(|k| !self.values.contains_key(**k)) {
            Some(missing) => Err(MotebedError::configuration(format!(
                "node configuration must include key '{missing}'"
            ))),
            None => Ok(()),
        }
    }

    /// Integer node id. Accepts JSON numbers and numeric strings.
    pub fn id(&self) -> Result<u32> {
        let invalid = || MotebedError::configuration("node id must be a non-negative integer");
        match self.values.get("id") {
            Some(Value::Number(n)) => n
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(invalid),
            Some(Value::String(s)) => s.trim().parse().map_err(|_| invalid()),
            Some(_) => Err(invalid()),
            None => Err(MotebedError::configuration(
                "node configuration must include key 'id'",
            )),
        }
    }

    /// A required value rendered as a string (numbers are accepted).
    pub fn string(&self, key: &str) -> Result<String> {
        self.optional_string(key)?.ok_or_else(|| {
            MotebedError::configuration(format!("node configuration must include key '{key}'"))
        })
    }

    pub fn optional_string(&self, key: &str) -> Result<Option<String>> {
        match self.values.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(other) => Err(MotebedError::configuration(format!(
                "key '{key}' must be a string, got {other}"
            ))),
        }
    }

    pub fn optional_i64(&self, key: &str) -> Result<Option<i64>> {
        let invalid = || MotebedError::configuration(format!("key '{key}' must be an integer"));
        match self.values.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n.as_i64().map(Some).ok_or_else(invalid),
            Some(Value::String(s)) => s.trim().parse().map(Some).map_err(|_| invalid()),
            Some(_) => Err(invalid()),
        }
    }
}

// ---------------------------------------------------------------------------
// Command templates
// ---------------------------------------------------------------------------

/// Names of all variables referenced by a template.
pub fn template_vars(template: &str) -> Vec<String> {
    let mut vars = Vec::new();
    let _ = expand(template, |name| {
        vars.push(name.to_string());
        Some(String::new())
    });
    vars
}

/// Substitute `$name` / `${name}` placeholders. Referencing a variable that
/// is not in `vars` is a configuration error.
pub fn render_template(template: &str, vars: &[(&str, String)]) -> Result<String> {
    let mut missing = None;
    let rendered = expand(template, |name| {
        let value = vars.iter().find(|(k, _)| *k == name).map(|(_, v)| v.clone());
        if value.is_none() && missing.is_none() {
            missing = Some(name.to_string());
        }
        value
    });
    match (rendered, missing) {
        (Some(s), None) => Ok(s),
        (_, Some(name)) => Err(MotebedError::configuration(format!(
            "command '{template}' references unknown variable ${name}"
        ))),
        (None, None) => Err(MotebedError::configuration(format!(
            "command '{template}' has an unterminated placeholder"
        ))),
    }
}

fn expand(template: &str, mut lookup: impl FnMut(&str) -> Option<String>) -> Option<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut complete = true;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(stripped) = after.strip_prefix('$') {
            out.push('$');
            rest = stripped;
        } else if let Some(braced) = after.strip_prefix('{') {
            let Some(end) = braced.find('}') else {
                return None;
            };
            match lookup(&braced[..end]) {
                Some(v) => out.push_str(&v),
                None => complete = false,
            }
            rest = &braced[end + 1..];
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            if end == 0 {
                out.push('$');
            } else {
                match lookup(&after[..end]) {
                    Some(v) => out.push_str(&v),
                    None => complete = false,
                }
            }
            rest = &after[end..];
        }
    }
    out.push_str(rest);
    complete.then_some(out)
}
