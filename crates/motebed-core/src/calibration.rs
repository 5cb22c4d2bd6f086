//! Per-node calibration tables and their on-disk format.
//!
//! A node is calibrated by switching its supply through a ladder of
//! calibration resistors and measuring, for each resistor, the rate at which
//! the energy meter's instruction counter advances (`frequency`) together
//! with the energy represented by one counter tick at that rate
//! (`energy_quantum`). Higher resistor values mean lower load, so entries
//! sorted by increasing resistor come out with decreasing frequency.
//!
//! # Storage Format
//!
//! Calibrations are persisted as one JSON document holding a section per
//! node, keyed by the node label:
//!
//! ```text
//! {
//!   "version": 1,
//!   "nodes": {
//!     "node1": {
//!       "calibrated_at": "2026-02-15T01:30:00Z",
//!       "entries": [ { "resistor": 100, "frequency": 8000.0, "energy_quantum": 0.5 } ]
//!     }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{MotebedError, Result};

/// Current calibration file format version.
pub const CALIBRATION_FORMAT_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Calibration table
// ---------------------------------------------------------------------------

/// One measured calibration point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationEntry {
    /// Calibration resistor identifier; entries are ordered by it.
    pub resistor: u64,
    /// Instruction counter rate measured with this resistor (ticks/s).
    pub frequency: f64,
    /// Energy per counter tick at this frequency.
    pub energy_quantum: f64,
}

impl CalibrationEntry {
    fn validate(&self) -> std::result::Result<(), String> {
        if !self.frequency.is_finite() || self.frequency <= 0.0 {
            return Err(format!(
                "resistor {} has invalid frequency {}",
                self.resistor, self.frequency
            ));
        }
        if !self.energy_quantum.is_finite() {
            return Err(format!(
                "resistor {} has non-finite energy quantum",
                self.resistor
            ));
        }
        Ok(())
    }
}

/// Mapping from calibration resistor to its measured (frequency, quantum) pair.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibrationTable {
    entries: BTreeMap<u64, CalibrationEntry>,
}

impl CalibrationTable {
    /// Create an empty (uncalibrated) table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from entries. A later entry for the same resistor
    /// replaces an earlier one.
    pub fn from_entries(entries: impl IntoIterator<Item = CalibrationEntry>) -> Self {
        let mut table = Self::new();
        for entry in entries {
            table.insert(entry);
        }
        table
    }

    pub fn insert(&mut self, entry: CalibrationEntry) {
        self.entries.insert(entry.resistor, entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in increasing resistor order.
    pub fn entries(&self) -> impl Iterator<Item = &CalibrationEntry> {
        self.entries.values()
    }

    /// Energy quantum for a given counter frequency.
    ///
    /// Scans entries in increasing resistor (decreasing frequency) order.
    /// Frequencies above the first entry or below the last entry clamp to
    /// that entry's quantum. Anything in between is linearly interpolated
    /// between the two entries that bracket it, so each entry's own
    /// frequency reproduces its quantum exactly.
    ///
    /// Returns `None` when the table is empty.
    pub fn quantum_at(&self, frequency: f64) -> Option<f64> {
        let mut prev: Option<&CalibrationEntry> = None;
        for entry in self.entries.values() {
            if frequency <= entry.frequency {
                prev = Some(entry);
                continue;
            }
            return Some(match prev {
                // above the highest calibrated frequency
                None => entry.energy_quantum,
                Some(upper) => {
                    let df = upper.frequency - entry.frequency;
                    let de = upper.energy_quantum - entry.energy_quantum;
                    (frequency - entry.frequency) / df * de + entry.energy_quantum
                }
            });
        }
        // at or below the lowest calibrated frequency
        prev.map(|last| last.energy_quantum)
    }
}

/// Parse one line of live calibration output: `<resistor> <frequency> <energy_quantum>`.
///
/// Returns `None` for anything else (banners, blank lines, partial lines).
pub fn parse_calibration_line(line: &str) -> Option<CalibrationEntry> {
    let mut fields = line.split_whitespace();
    let resistor = fields.next()?.parse().ok()?;
    let frequency = fields.next()?.parse().ok()?;
    let energy_quantum = fields.next()?.parse().ok()?;
    if fields.next().is_some() {
        return None;
    }
    let entry = CalibrationEntry {
        resistor,
        frequency,
        energy_quantum,
    };
    entry.validate().ok()?;
    Some(entry)
}

// ---------------------------------------------------------------------------
// Calibration file
// ---------------------------------------------------------------------------

/// Calibration of one node as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub calibrated_at: String,
    pub entries: Vec<CalibrationEntry>,
}

impl CalibrationRecord {
    /// Snapshot a table, stamping it with the current time.
    pub fn from_table(table: &CalibrationTable) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            calibrated_at: format_iso8601(now),
            entries: table.entries().copied().collect(),
        }
    }

    pub fn to_table(&self) -> CalibrationTable {
        CalibrationTable::from_entries(self.entries.iter().copied())
    }
}

/// All node calibrations of a testbed, keyed by node label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationFile {
    pub version: u32,
    pub nodes: BTreeMap<String, CalibrationRecord>,
}

impl Default for CalibrationFile {
    fn default() -> Self {
        Self {
            version: CALIBRATION_FORMAT_VERSION,
            nodes: BTreeMap::new(),
        }
    }
}

impl CalibrationFile {
    /// Read and validate a calibration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let file: Self = serde_json::from_str(&raw)?;
        file.validate()?;
        Ok(file)
    }

    /// Write the calibration file as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn insert(&mut self, label: impl Into<String>, table: &CalibrationTable) {
        self.nodes
            .insert(label.into(), CalibrationRecord::from_table(table));
    }

    /// Table for a configured node. A missing section is a configuration
    /// error: every configured node must have been calibrated.
    pub fn table_for(&self, label: &str) -> Result<CalibrationTable> {
        self.nodes
            .get(label)
            .map(CalibrationRecord::to_table)
            .ok_or_else(|| {
                MotebedError::configuration(format!(
                    "calibration file has no section for node '{label}'"
                ))
            })
    }

    fn validate(&self) -> Result<()> {
        if self.version != CALIBRATION_FORMAT_VERSION {
            return Err(MotebedError::configuration(format!(
                "unsupported calibration format version {}",
                self.version
            )));
        }
        for (label, record) in &self.nodes {
            if record.entries.is_empty() {
                return Err(MotebedError::configuration(format!(
                    "calibration for node '{label}' has no entries"
                )));
            }
            for entry in &record.entries {
                entry.validate().map_err(|reason| {
                    MotebedError::configuration(format!(
                        "calibration for node '{label}': {reason}"
                    ))
                })?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// Format a duration-since-epoch as a full ISO-8601 timestamp.
/// Example: `2026-02-15T01:30:00Z`
pub(crate) fn format_iso8601(since_epoch: Duration) -> String {
    let (year, month, day, hour, min, sec) = secs_to_utc(since_epoch.as_secs());
    format!("{year:04}-{month:02}-{day:02}T{hour:02}:{min:02}:{sec:02}Z")
}

/// Convert seconds since Unix epoch to (year, month, day, hour, minute, second) UTC.
fn secs_to_utc(secs: u64) -> (u64, u64, u64, u64, u64, u64) {
    let sec = secs % 60;
    let min = (secs / 60) % 60;
    let hour = (secs / 3600) % 24;

    let mut days = secs / 86400;
    let mut year = 1970u64;
    loop {
        let days_in_year = if is_leap(year) { 366 } else { 365 };
        if days < days_in_year {
            break;
        }
        days -= days_in_year;
        year += 1;
    }

    let feb = if is_leap(year) { 29 } else { 28 };
    let months_days: [u64; 12] = [31, feb, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
    let mut month = 12u64;
    for (i, &md) in months_days.iter().enumerate() {
        if days < md {
            month = i as u64 + 1;
            break;
        }
        days -= md;
    }

    (year, month, days + 1, hour, min, sec)
}

fn is_leap(year: u64) -> bool {
    (year % 4 == 0 && year % 100 != 0) || (year % 400 == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(resistor: u64, frequency: f64, energy_quantum: f64) -> CalibrationEntry {
        CalibrationEntry {
            resistor,
            frequency,
            energy_quantum,
        }
    }

    /// Three points with strictly decreasing frequency as the resistor grows.
    fn ladder() -> CalibrationTable {
        CalibrationTable::from_entries([
            entry(10, 9000.0, 3.0),
            entry(100, 6000.0, 2.0),
            entry(1000, 1000.0, 1.0),
        ])
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    #[test]
    fn test_empty_table_is_undefined() {
        assert_eq!(CalibrationTable::new().quantum_at(5000.0), None);
    }

    #[test]
    fn test_exact_points_reproduced() {
        let t = ladder();
        for e in t.entries() {
            let q = t.quantum_at(e.frequency).unwrap();
            assert!((q - e.energy_quantum).abs() < 1e-12, "at {}", e.frequency);
        }
    }

    #[test]
    fn test_clamps_above_highest_frequency() {
        assert_eq!(ladder().quantum_at(50_000.0), Some(3.0));
    }

    #[test]
    fn test_clamps_below_lowest_frequency() {
        assert_eq!(ladder().quantum_at(10.0), Some(1.0));
        assert_eq!(ladder().quantum_at(0.0), Some(1.0));
    }

    #[test]
    fn test_interpolates_midpoint() {
        let t = ladder();
        let q = t.quantum_at(7500.0).unwrap();
        assert!((q - 2.5).abs() < 1e-12);
        let q = t.quantum_at(3500.0).unwrap();
        assert!((q - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_monotonic_between_points() {
        let t = ladder();
        let mut last = t.quantum_at(1000.0).unwrap();
        let mut f = 1000.0;
        while f <= 9000.0 {
            let q = t.quantum_at(f).unwrap();
            assert!(q >= last - 1e-12, "non-monotonic at {f}");
            last = q;
            f += 250.0;
        }
    }

    #[test]
    fn test_single_entry_is_constant() {
        let t = CalibrationTable::from_entries([entry(1, 4000.0, 2.0)]);
        assert_eq!(t.quantum_at(1.0), Some(2.0));
        assert_eq!(t.quantum_at(4000.0), Some(2.0));
        assert_eq!(t.quantum_at(1e9), Some(2.0));
    }

    #[test]
    fn test_entries_ordered_by_resistor() {
        let t = CalibrationTable::from_entries([
            entry(1000, 1000.0, 1.0),
            entry(10, 9000.0, 3.0),
            entry(100, 6000.0, 2.0),
        ]);
        let order: Vec<u64> = t.entries().map(|e| e.resistor).collect();
        assert_eq!(order, vec![10, 100, 1000]);
    }

    // -----------------------------------------------------------------------
    // Live calibration lines
    // -----------------------------------------------------------------------

    #[test]
    fn test_parse_calibration_line() {
        assert_eq!(
            parse_calibration_line("470 8123.5 0.0021"),
            Some(entry(470, 8123.5, 0.0021))
        );
        assert_eq!(parse_calibration_line("# calibrating"), None);
        assert_eq!(parse_calibration_line("470 8123.5"), None);
        assert_eq!(parse_calibration_line("470 8123.5 0.1 extra"), None);
        assert_eq!(parse_calibration_line("470 -1 0.1"), None);
    }

    // -----------------------------------------------------------------------
    // File format
    // -----------------------------------------------------------------------

    #[test]
    fn test_file_save_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("calibration.json");

        let mut file = CalibrationFile::default();
        file.insert("node1", &ladder());
        file.save(&path).unwrap();

        let loaded = CalibrationFile::load(&path).unwrap();
        assert_eq!(loaded.table_for("node1").unwrap(), ladder());
        assert!(loaded.nodes["node1"].calibrated_at.ends_with('Z'));
    }

    #[test]
    fn test_missing_section_is_configuration_error() {
        let file = CalibrationFile::default();
        let err = file.table_for("node9").unwrap_err();
        assert!(matches!(err, MotebedError::Configuration { .. }));
    }

    #[test]
    fn test_load_rejects_invalid_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bad.json");
        std::fs::write(
            &path,
            r#"{"version":1,"nodes":{"n":{"calibrated_at":"x","entries":[{"resistor":1,"frequency":0.0,"energy_quantum":1.0}]}}}"#,
        )
        .unwrap();
        assert!(matches!(
            CalibrationFile::load(&path),
            Err(MotebedError::Configuration { .. })
        ));
    }

    #[test]
    fn test_load_rejects_expressions() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("expr.json");
        std::fs::write(&path, r#"{"version":1,"nodes":{"n":"__import__('os')"}}"#).unwrap();
        assert!(matches!(
            CalibrationFile::load(&path),
            Err(MotebedError::Json { .. })
        ));
    }

    #[test]
    fn test_load_rejects_unknown_version() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("v2.json");
        std::fs::write(&path, r#"{"version":2,"nodes":{}}"#).unwrap();
        assert!(CalibrationFile::load(&path).is_err());
    }

    // -----------------------------------------------------------------------
    // Timestamps
    // -----------------------------------------------------------------------

    #[test]
    fn test_format_iso8601_epoch() {
        assert_eq!(format_iso8601(Duration::ZERO), "1970-01-01T00:00:00Z");
    }

    #[test]
    fn test_secs_to_utc_known_date() {
        // 2000-01-01 00:00:00 UTC
        assert_eq!(secs_to_utc(946_684_800), (2000, 1, 1, 0, 0, 0));
        // 2024-02-29 12:00:00 UTC
        assert_eq!(secs_to_utc(1_709_208_000), (2024, 2, 29, 12, 0, 0));
    }
}
