//! Parsing of decoded energy traces into regression samples.
//!
//! A decoded trace is line-oriented text. One header line starting with
//! [`STATES_MARKER`] names the firmware states; every following data line
//! holds one activity flag per state, then the elapsed time in microseconds,
//! the instruction count and an occurrence count:
//!
//! ```text
//! #states: cpu radio led0
//! 1 0 - 1200 340 1
//! 1 1 0 800 410 1
//! ```
//!
//! Lines that cannot be interpreted are skipped, never reported as errors:
//! the trace decoder routinely emits truncated or zeroed trailing records.
//! Bytes that are not UTF-8 are decoded lossily, and a read error (such as a
//! truncated `.gz` stream) ends the trace after the last complete line.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use flate2::read::GzDecoder;

/// Token that opens the state declaration line.
pub const STATES_MARKER: &str = "#states:";
/// Name of the implicit always-active state appended to every sample.
pub const CONST_STATE: &str = "const";
/// Placeholder for a state whose activity was not recorded.
const INACTIVE_TOKEN: &str = "-";

/// One interval of a trace: which states were active, and what the energy
/// meter counted during it.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceSample {
    /// Activity flag per declared state, followed by the `const` flag (1).
    pub active: Vec<u8>,
    /// Energy meter instruction count.
    pub icount: u64,
    /// Interval length in seconds.
    pub elapsed: f64,
    /// How many times this interval pattern occurred (informational).
    pub occurrences: u64,
}

impl TraceSample {
    /// Bitmap width including the `const` flag.
    pub fn width(&self) -> usize {
        self.active.len()
    }
}

/// Counters of what the filter did with each line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterStats {
    pub header_lines: u64,
    pub accepted: u64,
    /// Lines seen before a header or with the wrong number of fields.
    pub rejected_shape: u64,
    /// Well-formed lines with non-positive time or count.
    pub rejected_values: u64,
}

/// Lines of a trace reader, decoded lossily. A read error ends the
/// sequence.
pub struct TraceLines<R> {
    chunks: std::io::Split<R>,
    done: bool,
}

impl<R: BufRead> TraceLines<R> {
    pub fn new(reader: R) -> Self {
        Self {
            chunks: reader.split(b'\n'),
            done: false,
        }
    }
}

impl<R: BufRead> Iterator for TraceLines<R> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if self.done {
            return None;
        }
        match self.chunks.next()? {
            Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) => {
                log::warn!("trace ends early: {e}");
                self.done = true;
                None
            }
        }
    }
}

/// Lazy sequence of [`TraceSample`]s from raw trace lines.
pub struct TraceSampleFilter<I> {
    lines: I,
    states: Vec<String>,
    max_width: usize,
    stats: FilterStats,
}

impl<R: BufRead> TraceSampleFilter<TraceLines<R>> {
    pub fn from_reader(reader: R) -> Self {
        Self::new(TraceLines::new(reader))
    }
}

impl TraceSampleFilter<TraceLines<Box<dyn BufRead>>> {
    /// Open a decoded trace file. Files ending in `.gz` are decompressed on
    /// the fly.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = File::open(path)?;
        let reader: Box<dyn BufRead> = if path.extension().is_some_and(|e| e == "gz") {
            Box::new(BufReader::new(GzDecoder::new(file)))
        } else {
            Box::new(BufReader::new(file))
        };
        Ok(Self::from_reader(reader))
    }
}

impl<I> TraceSampleFilter<I>
where
    I: Iterator<Item = String>,
{
    pub fn new(lines: I) -> Self {
        Self {
            lines,
            states: Vec::new(),
            max_width: 0,
            stats: FilterStats::default(),
        }
    }

    /// Most recently declared state names (without `const`).
    pub fn states(&self) -> &[String] {
        &self.states
    }

    /// Widest bitmap seen so far, counting well-formed lines that were
    /// rejected for their time or count values.
    pub fn max_width(&self) -> usize {
        self.max_width
    }

    pub fn stats(&self) -> FilterStats {
        self.stats
    }

    /// Interpret one line. Returns `None` for header lines and anything that
    /// does not become a sample.
    fn admit(&mut self, line: &str) -> Option<TraceSample> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.first() == Some(&STATES_MARKER) {
            self.states = fields[1..].iter().map(|s| s.to_string()).collect();
            self.stats.header_lines += 1;
            return None;
        }
        if self.states.is_empty() || fields.len() != self.states.len() + 3 {
            self.stats.rejected_shape += 1;
            return None;
        }

        let (flags, counters) = fields.split_at(self.states.len());
        let parsed = (
            counters[0].parse::<f64>(),
            counters[1].parse::<i64>(),
            counters[2].parse::<u64>(),
        );
        let (Ok(time_us), Ok(icount), Ok(occurrences)) = parsed else {
            self.stats.rejected_shape += 1;
            return None;
        };

        let mut active = Vec::with_capacity(flags.len() + 1);
        for token in flags {
            if *token == INACTIVE_TOKEN {
                active.push(0);
            } else if let Ok(flag) = token.parse::<u8>() {
                active.push(flag);
            } else {
                self.stats.rejected_shape += 1;
                return None;
            }
        }
        active.push(1);
        self.max_width = self.max_width.max(active.len());

        let elapsed = time_us / 1e6;
        if elapsed <= 0.0 || icount <= 0 {
            self.stats.rejected_values += 1;
            return None;
        }

        self.stats.accepted += 1;
        Some(TraceSample {
            active,
            icount: icount as u64,
            elapsed,
            occurrences,
        })
    }
}

impl<I> Iterator for TraceSampleFilter<I>
where
    I: Iterator<Item = String>,
{
    type Item = TraceSample;

    fn next(&mut self) -> Option<TraceSample> {
        loop {
            let line = self.lines.next()?;
            if let Some(sample) = self.admit(&line) {
                return Some(sample);
            }
        }
    }
}
