//! Serial capture sessions.
//!
//! One capture *generation* is a set of supervised listener processes, one
//! per node, started together. Every line a listener prints bumps that
//! node's message counter. At most one generation is active per manager:
//! starting a new one stops the old one first.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use uuid::Uuid;

use crate::calibration::format_iso8601;
use crate::error::Result;
use crate::process::{ManagedProcess, ProcessSpec};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Cooperative cancellation for a blocking capture. Cloning shares the flag,
/// so a Ctrl+C handler can hold one copy while the manager polls another.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// How [`CaptureSessionManager::start_all`] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Wait until every listener exits, the timeout expires or the stop
    /// signal fires.
    Blocking { timeout: Option<Duration> },
    /// Return right away and leave the listeners running.
    Detached,
}

/// A listener to start for one node.
pub struct CaptureTarget {
    pub node: u32,
    pub label: String,
    /// Receives one increment per captured line.
    pub counter: Arc<AtomicU64>,
    pub spec: ProcessSpec,
}

struct CaptureSession {
    node: u32,
    label: String,
    counter: Arc<AtomicU64>,
    process: ManagedProcess,
}

/// State of one node's listener.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub node: u32,
    pub label: String,
    pub messages: u64,
    pub running: bool,
    pub returncode: Option<i32>,
}

/// Snapshot of a capture generation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureReport {
    pub generation: String,
    pub started_at: String,
    pub elapsed_ms: u64,
    pub timed_out: bool,
    pub cancelled: bool,
    pub sessions: Vec<SessionStatus>,
}

impl CaptureReport {
    pub fn total_messages(&self) -> u64 {
        self.sessions.iter().map(|s| s.messages).sum()
    }
}

/// Starts, watches and stops capture generations.
pub struct CaptureSessionManager {
    sessions: Vec<CaptureSession>,
    generation: Option<Uuid>,
    started: Instant,
    started_at: String,
    stop_signal: StopSignal,
    poll_interval: Duration,
}

impl Default for CaptureSessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureSessionManager {
    pub fn new() -> Self {
        Self {
            sessions: Vec::new(),
            generation: None,
            started: Instant::now(),
            started_at: String::new(),
            stop_signal: StopSignal::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Handle that cancels a blocking capture from another thread.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop_signal.clone()
    }

    pub fn is_active(&self) -> bool {
        !self.sessions.is_empty()
    }

    pub fn generation(&self) -> Option<Uuid> {
        self.generation
    }

    /// Start one listener per target. A generation that is still active is
    /// stopped first. If any listener fails to spawn, the ones already
    /// started are stopped and the error returned.
    pub fn start_all(
        &mut self,
        targets: Vec<CaptureTarget>,
        mode: CaptureMode,
    ) -> Result<CaptureReport> {
        if self.is_active() {
            log::info!("stopping previous capture generation before starting a new one");
            self.stop_all();
        }
        self.stop_signal.clear();

        let generation = Uuid::new_v4();
        self.generation = Some(generation);
        self.started = Instant::now();
        self.started_at = format_iso8601(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default(),
        );
        log::info!("capture {generation}: starting {} listeners", targets.len());

        for target in targets {
            target.counter.store(0, Ordering::Relaxed);
            let counter = Arc::clone(&target.counter);
            let spec = target.spec.on_stdout_line(move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
            });
            match ManagedProcess::start(spec) {
                Ok(process) => self.sessions.push(CaptureSession {
                    node: target.node,
                    label: target.label,
                    counter: target.counter,
                    process,
                }),
                Err(e) => {
                    log::error!("node {}: cannot start capture: {e}", target.node);
                    self.stop_all();
                    return Err(e.into());
                }
            }
        }

        Ok(match mode {
            CaptureMode::Detached => self.snapshot(false, false),
            CaptureMode::Blocking { timeout } => self.wait(timeout),
        })
    }

    /// Block until every listener exits, `timeout` expires or the stop
    /// signal fires; whatever is still running then gets stopped. The
    /// generation is over when this returns.
    pub fn wait(&mut self, timeout: Option<Duration>) -> CaptureReport {
        let deadline = timeout.map(|t| Instant::now() + t);
        let (timed_out, cancelled) = loop {
            if self.sessions.iter().all(|s| s.process.is_dead()) {
                break (false, false);
            }
            if self.stop_signal.is_triggered() {
                log::info!("capture cancelled");
                break (false, true);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                log::info!("capture timeout reached, stopping listeners");
                break (true, false);
            }
            std::thread::sleep(self.poll_interval);
        };
        self.stop_live();
        let report = self.snapshot(timed_out, cancelled);
        self.finish();
        report
    }

    /// Stop every listener of the active generation. Returns its final
    /// snapshot, or `None` if nothing was running.
    pub fn stop_all(&mut self) -> Option<CaptureReport> {
        if !self.is_active() {
            return None;
        }
        self.stop_live();
        let report = self.snapshot(false, true);
        self.finish();
        Some(report)
    }

    /// Snapshot of the active generation.
    pub fn report(&self) -> Option<CaptureReport> {
        self.is_active().then(|| self.snapshot(false, false))
    }

    fn stop_live(&self) {
        std::thread::scope(|s| {
            for session in self.sessions.iter().filter(|c| !c.process.is_dead()) {
                s.spawn(move || session.process.stop());
            }
        });
        for session in &self.sessions {
            // make sure every line has been counted
            let _ = session.process.wait();
            log::debug!(
                "node {}: capture ended with {:?}, {} messages",
                session.node,
                session.process.returncode(),
                session.counter.load(Ordering::Relaxed)
            );
        }
    }

    fn snapshot(&self, timed_out: bool, cancelled: bool) -> CaptureReport {
        CaptureReport {
            generation: self.generation.map(|g| g.to_string()).unwrap_or_default(),
            started_at: self.started_at.clone(),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            timed_out,
            cancelled,
            sessions: self
                .sessions
                .iter()
                .map(|s| SessionStatus {
                    node: s.node,
                    label: s.label.clone(),
                    messages: s.counter.load(Ordering::Relaxed),
                    running: !s.process.is_dead(),
                    returncode: s.process.returncode(),
                })
                .collect(),
        }
    }

    fn finish(&mut self) {
        if let Some(generation) = self.generation.take() {
            log::info!("capture {generation}: finished");
        }
        self.sessions.clear();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn target(node: u32, command: &str) -> CaptureTarget {
        CaptureTarget {
            node,
            label: format!("node{node}"),
            counter: Arc::new(AtomicU64::new(0)),
            spec: ProcessSpec::new(command),
        }
    }

    fn manager() -> CaptureSessionManager {
        CaptureSessionManager::new().with_poll_interval(Duration::from_millis(10))
    }

    // -----------------------------------------------------------------------
    // Blocking
    // -----------------------------------------------------------------------

    #[test]
    fn test_blocking_counts_lines() {
        let mut m = manager();
        let report = m
            .start_all(
                vec![target(1, "printf 'a\\nb\\n'"), target(2, "printf 'x\\ny\\nz\\n'")],
                CaptureMode::Blocking { timeout: None },
            )
            .unwrap();
        assert!(!report.timed_out);
        assert_eq!(report.sessions[0].messages, 2);
        assert_eq!(report.sessions[1].messages, 3);
        assert_eq!(report.total_messages(), 5);
        assert!(!m.is_active());
    }

    #[test]
    fn test_timeout_stops_live_sessions() {
        let mut m = manager();
        let t0 = Instant::now();
        let report = m
            .start_all(
                vec![target(1, "echo hi; sleep 30"), target(2, "true")],
                CaptureMode::Blocking {
                    timeout: Some(Duration::from_millis(300)),
                },
            )
            .unwrap();
        assert!(report.timed_out);
        assert!(t0.elapsed() < Duration::from_secs(10));
        assert_eq!(report.sessions[0].messages, 1);
        assert!(report.sessions.iter().all(|s| !s.running));
    }

    #[test]
    fn test_stop_signal_cancels() {
        let mut m = manager();
        let signal = m.stop_signal();
        let trigger = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            signal.trigger();
        });
        let report = m
            .start_all(
                vec![target(1, "sleep 30")],
                CaptureMode::Blocking { timeout: None },
            )
            .unwrap();
        trigger.join().unwrap();
        assert!(report.cancelled);
        assert!(!report.timed_out);
    }

    // -----------------------------------------------------------------------
    // Detached
    // -----------------------------------------------------------------------

    #[test]
    fn test_detached_then_stop() {
        let mut m = manager();
        let report = m
            .start_all(vec![target(1, "sleep 30")], CaptureMode::Detached)
            .unwrap();
        assert!(report.sessions[0].running);
        assert!(m.is_active());
        assert!(m.generation().is_some());

        let last = m.stop_all().unwrap();
        assert!(!last.sessions[0].running);
        assert!(!m.is_active());
        assert!(m.stop_all().is_none());
    }

    #[test]
    fn test_restart_stops_previous_generation() {
        let mut m = manager();
        m.start_all(vec![target(1, "sleep 30")], CaptureMode::Detached)
            .unwrap();
        let first = m.generation().unwrap();

        m.start_all(vec![target(2, "sleep 30")], CaptureMode::Detached)
            .unwrap();
        let report = m.report().unwrap();
        assert_ne!(m.generation().unwrap(), first);
        assert_eq!(report.sessions.len(), 1);
        assert_eq!(report.sessions[0].node, 2);
        m.stop_all();
    }

    #[test]
    fn test_output_written_to_sink() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("run.node1.log");
        let mut t = target(1, "echo 7e 45 00");
        t.spec = t.spec.stdout_to(&log);
        manager()
            .start_all(vec![t], CaptureMode::Blocking { timeout: None })
            .unwrap();
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "7e 45 00\n");
    }
}
