//! Supervision of external commands.
//!
//! Every external tool the testbed drives (firmware build, flasher, serial
//! listener, trace decoder) runs as a [`ManagedProcess`]: a shell command
//! whose stdout and stderr are split into lines by reader threads and fanned
//! out to optional files on disk, in-memory buffers and per-line callbacks.
//!
//! On Unix the command runs in its own process group so that [`stop`]
//! reaches the whole pipeline, not only the shell.
//!
//! [`stop`]: ManagedProcess::stop

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// How long [`ManagedProcess::stop`] waits after SIGTERM before SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Callback invoked with every line a process prints.
pub type LineCallback = Box<dyn FnMut(&str) + Send>;

/// What to run and where its output goes.
pub struct ProcessSpec {
    command: String,
    stdout_file: Option<PathBuf>,
    stderr_file: Option<PathBuf>,
    capture: bool,
    stdout_callbacks: Vec<LineCallback>,
}

impl ProcessSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            stdout_file: None,
            stderr_file: None,
            capture: false,
            stdout_callbacks: Vec::new(),
        }
    }

    /// Mirror stdout lines into a file (truncated on start).
    pub fn stdout_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout_file = Some(path.into());
        self
    }

    /// Mirror stderr lines into a file (truncated on start).
    pub fn stderr_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.stderr_file = Some(path.into());
        self
    }

    /// Keep stdout and stderr in memory for later inspection.
    pub fn capture(mut self) -> Self {
        self.capture = true;
        self
    }

    pub fn on_stdout_line(mut self, callback: impl FnMut(&str) + Send + 'static) -> Self {
        self.stdout_callbacks.push(Box::new(callback));
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

/// Result of a command run to completion with captured output.
#[derive(Debug, Clone)]
pub struct Completed {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl Completed {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// A running (or finished) supervised command.
pub struct ManagedProcess {
    command: String,
    pid: u32,
    child: Mutex<Child>,
    status: Mutex<Option<ExitStatus>>,
    readers: Mutex<Vec<JoinHandle<()>>>,
    stdout: Arc<Mutex<String>>,
    stderr: Arc<Mutex<String>>,
}

impl ManagedProcess {
    /// Spawn `sh -c <command>` and start forwarding its output.
    pub fn start(spec: ProcessSpec) -> std::io::Result<Self> {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&spec.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let stdout_sink = spec.stdout_file.as_deref().map(File::create).transpose()?;
        let stderr_sink = spec.stderr_file.as_deref().map(File::create).transpose()?;

        let mut child = command.spawn()?;
        let pid = child.id();
        log::debug!("started pid {pid}: {}", spec.command);

        let stdout = Arc::new(Mutex::new(String::new()));
        let stderr = Arc::new(Mutex::new(String::new()));
        let mut readers = Vec::with_capacity(2);

        if let Some(pipe) = child.stdout.take() {
            let buffer = spec.capture.then(|| Arc::clone(&stdout));
            readers.push(spawn_reader(pipe, stdout_sink, buffer, spec.stdout_callbacks));
        }
        if let Some(pipe) = child.stderr.take() {
            let buffer = spec.capture.then(|| Arc::clone(&stderr));
            readers.push(spawn_reader(pipe, stderr_sink, buffer, Vec::new()));
        }

        Ok(Self {
            command: spec.command,
            pid,
            child: Mutex::new(child),
            status: Mutex::new(None),
            readers: Mutex::new(readers),
            stdout,
            stderr,
        })
    }

    /// Start a command, wait for it and return its captured output.
    pub fn run(command: impl Into<String>) -> std::io::Result<Completed> {
        let process = Self::start(ProcessSpec::new(command).capture())?;
        let status = process.wait()?;
        Ok(Completed {
            status,
            stdout: process.captured_stdout(),
            stderr: process.captured_stderr(),
        })
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether the process has exited.
    pub fn is_dead(&self) -> bool {
        self.poll().is_some()
    }

    /// Exit code, `None` while running or if killed by a signal.
    pub fn returncode(&self) -> Option<i32> {
        self.poll().and_then(|s| s.code())
    }

    /// Block until the process exits and its output has been drained.
    pub fn wait(&self) -> std::io::Result<ExitStatus> {
        let status = match self.poll() {
            Some(status) => status,
            None => {
                let status = lock(&self.child).wait()?;
                *lock(&self.status) = Some(status);
                status
            }
        };
        self.join_readers();
        Ok(status)
    }

    /// Ask the process group to terminate, escalating to SIGKILL after a
    /// grace period. No-op if the process already exited.
    pub fn stop(&self) {
        if self.is_dead() {
            self.join_readers();
            return;
        }
        log::debug!("stopping pid {}: {}", self.pid, self.command);
        self.signal_terminate();

        let deadline = Instant::now() + STOP_GRACE;
        while Instant::now() < deadline {
            if self.is_dead() {
                self.join_readers();
                return;
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        log::warn!("pid {} ignored SIGTERM, killing", self.pid);
        self.signal_kill();
        let _ = self.wait();
    }

    pub fn captured_stdout(&self) -> String {
        lock(&self.stdout).clone()
    }

    pub fn captured_stderr(&self) -> String {
        lock(&self.stderr).clone()
    }

    fn poll(&self) -> Option<ExitStatus> {
        let mut status = lock(&self.status);
        if status.is_none() {
            *status = lock(&self.child).try_wait().ok().flatten();
        }
        *status
    }

    fn join_readers(&self) {
        let readers: Vec<JoinHandle<()>> = lock(&self.readers).drain(..).collect();
        for reader in readers {
            let _ = reader.join();
        }
    }

    #[cfg(unix)]
    fn signal_terminate(&self) {
        // SAFETY: kill(2) with a negative pid signals the process group we
        // created in `start`; it has no memory-safety preconditions.
        unsafe {
            libc::kill(-(self.pid as libc::pid_t), libc::SIGTERM);
        }
    }

    #[cfg(not(unix))]
    fn signal_terminate(&self) {
        let _ = lock(&self.child).kill();
    }

    #[cfg(unix)]
    fn signal_kill(&self) {
        // SAFETY: see `signal_terminate`.
        unsafe {
            libc::kill(-(self.pid as libc::pid_t), libc::SIGKILL);
        }
    }

    #[cfg(not(unix))]
    fn signal_kill(&self) {
        let _ = lock(&self.child).kill();
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        if !self.is_dead() {
            self.stop();
        }
    }
}

/// Lock a mutex, recovering the data if a reader thread panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn spawn_reader(
    pipe: impl Read + Send + 'static,
    sink: Option<File>,
    buffer: Option<Arc<Mutex<String>>>,
    mut callbacks: Vec<LineCallback>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut sink = sink.map(BufWriter::new);
        for chunk in BufReader::new(pipe).split(b'\n') {
            let Ok(bytes) = chunk else {
                break;
            };
            let text = String::from_utf8_lossy(&bytes);
            let line = text.trim_end_matches('\r');
            if let Some(out) = sink.as_mut()
                && writeln!(out, "{line}").is_err()
            {
                sink = None;
            }
            if let Some(buf) = &buffer {
                let mut buf = lock(buf);
                buf.push_str(line);
                buf.push('\n');
            }
            for callback in callbacks.iter_mut() {
                callback(line);
            }
        }
        if let Some(mut out) = sink {
            let _ = out.flush();
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_run_captures_output() {
        let done = ManagedProcess::run("echo hello; echo oops >&2").unwrap();
        assert!(done.success());
        assert_eq!(done.stdout, "hello\n");
        assert_eq!(done.stderr, "oops\n");
    }

    #[test]
    fn test_returncode() {
        let p = ManagedProcess::start(ProcessSpec::new("exit 3")).unwrap();
        p.wait().unwrap();
        assert!(p.is_dead());
        assert_eq!(p.returncode(), Some(3));
    }

    #[test]
    fn test_line_callbacks_and_file_sink() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("out.log");
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);

        let spec = ProcessSpec::new("printf 'a\\nb\\nc\\n'")
            .stdout_to(&log)
            .on_stdout_line(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            });
        let p = ManagedProcess::start(spec).unwrap();
        p.wait().unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "a\nb\nc\n");
    }

    #[test]
    fn test_stop_running_process() {
        let p = ManagedProcess::start(ProcessSpec::new("sleep 30")).unwrap();
        assert!(!p.is_dead());
        assert_eq!(p.returncode(), None);
        let t0 = Instant::now();
        p.stop();
        assert!(p.is_dead());
        assert!(t0.elapsed() < Duration::from_secs(10));
        // terminated by signal: no exit code
        assert_eq!(p.returncode(), None);
    }

    #[test]
    fn test_stop_after_exit_is_noop() {
        let p = ManagedProcess::start(ProcessSpec::new("true")).unwrap();
        p.wait().unwrap();
        p.stop();
        assert_eq!(p.returncode(), Some(0));
    }
}
