//! Bounded output capture and timeout supervision for child processes.
//!
//! Both execution backends spawn a child process and need the same
//! contract: stdout and stderr are drained concurrently into buffers capped
//! at a fixed byte size, the child is killed when the timeout elapses, and
//! whatever output was produced before the kill is kept.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How long to wait for pipe readers after the child has gone away.
///
/// Grandchildren can keep a pipe open after the direct child is killed;
/// output still buffered after this window is abandoned.
pub const DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Byte buffer that stops growing at `cap` and remembers it overflowed.
#[derive(Debug, Clone, Default)]
pub struct CappedBuffer {
    data: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl CappedBuffer {
    /// Create an empty buffer holding at most `cap` bytes.
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            data: Vec::new(),
            cap,
            truncated: false,
        }
    }

    /// Append bytes, dropping anything beyond the cap.
    pub fn extend(&mut self, bytes: &[u8]) {
        let room = self.cap.saturating_sub(self.data.len());
        if bytes.len() > room {
            self.truncated = true;
        }
        let take = bytes.len().min(room);
        self.data.extend_from_slice(&bytes[..take]);
    }

    /// Whether bytes were discarded.
    #[must_use]
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Number of retained bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether nothing was retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Lossy UTF-8 view of the retained bytes.
    #[must_use]
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

type SharedBuffer = Arc<Mutex<CappedBuffer>>;

/// Drain `reader` into `buffer` until EOF.
///
/// Reading continues past the cap so a chatty child never blocks on a full
/// pipe; excess bytes are discarded.
fn spawn_reader<R>(mut reader: R, buffer: SharedBuffer) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    if let Ok(mut buf) = buffer.lock() {
                        buf.extend(&chunk[..n]);
                    }
                }
                Err(e) => {
                    debug!("Output pipe read failed: {}", e);
                    break;
                }
            }
        }
    })
}

/// Outcome of a supervised child process.
#[derive(Debug, Clone)]
pub struct CapturedRun {
    pub stdout: CappedBuffer,
    pub stderr: CappedBuffer,
    /// `None` when killed by a signal or by the timeout
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration: Duration,
}

/// Forcible cleanup for whatever a run may leave behind besides the
/// direct child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Teardown {
    /// Killing the direct child is enough.
    None,
    /// SIGKILL the child's process group (the child must lead its own group).
    ProcessGroup,
    /// `<runtime> kill <name>`; the container outlives its CLI client.
    Container { runtime: String, name: String },
}

impl Teardown {
    /// Whether to tear down even when the child exited on its own.
    ///
    /// Background processes survive their group leader; a `--rm` container
    /// is already gone once its client exits.
    fn after_exit(&self) -> bool {
        matches!(self, Teardown::ProcessGroup)
    }

    /// Run the teardown, blocking until the kill command returns.
    fn run(&self, pid: Option<u32>) {
        match self {
            Teardown::None => {}
            Teardown::ProcessGroup => {
                if let Some(pid) = pid {
                    kill_command(&["-KILL", "--", &format!("-{}", pid)]);
                }
            }
            Teardown::Container { runtime, name } => {
                let status = std::process::Command::new(runtime)
                    .args(["kill", name])
                    .stdout(std::process::Stdio::null())
                    .stderr(std::process::Stdio::null())
                    .status();
                if let Err(e) = status {
                    debug!("Container kill for {} failed: {}", name, e);
                }
            }
        }
    }
}

fn kill_command(args: &[&str]) {
    let status = std::process::Command::new("kill")
        .args(args)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status();
    if let Err(e) = status {
        debug!("kill {:?} failed: {}", args, e);
    }
}

/// Runs the teardown exactly once, including when the run future is
/// dropped mid-flight (for example by an enclosing timeout).
struct TeardownGuard {
    teardown: Option<Teardown>,
    pid: Option<u32>,
}

impl TeardownGuard {
    fn new(teardown: Teardown, pid: Option<u32>) -> Self {
        let teardown = (teardown != Teardown::None).then_some(teardown);
        Self { teardown, pid }
    }

    fn disarm(&mut self) {
        self.teardown = None;
    }

    async fn fire(&mut self) {
        if let Some(teardown) = self.teardown.take() {
            let pid = self.pid;
            if let Err(e) = tokio::task::spawn_blocking(move || teardown.run(pid)).await {
                warn!("Teardown task failed: {}", e);
            }
        }
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        let Some(teardown) = self.teardown.take() else {
            return;
        };
        let pid = self.pid;
        debug!("Run abandoned, tearing down {:?}", teardown);
        if teardown == Teardown::ProcessGroup {
            // `kill` returns immediately; stay on the current thread.
            teardown.run(pid);
        } else {
            std::thread::spawn(move || teardown.run(pid));
        }
    }
}

/// Spawn `command`, capture its output and enforce `timeout`.
///
/// On timeout the child is killed, `teardown` runs, and the partial output
/// is returned with `timed_out = true` and no exit code. The teardown also
/// runs if this future is dropped before completion.
///
/// # Errors
///
/// Returns the spawn error unchanged so callers can tell a missing
/// interpreter (`NotFound`) from other failures.
pub async fn run_captured(
    mut command: Command,
    timeout: Duration,
    output_cap: usize,
    teardown: Teardown,
) -> std::io::Result<CapturedRun> {
    command
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let start = Instant::now();
    let mut child = command.spawn()?;
    let pid = child.id();
    let cleanup_after_exit = teardown.after_exit();
    let mut guard = TeardownGuard::new(teardown, pid);

    let stdout_buf: SharedBuffer = Arc::new(Mutex::new(CappedBuffer::new(output_cap)));
    let stderr_buf: SharedBuffer = Arc::new(Mutex::new(CappedBuffer::new(output_cap)));

    let mut readers = Vec::with_capacity(2);
    if let Some(out) = child.stdout.take() {
        readers.push(spawn_reader(out, Arc::clone(&stdout_buf)));
    }
    if let Some(err) = child.stderr.take() {
        readers.push(spawn_reader(err, Arc::clone(&stderr_buf)));
    }

    let (exit_code, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => {
            if cleanup_after_exit {
                guard.fire().await;
            } else {
                guard.disarm();
            }
            (status.code(), false)
        }
        Ok(Err(e)) => {
            warn!("Waiting on child process failed: {}", e);
            guard.fire().await;
            (None, false)
        }
        Err(_elapsed) => {
            debug!("Child {:?} exceeded {}ms, killing", pid, timeout.as_millis());
            if let Err(e) = child.start_kill() {
                debug!("Kill after timeout failed: {}", e);
            }
            guard.fire().await;
            let _ = tokio::time::timeout(DRAIN_GRACE, child.wait()).await;
            (None, true)
        }
    };

    let drain = futures::future::join_all(readers.iter_mut());
    if tokio::time::timeout(DRAIN_GRACE, drain).await.is_err() {
        debug!("Output pipes still open after grace period, abandoning readers");
        for reader in &readers {
            reader.abort();
        }
    }

    let duration = start.elapsed();
    let stdout = snapshot(&stdout_buf);
    let stderr = snapshot(&stderr_buf);

    Ok(CapturedRun {
        stdout,
        stderr,
        exit_code,
        timed_out,
        duration,
    })
}

fn snapshot(buffer: &SharedBuffer) -> CappedBuffer {
    buffer
        .lock()
        .map(|b| b.clone())
        .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capped_buffer_truncates() {
        let mut buf = CappedBuffer::new(5);
        buf.extend(b"abc");
        assert!(!buf.truncated());
        buf.extend(b"defgh");
        assert!(buf.truncated());
        assert_eq!(buf.to_string_lossy(), "abcde");
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn test_capped_buffer_zero_cap() {
        let mut buf = CappedBuffer::new(0);
        buf.extend(b"x");
        assert!(buf.is_empty());
        assert!(buf.truncated());
    }

    #[test]
    fn test_capped_buffer_exact_fit_is_not_truncated() {
        let mut buf = CappedBuffer::new(4);
        buf.extend(b"abcd");
        assert!(!buf.truncated());
        buf.extend(b"");
        assert!(!buf.truncated());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_captured_collects_output() {
        if which::which("sh").is_err() {
            return;
        }
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo err 1>&2; exit 3"]);
        let run = run_captured(cmd, Duration::from_secs(5), 1024, Teardown::None)
            .await
            .unwrap();
        assert_eq!(run.exit_code, Some(3));
        assert!(!run.timed_out);
        assert_eq!(run.stdout.to_string_lossy().trim(), "out");
        assert_eq!(run.stderr.to_string_lossy().trim(), "err");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_captured_times_out_and_keeps_partial_output() {
        if which::which("sh").is_err() {
            return;
        }
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo started; exec sleep 5"]);
        let start = Instant::now();
        let run = run_captured(cmd, Duration::from_millis(300), 1024, Teardown::None)
            .await
            .unwrap();
        assert!(run.timed_out);
        assert_eq!(run.exit_code, None);
        assert!(run.stdout.to_string_lossy().contains("started"));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_captured_caps_output() {
        if which::which("sh").is_err() {
            return;
        }
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "i=0; while [ $i -lt 200 ]; do echo 0123456789; i=$((i+1)); done"]);
        let run = run_captured(cmd, Duration::from_secs(5), 100, Teardown::None)
            .await
            .unwrap();
        assert_eq!(run.exit_code, Some(0));
        assert_eq!(run.stdout.len(), 100);
        assert!(run.stdout.truncated());
    }

    #[tokio::test]
    async fn test_run_captured_missing_program() {
        let cmd = Command::new("definitely-not-a-real-binary-codeloop");
        let err = run_captured(cmd, Duration::from_secs(1), 16, Teardown::None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_captured_group_teardown_reaches_background_jobs() {
        if which::which("sh").is_err() || which::which("kill").is_err() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("late");
        let mut cmd = Command::new("sh");
        cmd.args(["-c", &format!("(sleep 1; touch {}) &", marker.display())])
            .process_group(0);
        let run = run_captured(cmd, Duration::from_secs(5), 1024, Teardown::ProcessGroup)
            .await
            .unwrap();
        assert_eq!(run.exit_code, Some(0));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dropping_run_tears_down_process_group() {
        if which::which("sh").is_err() || which::which("kill").is_err() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("late");
        let mut cmd = Command::new("sh");
        cmd.args(["-c", &format!("(sleep 1; touch {}) & wait", marker.display())])
            .process_group(0);

        let abandoned = tokio::time::timeout(
            Duration::from_millis(200),
            run_captured(cmd, Duration::from_secs(5), 1024, Teardown::ProcessGroup),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }
}
