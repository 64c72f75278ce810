//! Child processes with a timeout and bounded output capture.
//!
//! Commands are always spawned from an argv vector, never through a shell.

use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// How long pipe readers may run on after the child is gone. A descendant
/// that inherited stdout or stderr can hold the pipe open indefinitely.
const READER_GRACE: Duration = Duration::from_millis(500);

/// Captured outcome of one child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedOutput {
    /// `None` when the process was killed by a signal (including on timeout).
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Bytes dropped from stdout and stderr combined.
    pub truncated_bytes: usize,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl CapturedOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Last non-empty stderr line, for compact failure reasons.
    pub fn stderr_tail(&self) -> Option<&str> {
        self.stderr.lines().rev().find(|line| !line.trim().is_empty())
    }
}

/// Spawn `argv` in `workdir`, wait up to `timeout`, and capture output.
///
/// Pipes are drained on reader threads so a chatty child cannot deadlock.
/// On timeout the child's whole process group is killed; a failed kill is
/// logged, not returned. Readers get [`READER_GRACE`] after the child is gone,
/// then whatever they have is returned.
#[instrument(skip_all, fields(program = argv.first().map(String::as_str), timeout_ms = timeout.as_millis() as u64))]
pub fn run_argv(
    argv: &[String],
    workdir: &Path,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CapturedOutput> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("cannot run an empty command"))?;
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Own process group, so a timeout can take descendants down too.
        cmd.process_group(0);
    }

    let started = Instant::now();
    let mut child = cmd.spawn().map_err(|err| {
        error!(program = %program, err = %err, "failed to spawn command");
        anyhow!("spawn {program}: {err}")
    })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout_reader = PipeReader::spawn(stdout, output_limit_bytes);
    let stderr_reader = PipeReader::spawn(stderr, output_limit_bytes);

    let (status, timed_out) = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => (status, false),
        None => {
            warn!("command timed out, killing its process group");
            kill_group(&mut child);
            (child.wait().context("reap command after kill")?, true)
        }
    };
    let elapsed = started.elapsed();

    let readers_deadline = Instant::now() + READER_GRACE;
    let stdout_done = stdout_reader.wait_until(readers_deadline).context("collect stdout")?;
    let stderr_done = stderr_reader.wait_until(readers_deadline).context("collect stderr")?;
    if !(stdout_done && stderr_done) {
        warn!(pid = child.id(), "output pipes held open by descendants, abandoning readers");
        kill_group(&mut child);
    }
    let (stdout, stdout_dropped) = stdout_reader.take();
    let (stderr, stderr_dropped) = stderr_reader.take();
    let truncated_bytes = stdout_dropped + stderr_dropped;
    if truncated_bytes > 0 {
        debug!(truncated_bytes, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, elapsed_ms = elapsed.as_millis() as u64, "command finished");
    Ok(CapturedOutput {
        exit_code: status.code(),
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        truncated_bytes,
        timed_out,
        elapsed,
    })
}

/// SIGKILL the child's process group, falling back to the child alone.
fn kill_group(child: &mut Child) {
    #[cfg(unix)]
    {
        let group = format!("-{}", child.id());
        match Command::new("kill")
            .args(["-KILL", "--", &group])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) if status.success() => return,
            Ok(status) => debug!(%status, "group kill failed"),
            Err(err) => debug!(err = %err, "group kill could not run"),
        }
    }
    if let Err(err) = child.kill() {
        debug!(err = %err, "kill failed; child already exited");
    }
}

#[derive(Debug, Default)]
struct Capture {
    kept: Vec<u8>,
    dropped: usize,
}

/// Drains one pipe on its own thread into a bounded buffer.
struct PipeReader {
    capture: Arc<Mutex<Capture>>,
    done: mpsc::Receiver<Result<()>>,
}

impl PipeReader {
    fn spawn<R: Read + Send + 'static>(pipe: R, limit: usize) -> Self {
        let capture = Arc::new(Mutex::new(Capture::default()));
        let (tx, done) = mpsc::channel();
        let sink = Arc::clone(&capture);
        thread::spawn(move || {
            // The receiver is gone once the reader has been abandoned.
            let _ = tx.send(read_limited(pipe, limit, &sink));
        });
        Self { capture, done }
    }

    /// True if the pipe reached EOF before `deadline`.
    fn wait_until(&self, deadline: Instant) -> Result<bool> {
        match self
            .done
            .recv_timeout(deadline.saturating_duration_since(Instant::now()))
        {
            Ok(result) => result.map(|()| true),
            Err(RecvTimeoutError::Timeout) => Ok(false),
            Err(RecvTimeoutError::Disconnected) => Err(anyhow!("output reader thread panicked")),
        }
    }

    /// Whatever was read so far, plus the count of dropped bytes.
    fn take(&self) -> (Vec<u8>, usize) {
        let mut capture = self.capture.lock().unwrap_or_else(PoisonError::into_inner);
        (std::mem::take(&mut capture.kept), capture.dropped)
    }
}

/// Keep at most `limit` bytes, counting (but still draining) the rest.
fn read_limited<R: Read>(mut reader: R, limit: usize, capture: &Mutex<Capture>) -> Result<()> {
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            return Ok(());
        }
        let mut capture = capture.lock().unwrap_or_else(PoisonError::into_inner);
        let keep = n.min(limit.saturating_sub(capture.kept.len()));
        capture.kept.extend_from_slice(&chunk[..keep]);
        capture.dropped += n - keep;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn captures_exit_code_and_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let out = run_argv(
            &argv(&["sh", "-c", "echo hello; echo oops >&2; exit 3"]),
            temp.path(),
            Duration::from_secs(10),
            1_000,
        )
        .expect("run");
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.success());
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr_tail(), Some("oops"));
    }

    #[test]
    fn kills_on_timeout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let out = run_argv(
            &argv(&["sleep", "5"]),
            temp.path(),
            Duration::from_millis(100),
            1_000,
        )
        .expect("run");
        assert!(out.timed_out);
        assert!(!out.success());
        assert!(out.elapsed < Duration::from_secs(5));
    }

    #[test]
    fn timeout_takes_down_descendants_holding_the_pipes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let called = Instant::now();
        let out = run_argv(
            &argv(&["sh", "-c", "sleep 4; echo done"]),
            temp.path(),
            Duration::from_millis(200),
            1_000,
        )
        .expect("run");
        assert!(out.timed_out);
        assert!(called.elapsed() < Duration::from_secs(3));
        assert!(!out.stdout.contains("done"));
    }

    #[test]
    fn background_descendant_does_not_hold_the_caller() {
        let temp = tempfile::tempdir().expect("tempdir");
        let called = Instant::now();
        let out = run_argv(
            &argv(&["sh", "-c", "sleep 4 & echo started"]),
            temp.path(),
            Duration::from_secs(10),
            1_000,
        )
        .expect("run");
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "started");
        assert!(called.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn bounds_captured_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let out = run_argv(
            &argv(&["sh", "-c", "printf 'abcdefghij'"]),
            temp.path(),
            Duration::from_secs(10),
            4,
        )
        .expect("run");
        assert_eq!(out.stdout, "abcd");
        assert_eq!(out.truncated_bytes, 6);
    }

    #[test]
    fn missing_program_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = run_argv(
            &argv(&["arx-definitely-missing-binary"]),
            temp.path(),
            Duration::from_secs(1),
            10,
        )
        .unwrap_err();
        assert!(err.to_string().contains("spawn"));
        assert!(run_argv(&[], temp.path(), Duration::from_secs(1), 10).is_err());
    }
}
