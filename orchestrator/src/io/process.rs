//! Helpers for running child processes with timeouts and bounded output.

use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// How long to wait for output readers after the child was killed. A killed
/// shell may leave grandchildren holding the pipes open.
const KILL_DRAIN_GRACE: Duration = Duration::from_millis(100);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

type StreamResult = Result<(Vec<u8>, usize)>;

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
/// On timeout the child is killed and `timed_out` is set. A child that exits in time but leaves
/// a descendant holding its output pipes past the deadline is also reported as `timed_out`; the
/// descendant is not killed, its readers are abandoned.
#[instrument(skip_all, fields(timeout_ms = timeout.as_millis() as u64, output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!(program = ?cmd.get_program(), "spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let deadline = Instant::now() + timeout;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_rx = spawn_reader(stdout, output_limit_bytes);
    let stderr_rx = spawn_reader(stderr, output_limit_bytes);

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_ms = timeout.as_millis() as u64,
                "command timed out, killing"
            );
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    // Readers share the deadline: a descendant holding the pipes open past it
    // counts as a timeout. After a kill only the grace period applies.
    let drain = |rx: &Receiver<StreamResult>, killed: bool| {
        let wait = if killed {
            KILL_DRAIN_GRACE
        } else {
            deadline
                .saturating_duration_since(Instant::now())
                .max(KILL_DRAIN_GRACE)
        };
        collect_output(rx, wait)
    };
    let stdout_part = drain(&stdout_rx, timed_out).context("stdout")?;
    let stderr_part = drain(&stderr_rx, timed_out).context("stderr")?;
    if !timed_out && (stdout_part.is_none() || stderr_part.is_none()) {
        warn!(
            timeout_ms = timeout.as_millis() as u64,
            "output held open past timeout, abandoning readers"
        );
        timed_out = true;
    }
    let (stdout, stdout_truncated) = stdout_part.unwrap_or_default();
    let (stderr, stderr_truncated) = stderr_part.unwrap_or_default();

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

fn spawn_reader<R: Read + Send + 'static>(reader: R, limit: usize) -> Receiver<StreamResult> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        // The receiver may be gone if the caller stopped waiting.
        let _ = tx.send(read_stream_limited(reader, limit));
    });
    rx
}

/// Wait up to `wait` for a reader. `None` means it is still blocked on a pipe
/// some other process holds open; the reader thread is left behind.
fn collect_output(rx: &Receiver<StreamResult>, wait: Duration) -> Result<Option<(Vec<u8>, usize)>> {
    match rx.recv_timeout(wait) {
        Ok(result) => result.map(Some),
        Err(RecvTimeoutError::Timeout) => {
            debug!("output still held open, abandoning reader");
            Ok(None)
        }
        Err(RecvTimeoutError::Disconnected) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> StreamResult {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
