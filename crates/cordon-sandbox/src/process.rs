//! Child process supervision: bounded output capture, wall-clock timeout and
//! process-group kill.

use std::io;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::Notify;
use tracing::debug;

/// How a supervised child finished
#[derive(Debug)]
pub(crate) enum ProcessOutcome {
    Exited(ExitStatus),
    TimedOut,
    OutputLimit,
}

#[derive(Debug)]
pub(crate) struct Captured {
    pub outcome: ProcessOutcome,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

/// Byte budget shared between stdout and stderr
struct OutputBudget {
    remaining: AtomicUsize,
    exceeded: Notify,
}

impl OutputBudget {
    fn new(cap: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(cap),
            exceeded: Notify::new(),
        }
    }

    /// Reserve up to `n` bytes, returning how many were granted
    fn take(&self, n: usize) -> usize {
        let prev = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |r| Some(r.saturating_sub(n)))
            .unwrap_or(0);
        prev.min(n)
    }
}

async fn read_capped<R: AsyncRead + Unpin>(reader: Option<R>, buf: &mut Vec<u8>, budget: &OutputBudget) {
    let Some(mut reader) = reader else { return };
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let granted = budget.take(n);
                buf.extend_from_slice(&chunk[..granted]);
                if granted < n {
                    budget.exceeded.notify_one();
                    break;
                }
            }
        }
    }
}

/// Drive a spawned child to completion, killing its whole process group on
/// timeout or when combined output passes `max_output` bytes.
pub(crate) async fn supervise(mut child: Child, timeout: Duration, max_output: usize) -> io::Result<Captured> {
    let started = Instant::now();
    let pid = child.id();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let budget = OutputBudget::new(max_output);
    let mut out = Vec::new();
    let mut err = Vec::new();

    let outcome = {
        let run = async {
            tokio::join!(
                read_capped(stdout, &mut out, &budget),
                read_capped(stderr, &mut err, &budget)
            );
            child.wait().await
        };
        tokio::select! {
            status = run => ProcessOutcome::Exited(status?),
            _ = tokio::time::sleep(timeout) => ProcessOutcome::TimedOut,
            _ = budget.exceeded.notified() => ProcessOutcome::OutputLimit,
        }
    };

    if !matches!(outcome, ProcessOutcome::Exited(_)) {
        debug!(?pid, ?outcome, "terminating child process group");
        kill_process_group(pid);
        let _ = child.start_kill();
        let _ = tokio::time::timeout(Duration::from_secs(2), child.wait()).await;
    }

    Ok(Captured {
        outcome,
        stdout: String::from_utf8_lossy(&out).into_owned(),
        stderr: String::from_utf8_lossy(&err).into_owned(),
        elapsed: started.elapsed(),
    })
}

/// SIGKILL every process in the child's group. Children are spawned as group
/// leaders so grandchildren die with them.
pub(crate) fn kill_process_group(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }
    #[cfg(not(unix))]
    let _ = pid;
}

/// Exit code, mapping signal deaths to the shell convention `128 + signo`
pub(crate) fn exit_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}
