//! Child process supervision
//!
//! Waits for a spawned process while polling a caller-supplied stop
//! condition. The supervisor never imposes a deadline of its own: a build
//! runs until it exits unless the stop condition fires (timeout or
//! cancellation decided by the caller).

use std::io;
use std::process::{Child, ExitStatus};
use std::time::{Duration, Instant};

use tracing::debug;

/// Default interval between exit/stop checks
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// Default grace period between SIGTERM and SIGKILL
pub const DEFAULT_TERMINATION_GRACE_SECONDS: u64 = 10;

/// Why the supervisor stopped a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The caller's deadline expired
    Timeout,
    /// The run was cancelled
    Cancelled,
}

/// How a supervised process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The process exited on its own.
    ///
    /// A process killed by a signal reports `128 + signo` as its code,
    /// matching shell conventions.
    Exited { code: i32, signal: Option<i32> },
    /// The process was terminated because the stop condition fired
    Stopped(StopReason),
}

impl ProcessOutcome {
    /// True for a clean zero exit
    pub fn is_success(&self) -> bool {
        matches!(self, ProcessOutcome::Exited { code: 0, .. })
    }
}

/// Supervisor tuning
#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
    /// Interval between exit/stop checks
    pub poll_interval: Duration,
    /// Grace period between SIGTERM and SIGKILL
    pub termination_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            termination_grace: Duration::from_secs(DEFAULT_TERMINATION_GRACE_SECONDS),
        }
    }
}

impl SupervisorConfig {
    pub fn with_termination_grace(mut self, grace: Duration) -> Self {
        self.termination_grace = grace;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Wait for `child`, checking `should_stop` between polls.
///
/// When `should_stop` returns a reason the child is terminated and
/// [`ProcessOutcome::Stopped`] is returned.
pub fn supervise<F>(
    child: &mut Child,
    config: &SupervisorConfig,
    mut should_stop: F,
) -> io::Result<ProcessOutcome>
where
    F: FnMut() -> Option<StopReason>,
{
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(outcome_from_status(status));
        }

        if let Some(reason) = should_stop() {
            debug!(pid = child.id(), ?reason, "stopping supervised process");
            terminate(child, config.termination_grace)?;
            return Ok(ProcessOutcome::Stopped(reason));
        }

        std::thread::sleep(config.poll_interval);
    }
}

/// Terminate a child process gracefully then forcefully.
pub fn terminate(child: &mut Child, grace: Duration) -> io::Result<()> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        let pid = Pid::from_raw(child.id() as i32);
        let _ = signal::kill(pid, Signal::SIGTERM);
    }
    #[cfg(not(unix))]
    {
        let _ = child.kill();
    }

    let start = Instant::now();
    while start.elapsed() < grace {
        match child.try_wait()? {
            Some(_) => return Ok(()),
            None => std::thread::sleep(Duration::from_millis(50)),
        }
    }

    let _ = child.kill();
    let _ = child.wait();

    Ok(())
}

/// Map an exit status, reporting signal deaths as `128 + signo`
pub(crate) fn outcome_from_status(status: ExitStatus) -> ProcessOutcome {
    if let Some(code) = status.code() {
        return ProcessOutcome::Exited { code, signal: None };
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return ProcessOutcome::Exited {
                code: 128 + sig,
                signal: Some(sig),
            };
        }
    }

    ProcessOutcome::Exited {
        code: -1,
        signal: None,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Command;

    fn fast() -> SupervisorConfig {
        SupervisorConfig::default()
            .with_poll_interval(Duration::from_millis(10))
            .with_termination_grace(Duration::from_secs(2))
    }

    #[test]
    fn test_zero_exit() {
        let mut child = Command::new("sh").args(["-c", "exit 0"]).spawn().unwrap();
        let outcome = supervise(&mut child, &fast(), || None).unwrap();
        assert!(outcome.is_success());
    }

    #[test]
    fn test_nonzero_exit_is_passed_through() {
        let mut child = Command::new("sh").args(["-c", "exit 3"]).spawn().unwrap();
        let outcome = supervise(&mut child, &fast(), || None).unwrap();
        assert_eq!(outcome, ProcessOutcome::Exited { code: 3, signal: None });
        assert!(!outcome.is_success());
    }

    #[test]
    fn test_stop_condition_terminates_child() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let start = Instant::now();
        let mut polls = 0;
        let outcome = supervise(&mut child, &fast(), || {
            polls += 1;
            if polls >= 3 {
                Some(StopReason::Cancelled)
            } else {
                None
            }
        })
        .unwrap();

        assert_eq!(outcome, ProcessOutcome::Stopped(StopReason::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(10));
        // Child must be reaped
        assert!(child.try_wait().unwrap().is_some());
    }

    #[test]
    fn test_signal_exit_maps_to_shell_code() {
        let mut child = Command::new("sh").args(["-c", "kill -9 $$"]).spawn().unwrap();
        let outcome = supervise(&mut child, &fast(), || None).unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::Exited {
                code: 137,
                signal: Some(9)
            }
        );
    }
}
