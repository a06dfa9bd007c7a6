//! Docker-compatible container CLI driver
//!
//! Runs `<program> run ...` for a [`ContainerInvocation`], piping the
//! container's stdout/stderr into a build log line by line. The driver is
//! a pass-through executor: it never looks at what the build prints.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::invocation::ContainerInvocation;
use crate::supervisor::{outcome_from_status, supervise, ProcessOutcome, StopReason, SupervisorConfig};

/// Errors from the container CLI driver
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to launch `{program}`: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Driver for a docker-compatible CLI (`docker`, `podman`, ...)
#[derive(Debug, Clone)]
pub struct ContainerCli {
    program: String,
    supervisor: SupervisorConfig,
}

impl ContainerCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            supervisor: SupervisorConfig::default(),
        }
    }

    pub fn with_supervisor(mut self, supervisor: SupervisorConfig) -> Self {
        self.supervisor = supervisor;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Run a container to completion, streaming output into `log_path`.
    ///
    /// `should_stop` is polled while the container runs. When it fires the
    /// named container is killed through the CLI and the CLI process itself
    /// is terminated, so nothing is left running.
    pub fn run_logged<F>(
        &self,
        invocation: &ContainerInvocation,
        log_path: &Path,
        mut should_stop: F,
    ) -> Result<ProcessOutcome, RuntimeError>
    where
        F: FnMut() -> Option<StopReason>,
    {
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let args = invocation.run_args();
        {
            let mut log = File::create(log_path)?;
            writeln!(log, "=== crossbuild container ===")?;
            writeln!(log, "command: {} {}", self.program, args.join(" "))?;
            writeln!(log, "started_at: {}", Utc::now().to_rfc3339())?;
            writeln!(log, "=== Begin container output ===")?;
        }

        debug!(program = %self.program, args = ?args, "spawning container");
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| RuntimeError::Launch {
                program: self.program.clone(),
                source,
            })?;

        let log_file = fs::OpenOptions::new().append(true).open(log_path)?;
        let log_file = Arc::new(Mutex::new(log_file));
        let mut streams = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            streams.push(stream_lines(stdout, Arc::clone(&log_file), ""));
        }
        if let Some(stderr) = child.stderr.take() {
            streams.push(stream_lines(stderr, Arc::clone(&log_file), "[stderr] "));
        }

        let name = invocation.name.clone();
        let outcome = supervise(&mut child, &self.supervisor, || {
            let reason = should_stop()?;
            if let Some(ref name) = name {
                if let Err(e) = self.kill(name) {
                    warn!(container = %name, error = %e, "failed to kill container");
                }
            }
            Some(reason)
        })?;

        for handle in streams {
            let _ = handle.join();
        }

        if let Ok(mut log) = log_file.lock() {
            writeln!(log, "=== End container output ===")?;
            writeln!(log, "outcome: {:?}", outcome)?;
            writeln!(log, "ended_at: {}", Utc::now().to_rfc3339())?;
        }

        Ok(outcome)
    }

    /// Run a short-lived container and capture its combined output.
    pub fn run_captured(
        &self,
        invocation: &ContainerInvocation,
    ) -> Result<(ProcessOutcome, String), RuntimeError> {
        let args = invocation.run_args();
        debug!(program = %self.program, args = ?args, "running container");

        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| RuntimeError::Launch {
                program: self.program.clone(),
                source,
            })?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok((outcome_from_status(output.status), text))
    }

    /// Kill a running container by name. A missing container is not an error.
    pub fn kill(&self, name: &str) -> Result<(), RuntimeError> {
        let status = Command::new(&self.program)
            .args(["kill", name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|source| RuntimeError::Launch {
                program: self.program.clone(),
                source,
            })?;

        if !status.success() {
            debug!(container = %name, "kill reported container not running");
        }
        Ok(())
    }
}

fn stream_lines<R>(reader: R, log: Arc<Mutex<File>>, prefix: &'static str) -> JoinHandle<()>
where
    R: io::Read + Send + 'static,
{
    std::thread::spawn(move || {
        // Drain to EOF regardless of encoding
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&line);
                    if let Ok(mut f) = log.lock() {
                        let _ = writeln!(f, "{}{}", prefix, text.trim_end_matches(['\n', '\r']));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    })
}
