//! Containerized build runner
//!
//! Runs one [`BuildJob`] inside the build-environment image with the
//! entry's platform constraint. The source tree is mounted read-write, the
//! entrypoint read-only, and the container's exit status is passed through
//! unchanged. Build output goes to the job's log; nothing here parses it.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crossbuild_runtime::{
    ContainerCli, ContainerInvocation, Mount, ProcessOutcome, RuntimeError, StopReason,
    SupervisorConfig,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::job::{BuildJob, JobError};
use crate::signal::CancellationCoordinator;
use crate::state::JobState;
use crate::timeout::{TimeoutConfig, TimeoutEnforcer};
use crate::workspace::{WorkspaceError, WorkspacePaths};

pub const DEFAULT_SOURCE_MOUNT: &str = "/src";
pub const DEFAULT_ENTRYPOINT_MOUNT: &str = "/entrypoint.sh";

/// Launches containers and waits for them
pub trait ContainerRuntime: Send + Sync {
    fn name(&self) -> &str;

    /// Run `invocation` to completion, writing output to `log_path`.
    ///
    /// `should_stop` is polled while the container runs; once it returns a
    /// reason the container must be terminated and
    /// `ProcessOutcome::Stopped(reason)` returned.
    fn run(
        &self,
        invocation: &ContainerInvocation,
        log_path: &Path,
        should_stop: &mut dyn FnMut() -> Option<StopReason>,
    ) -> Result<ProcessOutcome, RuntimeError>;
}

/// Production runtime over a docker-compatible CLI
#[derive(Debug, Clone)]
pub struct CliContainerRuntime {
    cli: ContainerCli,
}

impl CliContainerRuntime {
    pub fn new(program: &str, timeout: &TimeoutConfig) -> Self {
        let supervisor =
            SupervisorConfig::default().with_termination_grace(timeout.termination_grace());
        Self {
            cli: ContainerCli::new(program).with_supervisor(supervisor),
        }
    }

    pub fn cli(&self) -> &ContainerCli {
        &self.cli
    }
}

impl ContainerRuntime for CliContainerRuntime {
    fn name(&self) -> &str {
        self.cli.program()
    }

    fn run(
        &self,
        invocation: &ContainerInvocation,
        log_path: &Path,
        should_stop: &mut dyn FnMut() -> Option<StopReason>,
    ) -> Result<ProcessOutcome, RuntimeError> {
        self.cli.run_logged(invocation, log_path, should_stop)
    }
}

/// `[runtime]` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSettings {
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default = "default_source_mount")]
    pub source_mount: String,
    #[serde(default = "default_entrypoint_mount")]
    pub entrypoint_mount: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_program() -> String {
    "docker".to_string()
}

fn default_source_mount() -> String {
    DEFAULT_SOURCE_MOUNT.to_string()
}

fn default_entrypoint_mount() -> String {
    DEFAULT_ENTRYPOINT_MOUNT.to_string()
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            program: default_program(),
            source_mount: default_source_mount(),
            entrypoint_mount: default_entrypoint_mount(),
            env: BTreeMap::new(),
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("build exited with code {exit_code}")]
    BuildFailed { exit_code: i32 },

    #[error("build timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("container launch failed: {0}")]
    LaunchFailed(String),

    #[error("build cancelled")]
    Cancelled,

    #[error("workspace preparation failed: {0}")]
    Workspace(#[from] WorkspaceError),
}

impl From<JobError> for BuildError {
    fn from(e: JobError) -> Self {
        BuildError::LaunchFailed(e.to_string())
    }
}

/// Runs builds for one run
#[derive(Clone)]
pub struct ContainerBuildRunner {
    runtime: Arc<dyn ContainerRuntime>,
    settings: RuntimeSettings,
    timeout: TimeoutConfig,
    cancel: CancellationCoordinator,
}

impl ContainerBuildRunner {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        settings: RuntimeSettings,
        timeout: TimeoutConfig,
        cancel: CancellationCoordinator,
    ) -> Self {
        Self {
            runtime,
            settings,
            timeout,
            cancel,
        }
    }

    /// The exact container invocation for `job`
    pub fn invocation(&self, job: &BuildJob) -> ContainerInvocation {
        let mut invocation = ContainerInvocation::new(&job.image)
            .with_name(&job.container_name)
            .with_platform(&job.entry.platform)
            .with_mount(Mount::read_write(
                job.source_root(),
                &self.settings.source_mount,
            ))
            .with_mount(Mount::read_only(
                &job.entrypoint,
                &self.settings.entrypoint_mount,
            ))
            .with_workdir(&self.settings.source_mount)
            .with_env("CROSSBUILD_ARCH", &job.entry.arch)
            .with_env("CROSSBUILD_PLATFORM", &job.entry.platform);

        for (key, value) in &self.settings.env {
            invocation = invocation.with_env(key, value);
        }

        invocation
            .with_extra_args(self.settings.extra_args.iter().cloned())
            .with_command([self.settings.entrypoint_mount.clone()])
    }

    /// Run `job` to completion.
    ///
    /// On a zero exit the job is Succeeded and its workspace is returned for
    /// collection. Any other outcome leaves the job Failed or Cancelled.
    pub fn run(&self, job: &mut BuildJob) -> Result<WorkspacePaths, BuildError> {
        if self.cancel.is_cancelled() {
            job.transition(JobState::Cancelled)?;
            return Err(BuildError::Cancelled);
        }

        job.transition(JobState::Running)?;
        let invocation = self.invocation(job);
        let enforcer = TimeoutEnforcer::new(&self.timeout);
        info!(
            platform = %job.entry.platform,
            arch = %job.entry.arch,
            container = %job.container_name,
            runtime = self.runtime.name(),
            "starting build"
        );

        self.cancel.register_container(&job.container_name);
        let cancel = self.cancel.clone();
        let result = self.runtime.run(&invocation, &job.workspace.log_path, &mut || {
            if cancel.is_cancelled() {
                Some(StopReason::Cancelled)
            } else if enforcer.check().is_timeout() {
                Some(StopReason::Timeout)
            } else {
                None
            }
        });
        self.cancel.unregister_container(&job.container_name);

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(platform = %job.entry.platform, error = %e, "container launch failed");
                job.transition(JobState::Failed)?;
                return Err(BuildError::LaunchFailed(e.to_string()));
            }
        };

        match outcome {
            ProcessOutcome::Exited { code: 0, .. } => {
                info!(platform = %job.entry.platform, elapsed_ms = enforcer.elapsed().as_millis() as u64, "build succeeded");
                job.transition(JobState::Succeeded)?;
                Ok(job.workspace.clone())
            }
            ProcessOutcome::Exited { code, .. } => {
                warn!(platform = %job.entry.platform, exit_code = code, "build failed");
                job.transition(JobState::Failed)?;
                Err(BuildError::BuildFailed { exit_code: code })
            }
            ProcessOutcome::Stopped(StopReason::Timeout) => {
                let seconds = enforcer.limit_seconds().unwrap_or_default();
                warn!(platform = %job.entry.platform, seconds, "build timed out");
                job.transition(JobState::Failed)?;
                Err(BuildError::Timeout { seconds })
            }
            ProcessOutcome::Stopped(StopReason::Cancelled) => {
                info!(platform = %job.entry.platform, "build cancelled");
                job.transition(JobState::Cancelled)?;
                Err(BuildError::Cancelled)
            }
        }
    }
}
