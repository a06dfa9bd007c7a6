//! Container runtime plumbing for crossbuild-lane
//!
//! This crate wraps a docker-compatible container CLI (docker, podman).
//! It knows how to:
//! - Render a [`ContainerInvocation`] into `run` arguments (platform
//!   constraint, volume mounts, working directory, entrypoint)
//! - Spawn the CLI, stream its output to a build log, and supervise the
//!   process until it exits or the caller asks it to stop
//! - Terminate a container gracefully then forcefully
//!
//! It does not interpret build output and has no notion of matrices,
//! artifacts, or bundles. Those live in the `crossbuild-lane` crate.

pub mod cli;
pub mod invocation;
pub mod supervisor;

pub use cli::{ContainerCli, RuntimeError};
pub use invocation::{ContainerInvocation, Mount, MountMode};
pub use supervisor::{
    supervise, terminate, ProcessOutcome, StopReason, SupervisorConfig,
    DEFAULT_POLL_INTERVAL_MS, DEFAULT_TERMINATION_GRACE_SECONDS,
};
