//! Foreign-architecture emulation provisioning
//!
//! Registering emulation (binfmt_misc handlers on Linux) is a run-wide
//! precondition. The backend call happens at most once per run behind a
//! [`ProvisionBarrier`]; every caller after the first observes the cached
//! result, including a cached failure.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crossbuild_runtime::{ContainerCli, ContainerInvocation, ProcessOutcome};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::matrix::normalize_arch;

pub const DEFAULT_BINFMT_IMAGE: &str = "tonistiigi/binfmt:latest";

/// Output kept in a registration error
const OUTPUT_TAIL_BYTES: usize = 2048;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ProvisionError {
    #[error("emulation registration exited with {exit_code}: {output}")]
    RegistrationFailed { exit_code: i32, output: String },

    #[error("emulation backend unavailable: {0}")]
    Backend(String),
}

/// One-shot "enable foreign architecture execution" call
pub trait EmulationBackend: Send + Sync {
    fn name(&self) -> &str;

    fn register(&self) -> Result<(), ProvisionError>;
}

/// Registers QEMU binfmt handlers by running the binfmt installer image
#[derive(Debug, Clone)]
pub struct BinfmtEmulation {
    cli: ContainerCli,
    image: String,
}

impl BinfmtEmulation {
    pub fn new(cli: ContainerCli, image: impl Into<String>) -> Self {
        Self {
            cli,
            image: image.into(),
        }
    }

    pub fn invocation(&self) -> ContainerInvocation {
        ContainerInvocation::new(&self.image)
            .privileged(true)
            .with_command(["--install".to_string(), "all".to_string()])
    }
}

impl EmulationBackend for BinfmtEmulation {
    fn name(&self) -> &str {
        "binfmt"
    }

    fn register(&self) -> Result<(), ProvisionError> {
        let (outcome, output) = self
            .cli
            .run_captured(&self.invocation())
            .map_err(|e| ProvisionError::Backend(e.to_string()))?;

        match outcome {
            ProcessOutcome::Exited { code: 0, .. } => Ok(()),
            ProcessOutcome::Exited { code, .. } => Err(ProvisionError::RegistrationFailed {
                exit_code: code,
                output: tail(&output),
            }),
            ProcessOutcome::Stopped(reason) => {
                Err(ProvisionError::Backend(format!("registration stopped: {:?}", reason)))
            }
        }
    }
}

fn tail(output: &str) -> String {
    let trimmed = output.trim();
    if trimmed.len() <= OUTPUT_TAIL_BYTES {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - OUTPUT_TAIL_BYTES;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}

/// When to register emulation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmulationPolicy {
    /// Only when some enabled arch differs from the host arch
    #[default]
    Auto,
    Always,
    Never,
}

/// `[emulation]` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmulationSettings {
    #[serde(default)]
    pub mode: EmulationPolicy,
    #[serde(default = "default_image")]
    pub image: String,
}

fn default_image() -> String {
    DEFAULT_BINFMT_IMAGE.to_string()
}

impl Default for EmulationSettings {
    fn default() -> Self {
        Self {
            mode: EmulationPolicy::default(),
            image: default_image(),
        }
    }
}

/// Single-use initialization barrier
///
/// Concurrent callers block until the first initializer finishes, then all
/// see its result.
#[derive(Debug, Default)]
pub struct ProvisionBarrier {
    cell: OnceLock<Result<(), ProvisionError>>,
}

impl ProvisionBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_init<F>(&self, init: F) -> Result<(), ProvisionError>
    where
        F: FnOnce() -> Result<(), ProvisionError>,
    {
        self.cell.get_or_init(init).clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.get().is_some()
    }
}

/// What provisioning did for a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionSummary {
    pub policy: EmulationPolicy,
    pub host_arch: String,
    /// Distinct enabled arches that need emulation
    pub foreign_arches: Vec<String>,
    /// The backend was invoked
    pub registered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Run-scoped provisioner
pub struct EmulationProvisioner {
    backend: Arc<dyn EmulationBackend>,
    policy: EmulationPolicy,
    host_arch: String,
    barrier: ProvisionBarrier,
    calls: AtomicUsize,
}

impl EmulationProvisioner {
    pub fn new(backend: Arc<dyn EmulationBackend>, policy: EmulationPolicy) -> Self {
        Self::with_host_arch(backend, policy, crate::matrix::host_arch())
    }

    pub fn with_host_arch(
        backend: Arc<dyn EmulationBackend>,
        policy: EmulationPolicy,
        host_arch: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            policy,
            host_arch: host_arch.into(),
            barrier: ProvisionBarrier::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn needs_emulation(&self, arch: &str) -> bool {
        match self.policy {
            EmulationPolicy::Auto => normalize_arch(arch) != normalize_arch(&self.host_arch),
            EmulationPolicy::Always => true,
            EmulationPolicy::Never => false,
        }
    }

    /// Make sure `arch` can execute. Idempotent.
    pub fn ensure(&self, arch: &str) -> Result<(), ProvisionError> {
        if !self.needs_emulation(arch) {
            debug!(arch, host_arch = %self.host_arch, "no emulation needed");
            return Ok(());
        }
        self.barrier.get_or_init(|| {
            self.calls.fetch_add(1, Ordering::SeqCst);
            info!(backend = self.backend.name(), arch, "registering emulation");
            self.backend.register()
        })
    }

    /// Provision for every distinct arch of a run, stopping at the first error.
    pub fn ensure_all(&self, arches: &[String]) -> ProvisionSummary {
        let foreign_arches: Vec<String> = arches
            .iter()
            .filter(|a| self.needs_emulation(a))
            .cloned()
            .collect();

        let error = arches
            .iter()
            .find_map(|arch| self.ensure(arch).err())
            .map(|e| e.to_string());

        ProvisionSummary {
            policy: self.policy,
            host_arch: self.host_arch.clone(),
            foreign_arches,
            registered: self.registration_count() > 0,
            error,
        }
    }

    /// Number of backend invocations so far (0 or 1)
    pub fn registration_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}
