//! Build jobs
//!
//! A [`BuildJob`] is one matrix entry in flight: the entry, its prepared
//! workspace, the image and entrypoint, and its state. The job_key is the
//! SHA-256 of the RFC 8785 (JCS) form of the build inputs, so two runs with
//! the same inputs report the same key.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

use crate::matrix::PlatformEntry;
use crate::state::{JobState, JobStateData, JobStateError};
use crate::workspace::WorkspacePaths;

/// Generate a run_id (ULID, lowercase so it is valid in container names)
pub fn generate_run_id() -> String {
    ulid::Ulid::new().to_string().to_lowercase()
}

pub fn generate_job_id() -> String {
    ulid::Ulid::new().to_string().to_lowercase()
}

/// `crossbuild-<run_id>-<platform_slug>`
pub fn container_name(run_id: &str, entry: &PlatformEntry) -> String {
    format!("crossbuild-{}-{}", run_id, entry.platform_slug())
}

/// Identifiers must be filesystem- and container-name-safe:
/// `^[A-Za-z0-9][A-Za-z0-9_-]{9,63}$`
pub fn validate_identifier(id: &str) -> Result<(), JobError> {
    if id.len() < 10 || id.len() > 64 {
        return Err(JobError::InvalidIdentifier(format!(
            "identifier must be 10-64 characters, got {}",
            id.len()
        )));
    }
    let mut chars = id.chars();
    if !chars.next().is_some_and(|c| c.is_ascii_alphanumeric()) {
        return Err(JobError::InvalidIdentifier(
            "identifier must start with an alphanumeric character".to_string(),
        ));
    }
    if let Some(c) = chars.find(|c| !c.is_ascii_alphanumeric() && *c != '_' && *c != '-') {
        return Err(JobError::InvalidIdentifier(format!(
            "identifier contains invalid character: {:?}",
            c
        )));
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("JCS canonicalization error: {0}")]
    JcsError(String),

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error(transparent)]
    State(#[from] JobStateError),
}

/// Output-affecting inputs of one build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobKeyInputs {
    pub platform: String,
    pub arch: String,
    pub image: String,
    pub entrypoint: String,
    pub env: BTreeMap<String, String>,
}

impl JobKeyInputs {
    /// job_key = SHA-256 hex digest of JCS(inputs)
    pub fn compute_job_key(&self) -> Result<String, JobError> {
        let jcs_bytes = serde_json_canonicalizer::to_vec(self)
            .map_err(|e| JobError::JcsError(e.to_string()))?;
        let mut hasher = Sha256::new();
        hasher.update(&jcs_bytes);
        Ok(hex::encode(hasher.finalize()))
    }
}

/// One entry's build
#[derive(Debug, Clone)]
pub struct BuildJob {
    pub job_id: String,
    pub run_id: String,
    pub entry: PlatformEntry,
    pub workspace: WorkspacePaths,
    pub image: String,
    /// Entrypoint script on the host
    pub entrypoint: PathBuf,
    pub container_name: String,
    state: JobStateData,
}

impl BuildJob {
    pub fn new(
        run_id: &str,
        entry: PlatformEntry,
        workspace: WorkspacePaths,
        image: impl Into<String>,
        entrypoint: impl Into<PathBuf>,
    ) -> Self {
        let job_id = generate_job_id();
        let state = JobStateData::new(run_id.to_string(), job_id.clone(), entry.platform.clone());
        Self {
            container_name: container_name(run_id, &entry),
            job_id,
            run_id: run_id.to_string(),
            entry,
            workspace,
            image: image.into(),
            entrypoint: entrypoint.into(),
            state,
        }
    }

    pub fn state(&self) -> JobState {
        self.state.state
    }

    /// Workspace root mounted into the container
    pub fn source_root(&self) -> &Path {
        &self.workspace.root
    }

    /// Apply a transition and persist `job_state.json` in the job directory.
    ///
    /// A failed write is logged; the in-memory state is authoritative.
    pub fn transition(&mut self, state: JobState) -> Result<(), JobError> {
        self.state.transition(state)?;
        if let Err(e) = self.state.write_to_job_dir(&self.workspace.job_dir) {
            warn!(job_id = %self.job_id, error = %e, "failed to persist job state");
        }
        Ok(())
    }

    pub fn key_inputs(&self, env: &BTreeMap<String, String>) -> JobKeyInputs {
        JobKeyInputs {
            platform: self.entry.platform.clone(),
            arch: self.entry.arch.clone(),
            image: self.image.clone(),
            entrypoint: self.entrypoint.to_string_lossy().into_owned(),
            env: env.clone(),
        }
    }
}
