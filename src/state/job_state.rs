//! Build job state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

use super::{next_seq, now_utc, TerminalState};

/// Schema version for job_state.json
pub const SCHEMA_VERSION: u32 = 1;

pub const SCHEMA_ID: &str = "crossbuild/job_state@1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Created, container not launched yet
    Pending,
    /// Container is running
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TerminalState for JobState {
    /// `Succeeded` counts as terminal for the build even though a later
    /// stage may still downgrade it to `Failed`.
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }
}

impl JobState {
    pub fn can_transition_to(&self, target: JobState) -> bool {
        match (self, target) {
            (JobState::Pending, JobState::Running) => true,
            (JobState::Pending, JobState::Cancelled) => true,
            // Workspace preparation can fail before launch
            (JobState::Pending, JobState::Failed) => true,

            (JobState::Running, JobState::Succeeded) => true,
            (JobState::Running, JobState::Failed) => true,
            (JobState::Running, JobState::Cancelled) => true,

            // Missing artifact or publish failure after a clean exit
            (JobState::Succeeded, JobState::Failed) => true,

            _ => false,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Persisted job state (job_state.json)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStateData {
    pub schema_version: u32,
    pub schema_id: String,
    pub run_id: String,
    pub job_id: String,
    /// Platform tag of the matrix entry
    pub platform: String,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Monotonic sequence counter for ordering
    pub seq: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum JobStateError {
    #[error("invalid job state transition from {from:?} to {to:?}")]
    InvalidTransition { from: JobState, to: JobState },

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl JobStateData {
    /// New job in PENDING state
    pub fn new(run_id: String, job_id: String, platform: String) -> Self {
        let now = now_utc();
        Self {
            schema_version: SCHEMA_VERSION,
            schema_id: SCHEMA_ID.to_string(),
            run_id,
            job_id,
            platform,
            state: JobState::Pending,
            created_at: now,
            updated_at: now,
            seq: next_seq(),
        }
    }

    pub fn transition(&mut self, new_state: JobState) -> Result<(), JobStateError> {
        if !self.state.can_transition_to(new_state) {
            return Err(JobStateError::InvalidTransition {
                from: self.state,
                to: new_state,
            });
        }

        self.state = new_state;
        self.updated_at = now_utc();
        self.seq = next_seq();

        Ok(())
    }

    pub fn start(&mut self) -> Result<(), JobStateError> {
        self.transition(JobState::Running)
    }

    pub fn succeed(&mut self) -> Result<(), JobStateError> {
        self.transition(JobState::Succeeded)
    }

    pub fn fail(&mut self) -> Result<(), JobStateError> {
        self.transition(JobState::Failed)
    }

    pub fn cancel(&mut self) -> Result<(), JobStateError> {
        self.transition(JobState::Cancelled)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Write atomically (write-then-rename)
    pub fn write_to_file(&self, path: &Path) -> Result<(), JobStateError> {
        let json = self.to_json()?;
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, &json)?;
        fs::rename(&temp_path, path)?;
        Ok(())
    }

    pub fn from_file(path: &Path) -> Result<Self, JobStateError> {
        let json = fs::read_to_string(path)?;
        Ok(Self::from_json(&json)?)
    }

    /// Write `<job_dir>/job_state.json`
    pub fn write_to_job_dir(&self, job_dir: &Path) -> Result<(), JobStateError> {
        fs::create_dir_all(job_dir)?;
        self.write_to_file(&job_dir.join("job_state.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn job() -> JobStateData {
        JobStateData::new(
            "run-1".to_string(),
            "job-1".to_string(),
            "linux/amd64".to_string(),
        )
    }

    #[test]
    fn test_new_job_is_pending() {
        let state = job();
        assert_eq!(state.state, JobState::Pending);
        assert_eq!(state.platform, "linux/amd64");
        assert!(!state.is_terminal());
    }

    #[test]
    fn test_build_success_path() {
        let mut state = job();
        state.start().unwrap();
        assert_eq!(state.state, JobState::Running);
        state.succeed().unwrap();
        assert_eq!(state.state, JobState::Succeeded);
    }

    #[test]
    fn test_succeeded_downgrades_to_failed() {
        let mut state = job();
        state.start().unwrap();
        state.succeed().unwrap();
        assert!(state.fail().is_ok());
        assert_eq!(state.state, JobState::Failed);
    }

    #[test]
    fn test_succeeded_cannot_be_cancelled() {
        let mut state = job();
        state.start().unwrap();
        state.succeed().unwrap();
        assert!(state.cancel().is_err());
    }

    #[test]
    fn test_pending_cannot_succeed() {
        let mut state = job();
        let err = state.succeed().unwrap_err();
        assert!(matches!(
            err,
            JobStateError::InvalidTransition {
                from: JobState::Pending,
                to: JobState::Succeeded
            }
        ));
    }

    #[test]
    fn test_cancel_from_pending_and_running() {
        let mut pending = job();
        assert!(pending.cancel().is_ok());

        let mut running = job();
        running.start().unwrap();
        assert!(running.cancel().is_ok());
        assert!(running.is_terminal());
        assert!(running.start().is_err());
    }

    #[test]
    fn test_failed_is_final() {
        let mut state = job();
        state.fail().unwrap();
        assert!(state.start().is_err());
        assert!(state.succeed().is_err());
    }

    #[test]
    fn test_seq_advances_on_transition() {
        let mut state = job();
        let before = state.seq;
        state.start().unwrap();
        assert!(state.seq > before);
    }

    #[test]
    fn test_serialization_uses_screaming_case() {
        let json = job().to_json().unwrap();
        assert!(json.contains("\"state\": \"PENDING\""));
        assert!(json.contains("\"schema_id\": \"crossbuild/job_state@1\""));
    }

    #[test]
    fn test_write_to_job_dir() {
        let dir = TempDir::new().unwrap();
        let mut state = job();
        state.start().unwrap();
        let job_dir = dir.path().join("linux-amd64");
        state.write_to_job_dir(&job_dir).unwrap();

        let loaded = JobStateData::from_file(&job_dir.join("job_state.json")).unwrap();
        assert_eq!(loaded.state, JobState::Running);
        assert_eq!(loaded.job_id, "job-1");
        assert!(!job_dir.join("job_state.tmp").exists());
    }
}
