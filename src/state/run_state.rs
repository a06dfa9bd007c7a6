//! Run state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

use super::{next_seq, now_utc, TerminalState};

/// Schema version for run_state.json
pub const SCHEMA_VERSION: u32 = 1;

pub const SCHEMA_ID: &str = "crossbuild/run_state@1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Pending,
    /// Registering emulation before any entry starts
    Provisioning,
    /// Entries are being processed
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TerminalState for RunState {
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Succeeded | RunState::Failed | RunState::Cancelled
        )
    }
}

impl RunState {
    pub fn can_transition_to(&self, target: RunState) -> bool {
        match (self, target) {
            (RunState::Pending, RunState::Provisioning) => true,
            (RunState::Pending, RunState::Cancelled) => true,
            (RunState::Pending, RunState::Failed) => true,

            // A provisioning failure aborts the run
            (RunState::Provisioning, RunState::Running) => true,
            (RunState::Provisioning, RunState::Failed) => true,
            (RunState::Provisioning, RunState::Cancelled) => true,

            (RunState::Running, RunState::Succeeded) => true,
            (RunState::Running, RunState::Failed) => true,
            (RunState::Running, RunState::Cancelled) => true,

            _ => false,
        }
    }
}

/// Persisted run state (run_state.json)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStateData {
    pub schema_version: u32,
    pub schema_id: String,
    pub run_id: String,
    pub state: RunState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Enabled entries in this run
    pub entry_count: usize,
    pub seq: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum RunStateError {
    #[error("invalid run state transition from {from:?} to {to:?}")]
    InvalidTransition { from: RunState, to: RunState },

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl RunStateData {
    pub fn new(run_id: String, entry_count: usize) -> Self {
        let now = now_utc();
        Self {
            schema_version: SCHEMA_VERSION,
            schema_id: SCHEMA_ID.to_string(),
            run_id,
            state: RunState::Pending,
            created_at: now,
            updated_at: now,
            entry_count,
            seq: next_seq(),
        }
    }

    pub fn transition(&mut self, new_state: RunState) -> Result<(), RunStateError> {
        if !self.state.can_transition_to(new_state) {
            return Err(RunStateError::InvalidTransition {
                from: self.state,
                to: new_state,
            });
        }

        self.state = new_state;
        self.updated_at = now_utc();
        self.seq = next_seq();
        Ok(())
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
    pub fn write_to_file(&self, path: &Path) -> Result<(), RunStateError> {
        let json = self.to_json()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, &json)?;
        fs::rename(&temp_path, path)?;
        Ok(())
    }

    pub fn from_file(path: &Path) -> Result<Self, RunStateError> {
        let json = fs::read_to_string(path)?;
        Ok(Self::from_json(&json)?)
    }
}
