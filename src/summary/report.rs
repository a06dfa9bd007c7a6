//! Run report (run_report.json)

use std::fs;
use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::failure::{ExitCode, ExitCodeAggregator, Failure, FailureKind, Stage, Status};
use crate::emulation::ProvisionSummary;
use crate::matrix::PlatformEntry;
use crate::publish::PublishReceipt;

pub const RUN_REPORT_SCHEMA_VERSION: u32 = 1;

pub const RUN_REPORT_SCHEMA_ID: &str = "crossbuild/run_report@1";

pub const RUN_REPORT_FILE: &str = "run_report.json";

/// Result of one matrix entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryOutcome {
    pub platform: String,
    pub arch: String,

    pub status: Status,

    /// Absent for entries cancelled before a job was created
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,

    /// Digest of the build inputs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Container exit code when the build ran to completion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_exit_code: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle: Option<PublishReceipt>,

    /// Kept workspace copy, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,

    pub duration_ms: u64,
}

impl EntryOutcome {
    pub fn published(entry: &PlatformEntry, receipt: PublishReceipt, duration_ms: u64) -> Self {
        Self {
            status: Status::Success,
            build_exit_code: Some(0),
            bundle: Some(receipt),
            duration_ms,
            ..Self::blank(entry)
        }
    }

    pub fn failed(entry: &PlatformEntry, failure: Failure, duration_ms: u64) -> Self {
        let status = if failure.is_cancelled() {
            Status::Cancelled
        } else {
            Status::Failed
        };
        Self {
            status,
            stage: Some(failure.stage),
            failure_kind: Some(failure.kind),
            message: Some(failure.message),
            build_exit_code: failure.exit_code,
            duration_ms,
            ..Self::blank(entry)
        }
    }

    /// Entry that never started because the run was cancelled
    pub fn not_started(entry: &PlatformEntry) -> Self {
        Self::failed(entry, Failure::cancelled(Stage::Workspace), 0)
    }

    pub fn with_job(mut self, job_id: impl Into<String>, job_key: Option<String>) -> Self {
        self.job_id = Some(job_id.into());
        self.job_key = job_key;
        self
    }

    pub fn with_workspace(mut self, workspace: Option<String>) -> Self {
        self.workspace = workspace;
        self
    }

    fn blank(entry: &PlatformEntry) -> Self {
        Self {
            platform: entry.platform.clone(),
            arch: entry.arch.clone(),
            status: Status::Success,
            job_id: None,
            job_key: None,
            stage: None,
            failure_kind: None,
            message: None,
            build_exit_code: None,
            bundle: None,
            workspace: None,
            duration_ms: 0,
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        match (self.status, self.failure_kind) {
            (Status::Success, _) => ExitCode::Success,
            (Status::Cancelled, _) => ExitCode::Cancelled,
            (Status::Failed, Some(kind)) => kind.exit_code(),
            (Status::Failed, None) => ExitCode::BuildFailed,
        }
    }
}

/// Run report (run_report.json)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub schema_version: u32,
    pub schema_id: String,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub status: Status,
    pub exit_code: i32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub provision: Option<ProvisionSummary>,

    /// Outcomes in matrix declaration order
    pub entries: Vec<EntryOutcome>,

    pub entries_succeeded: usize,
    pub entries_failed: usize,
    pub entries_cancelled: usize,

    /// Wall-clock duration of the entire run in milliseconds
    pub duration_ms: u64,

    pub human_summary: String,
}

impl RunReport {
    /// Aggregate entry outcomes, which must already be in matrix order
    pub fn from_outcomes(
        run_id: String,
        started_at: DateTime<Utc>,
        provision: Option<ProvisionSummary>,
        entries: Vec<EntryOutcome>,
        duration_ms: u64,
    ) -> Self {
        let mut aggregator = ExitCodeAggregator::new();
        for outcome in &entries {
            aggregator.add(outcome.status, outcome.exit_code());
        }
        let count = |status: Status| entries.iter().filter(|e| e.status == status).count();
        let entries_succeeded = count(Status::Success);
        let entries_failed = count(Status::Failed);
        let entries_cancelled = count(Status::Cancelled);

        let status = aggregator.status();
        let human_summary = Self::generate_human_summary(status, &entries);

        Self {
            schema_version: RUN_REPORT_SCHEMA_VERSION,
            schema_id: RUN_REPORT_SCHEMA_ID.to_string(),
            run_id,
            started_at,
            status,
            exit_code: aggregator.exit_code().as_i32(),
            provision,
            entries,
            entries_succeeded,
            entries_failed,
            entries_cancelled,
            duration_ms,
            human_summary,
        }
    }

    /// Report for a run that stopped before any entry was processed
    pub fn aborted(
        run_id: String,
        started_at: DateTime<Utc>,
        provision: ProvisionSummary,
        exit_code: ExitCode,
        message: &str,
        duration_ms: u64,
    ) -> Self {
        let status = if exit_code == ExitCode::Cancelled {
            Status::Cancelled
        } else {
            Status::Failed
        };
        Self {
            schema_version: RUN_REPORT_SCHEMA_VERSION,
            schema_id: RUN_REPORT_SCHEMA_ID.to_string(),
            run_id,
            started_at,
            status,
            exit_code: exit_code.as_i32(),
            provision: Some(provision),
            entries: Vec::new(),
            entries_succeeded: 0,
            entries_failed: 0,
            entries_cancelled: 0,
            duration_ms,
            human_summary: format!("Run aborted: {}", message),
        }
    }

    fn generate_human_summary(status: Status, entries: &[EntryOutcome]) -> String {
        if entries.is_empty() {
            return "No enabled entries".to_string();
        }
        let total = entries.len();
        let succeeded = entries.iter().filter(|e| e.status == Status::Success).count();
        match status {
            Status::Success => format!("Run succeeded: {}/{} entries published", succeeded, total),
            Status::Failed => {
                let failures: Vec<String> = entries
                    .iter()
                    .filter(|e| e.status == Status::Failed)
                    .map(|e| {
                        let stage = e.stage.map(|s| s.to_string()).unwrap_or_default();
                        format!("{} at {}", e.platform, stage)
                    })
                    .collect();
                format!(
                    "Run failed: {}/{} entries published; failed: {}",
                    succeeded,
                    total,
                    failures.join(", ")
                )
            }
            Status::Cancelled => {
                let cancelled = entries.iter().filter(|e| e.status == Status::Cancelled).count();
                format!(
                    "Run cancelled: {} entries cancelled, {}/{} published",
                    cancelled, succeeded, total
                )
            }
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Write atomically, creating the parent directory
    pub fn write_to_file(&self, path: &Path) -> io::Result<()> {
        let json = self.to_json().map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, format!("JSON error: {}", e))
        })?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)
    }

    pub fn from_file(path: &Path) -> io::Result<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("JSON error: {}", e)))
    }

    pub fn exit_code_enum(&self) -> Option<ExitCode> {
        ExitCode::from_i32(self.exit_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::BuildError;

    fn entry(platform: &str, arch: &str) -> PlatformEntry {
        PlatformEntry::new(platform, arch)
    }

    fn receipt(name: &str) -> PublishReceipt {
        PublishReceipt {
            bundle_name: name.to_string(),
            sink: "mock".to_string(),
            location: format!("mock://{}", name),
            file_count: 2,
            bundle_root_sha256: "0".repeat(64),
        }
    }

    fn build_failure(platform: &str) -> EntryOutcome {
        EntryOutcome::failed(
            &entry(platform, "aarch64"),
            Failure::from_build(&BuildError::BuildFailed { exit_code: 2 }),
            10,
        )
    }

    #[test]
    fn test_all_success() {
        let outcomes = vec![
            EntryOutcome::published(&entry("linux/amd64", "x86_64"), receipt("x86_64-linux"), 5),
        ];
        let report = RunReport::from_outcomes("run1".to_string(), Utc::now(), None, outcomes, 5);
        assert_eq!(report.status, Status::Success);
        assert_eq!(report.exit_code, 0);
        assert_eq!(report.entries_succeeded, 1);
        assert_eq!(report.human_summary, "Run succeeded: 1/1 entries published");
    }

    #[test]
    fn test_empty_run_succeeds() {
        let report = RunReport::from_outcomes("run1".to_string(), Utc::now(), None, vec![], 0);
        assert_eq!(report.status, Status::Success);
        assert_eq!(report.exit_code, 0);
        assert_eq!(report.human_summary, "No enabled entries");
    }

    #[test]
    fn test_failure_names_platform_and_stage() {
        let outcomes = vec![
            EntryOutcome::published(&entry("linux/amd64", "x86_64"), receipt("x86_64-linux"), 5),
            build_failure("linux/arm64"),
        ];
        let report = RunReport::from_outcomes("run1".to_string(), Utc::now(), None, outcomes, 5);
        assert_eq!(report.status, Status::Failed);
        assert_eq!(report.exit_code, 30);
        assert_eq!(report.entries_failed, 1);
        assert!(report.human_summary.contains("linux/arm64 at build"));
    }

    #[test]
    fn test_cancelled_dominates() {
        let outcomes = vec![
            build_failure("linux/arm64"),
            EntryOutcome::not_started(&entry("linux/amd64", "x86_64")),
        ];
        let report = RunReport::from_outcomes("run1".to_string(), Utc::now(), None, outcomes, 5);
        assert_eq!(report.status, Status::Cancelled);
        assert_eq!(report.exit_code, 80);
        assert_eq!(report.entries_cancelled, 1);
    }

    #[test]
    fn test_serialization_skips_absent_fields() {
        let outcome = build_failure("linux/arm64");
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(json.contains(r#""failure_kind":"BUILD""#));
        assert!(json.contains(r#""build_exit_code":2"#));
        assert!(!json.contains("bundle"));
    }

    #[test]
    fn test_write_and_read_file() {
        use tempfile::TempDir;

        let dir = TempDir::new().unwrap();
        let report = RunReport::from_outcomes(
            "run1".to_string(),
            Utc::now(),
            None,
            vec![build_failure("linux/arm64")],
            5,
        );
        let path = dir.path().join("nested").join(RUN_REPORT_FILE);
        report.write_to_file(&path).unwrap();

        let loaded = RunReport::from_file(&path).unwrap();
        assert_eq!(loaded.run_id, "run1");
        assert_eq!(loaded.entries, report.entries);
        assert_eq!(loaded.exit_code_enum(), Some(ExitCode::BuildFailed));
    }
}
