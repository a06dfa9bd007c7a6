//! Failure taxonomy and stable exit codes

use serde::{Deserialize, Serialize};

use crate::collect::CollectError;
use crate::emulation::ProvisionError;
use crate::publish::PublishError;
use crate::runner::BuildError;

/// Entry/run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Failed,
    Cancelled,
}

impl Status {
    pub fn is_failure(&self) -> bool {
        !matches!(self, Status::Success)
    }
}

/// Where in the entry lifecycle a failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Provision,
    Workspace,
    Build,
    Collect,
    Publish,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Provision => "provision",
            Stage::Workspace => "workspace",
            Stage::Build => "build",
            Stage::Collect => "collect",
            Stage::Publish => "publish",
        };
        write!(f, "{}", s)
    }
}

/// Failure kind - categorizes the cause of failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// Emulation registration failed
    Provision,
    /// Workspace could not be prepared
    Workspace,
    /// Container could not be started
    Launch,
    /// Container exited nonzero
    Build,
    /// Overall build timeout expired
    Timeout,
    /// Required artifact rule matched nothing
    MissingArtifact,
    /// Any other collection error
    Collect,
    /// Sink rejected or failed the bundle
    Publish,
    Cancelled,
}

impl FailureKind {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            FailureKind::Provision => ExitCode::ProvisionFailed,
            FailureKind::Workspace | FailureKind::Launch => ExitCode::LaunchFailed,
            FailureKind::Build => ExitCode::BuildFailed,
            FailureKind::Timeout => ExitCode::BuildTimeout,
            FailureKind::MissingArtifact | FailureKind::Collect => ExitCode::CollectFailed,
            FailureKind::Publish => ExitCode::PublishFailed,
            FailureKind::Cancelled => ExitCode::Cancelled,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            FailureKind::Provision => "Emulation provisioning failed",
            FailureKind::Workspace => "Workspace preparation failed",
            FailureKind::Launch => "Container launch failed",
            FailureKind::Build => "Build failed",
            FailureKind::Timeout => "Build timed out",
            FailureKind::MissingArtifact => "Required artifact missing",
            FailureKind::Collect => "Artifact collection failed",
            FailureKind::Publish => "Publish failed",
            FailureKind::Cancelled => "Cancelled",
        }
    }
}

/// Stable process exit codes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum ExitCode {
    #[default]
    Success = 0,
    ConfigError = 1,
    ProvisionFailed = 10,
    LaunchFailed = 20,
    BuildFailed = 30,
    BuildTimeout = 31,
    CollectFailed = 40,
    PublishFailed = 50,
    Cancelled = 80,
}

impl ExitCode {
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            0 => Some(ExitCode::Success),
            1 => Some(ExitCode::ConfigError),
            10 => Some(ExitCode::ProvisionFailed),
            20 => Some(ExitCode::LaunchFailed),
            30 => Some(ExitCode::BuildFailed),
            31 => Some(ExitCode::BuildTimeout),
            40 => Some(ExitCode::CollectFailed),
            50 => Some(ExitCode::PublishFailed),
            80 => Some(ExitCode::Cancelled),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExitCode::Success)
    }
}

/// An entry-scoped failure as recorded in the report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub stage: Stage,
    pub kind: FailureKind,
    pub message: String,
    /// Container exit code, when the build ran to completion
    pub exit_code: Option<i32>,
}

impl Failure {
    fn new(stage: Stage, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            message: message.into(),
            exit_code: None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == FailureKind::Cancelled
    }

    pub fn from_provision(e: &ProvisionError) -> Self {
        Self::new(Stage::Provision, FailureKind::Provision, e.to_string())
    }

    pub fn cancelled(stage: Stage) -> Self {
        Self::new(stage, FailureKind::Cancelled, "run cancelled")
    }

    pub fn from_build(e: &BuildError) -> Self {
        match e {
            BuildError::BuildFailed { exit_code } => Self {
                exit_code: Some(*exit_code),
                ..Self::new(Stage::Build, FailureKind::Build, e.to_string())
            },
            BuildError::Timeout { .. } => Self::new(Stage::Build, FailureKind::Timeout, e.to_string()),
            BuildError::LaunchFailed(_) => Self::new(Stage::Build, FailureKind::Launch, e.to_string()),
            BuildError::Cancelled => Self::cancelled(Stage::Build),
            BuildError::Workspace(_) => {
                Self::new(Stage::Workspace, FailureKind::Workspace, e.to_string())
            }
        }
    }

    pub fn from_collect(e: &CollectError) -> Self {
        let kind = match e {
            CollectError::MissingArtifact { .. } => FailureKind::MissingArtifact,
            _ => FailureKind::Collect,
        };
        Self {
            exit_code: Some(0),
            ..Self::new(Stage::Collect, kind, e.to_string())
        }
    }

    pub fn from_publish(e: &PublishError) -> Self {
        match e {
            PublishError::Cancelled => Self::cancelled(Stage::Publish),
            _ => Self {
                exit_code: Some(0),
                ..Self::new(Stage::Publish, FailureKind::Publish, e.to_string())
            },
        }
    }
}

/// Aggregates entry results into a run status and exit code.
///
/// Cancellation dominates; otherwise the first failure added decides.
#[derive(Debug, Default)]
pub struct ExitCodeAggregator {
    has_cancelled: bool,
    first_failure_code: Option<ExitCode>,
}

impl ExitCodeAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, status: Status, exit_code: ExitCode) {
        match status {
            Status::Cancelled => self.has_cancelled = true,
            Status::Failed => {
                if self.first_failure_code.is_none() {
                    self.first_failure_code = Some(exit_code);
                }
            }
            Status::Success => {}
        }
    }

    pub fn status(&self) -> Status {
        if self.has_cancelled {
            Status::Cancelled
        } else if self.first_failure_code.is_some() {
            Status::Failed
        } else {
            Status::Success
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        if self.has_cancelled {
            ExitCode::Cancelled
        } else {
            self.first_failure_code.unwrap_or(ExitCode::Success)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serialization() {
        assert_eq!(serde_json::to_string(&Status::Success).unwrap(), r#""success""#);
        assert_eq!(serde_json::to_string(&Status::Cancelled).unwrap(), r#""cancelled""#);
        assert_eq!(serde_json::to_string(&Stage::Collect).unwrap(), r#""collect""#);
    }

    #[test]
    fn test_failure_kind_serialization() {
        assert_eq!(
            serde_json::to_string(&FailureKind::MissingArtifact).unwrap(),
            r#""MISSING_ARTIFACT""#
        );
        assert_eq!(serde_json::to_string(&FailureKind::Timeout).unwrap(), r#""TIMEOUT""#);
    }

    #[test]
    fn test_exit_code_values() {
        assert_eq!(ExitCode::Success.as_i32(), 0);
        assert_eq!(ExitCode::ConfigError.as_i32(), 1);
        assert_eq!(ExitCode::ProvisionFailed.as_i32(), 10);
        assert_eq!(ExitCode::LaunchFailed.as_i32(), 20);
        assert_eq!(ExitCode::BuildFailed.as_i32(), 30);
        assert_eq!(ExitCode::BuildTimeout.as_i32(), 31);
        assert_eq!(ExitCode::CollectFailed.as_i32(), 40);
        assert_eq!(ExitCode::PublishFailed.as_i32(), 50);
        assert_eq!(ExitCode::Cancelled.as_i32(), 80);
        assert_eq!(ExitCode::from_i32(31), Some(ExitCode::BuildTimeout));
        assert_eq!(ExitCode::from_i32(999), None);
    }

    #[test]
    fn test_build_error_mapping() {
        let f = Failure::from_build(&BuildError::BuildFailed { exit_code: 2 });
        assert_eq!(f.stage, Stage::Build);
        assert_eq!(f.kind.exit_code(), ExitCode::BuildFailed);
        assert_eq!(f.exit_code, Some(2));

        let f = Failure::from_build(&BuildError::Timeout { seconds: 5 });
        assert_eq!(f.kind.exit_code(), ExitCode::BuildTimeout);

        let f = Failure::from_build(&BuildError::LaunchFailed("no image".to_string()));
        assert_eq!(f.kind, FailureKind::Launch);

        assert!(Failure::from_build(&BuildError::Cancelled).is_cancelled());
    }

    #[test]
    fn test_collect_and_publish_mapping() {
        let f = Failure::from_collect(&CollectError::MissingArtifact {
            pattern: "target/debian/*.deb".to_string(),
        });
        assert_eq!(f.kind, FailureKind::MissingArtifact);
        assert_eq!(f.stage, Stage::Collect);
        assert!(f.message.contains("target/debian/*.deb"));

        let f = Failure::from_publish(&PublishError::Cancelled);
        assert!(f.is_cancelled());
        assert_eq!(f.stage, Stage::Publish);
    }

    #[test]
    fn test_aggregator_all_success() {
        let mut agg = ExitCodeAggregator::new();
        agg.add(Status::Success, ExitCode::Success);
        agg.add(Status::Success, ExitCode::Success);
        assert_eq!(agg.status(), Status::Success);
        assert_eq!(agg.exit_code(), ExitCode::Success);
    }

    #[test]
    fn test_aggregator_cancelled_over_failed() {
        let mut agg = ExitCodeAggregator::new();
        agg.add(Status::Failed, ExitCode::BuildFailed);
        agg.add(Status::Cancelled, ExitCode::Cancelled);
        assert_eq!(agg.status(), Status::Cancelled);
        assert_eq!(agg.exit_code(), ExitCode::Cancelled);
    }

    #[test]
    fn test_aggregator_first_failure_code() {
        let mut agg = ExitCodeAggregator::new();
        agg.add(Status::Success, ExitCode::Success);
        agg.add(Status::Failed, ExitCode::CollectFailed);
        agg.add(Status::Failed, ExitCode::BuildFailed);
        assert_eq!(agg.status(), Status::Failed);
        assert_eq!(agg.exit_code(), ExitCode::CollectFailed);
    }
}
