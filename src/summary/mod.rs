//! Failure taxonomy and run report
//!
//! Implements run_report.json and the stable process exit codes.

mod failure;
mod report;

pub use failure::{ExitCode, ExitCodeAggregator, Failure, FailureKind, Stage, Status};
pub use report::{EntryOutcome, RunReport, RUN_REPORT_FILE, RUN_REPORT_SCHEMA_ID, RUN_REPORT_SCHEMA_VERSION};
