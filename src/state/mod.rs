//! Job and run state machines
//!
//! - Job states: PENDING → RUNNING → {SUCCEEDED | FAILED}, with CANCELLED
//!   reachable from PENDING and RUNNING, and SUCCEEDED → FAILED when
//!   collection or publication fails after a clean build
//! - Run states: PENDING → PROVISIONING → RUNNING → {SUCCEEDED | FAILED | CANCELLED}

mod job_state;
mod run_state;

pub use job_state::{JobState, JobStateData, JobStateError};
pub use run_state::{RunState, RunStateData, RunStateError};

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counter used to order state records
static SEQUENCE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Next sequence number
pub fn next_seq() -> u64 {
    SEQUENCE_COUNTER.fetch_add(1, Ordering::SeqCst)
}

pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

/// States with no outgoing transitions
pub trait TerminalState {
    fn is_terminal(&self) -> bool;
}
