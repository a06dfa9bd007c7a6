//! Build timeout enforcement
//!
//! A build runs for as long as it takes unless `overall_seconds` is set.
//! The enforcer only answers "has the deadline passed"; stopping the
//! container is the runner's job.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Upper bound for `overall_seconds` (one week)
pub const MAX_OVERALL_SECONDS: u64 = 604_800;

/// Upper bound for `termination_grace_seconds`
pub const MAX_TERMINATION_GRACE_SECONDS: u64 = 300;

pub const DEFAULT_TERMINATION_GRACE_SECONDS: u64 =
    crossbuild_runtime::DEFAULT_TERMINATION_GRACE_SECONDS;

/// Timeout configuration (`[timeout]` table)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Maximum wall-clock time per build; `None` means no timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overall_seconds: Option<u64>,

    /// Time between SIGTERM and SIGKILL when a build is stopped
    #[serde(default = "default_grace")]
    pub termination_grace_seconds: u64,
}

fn default_grace() -> u64 {
    DEFAULT_TERMINATION_GRACE_SECONDS
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            overall_seconds: None,
            termination_grace_seconds: DEFAULT_TERMINATION_GRACE_SECONDS,
        }
    }
}

impl TimeoutConfig {
    pub fn with_overall_seconds(mut self, seconds: u64) -> Self {
        self.overall_seconds = Some(seconds);
        self
    }

    pub fn validate(&self) -> Result<(), TimeoutValidationError> {
        if let Some(value) = self.overall_seconds {
            if value == 0 || value > MAX_OVERALL_SECONDS {
                return Err(TimeoutValidationError::OverallOutOfBounds { value });
            }
        }

        let grace = self.termination_grace_seconds;
        if grace == 0 || grace > MAX_TERMINATION_GRACE_SECONDS {
            return Err(TimeoutValidationError::GraceOutOfBounds { value: grace });
        }

        Ok(())
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_secs(self.termination_grace_seconds)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TimeoutValidationError {
    #[error("timeout.overall_seconds must be in (0, 604800], got {value}")]
    OverallOutOfBounds { value: u64 },

    #[error("timeout.termination_grace_seconds must be in (0, 300], got {value}")]
    GraceOutOfBounds { value: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutStatus {
    Ok,
    /// Overall wall-clock timeout exceeded
    OverallTimeout,
}

impl TimeoutStatus {
    pub fn is_timeout(&self) -> bool {
        !matches!(self, TimeoutStatus::Ok)
    }
}

/// Deadline tracker for one build
#[derive(Debug)]
pub struct TimeoutEnforcer {
    limit: Option<Duration>,
    start_time: Instant,
}

impl TimeoutEnforcer {
    /// Start tracking now
    pub fn new(config: &TimeoutConfig) -> Self {
        Self {
            limit: config.overall_seconds.map(Duration::from_secs),
            start_time: Instant::now(),
        }
    }

    /// Tracker with an explicit limit, for sub-second deadlines
    pub fn with_limit(limit: Option<Duration>) -> Self {
        Self {
            limit,
            start_time: Instant::now(),
        }
    }

    pub fn check(&self) -> TimeoutStatus {
        match self.limit {
            Some(limit) if self.start_time.elapsed() > limit => TimeoutStatus::OverallTimeout,
            _ => TimeoutStatus::Ok,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Time left before the deadline; `None` when unlimited
    pub fn remaining(&self) -> Option<Duration> {
        self.limit.map(|l| l.saturating_sub(self.elapsed()))
    }

    /// Configured limit in whole seconds, rounded up
    pub fn limit_seconds(&self) -> Option<u64> {
        self.limit
            .map(|l| l.as_secs() + u64::from(l.subsec_nanos() > 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_default_has_no_timeout() {
        let config = TimeoutConfig::default();
        assert_eq!(config.overall_seconds, None);
        assert_eq!(config.termination_grace_seconds, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_bounds() {
        let zero = TimeoutConfig::default().with_overall_seconds(0);
        assert_eq!(
            zero.validate(),
            Err(TimeoutValidationError::OverallOutOfBounds { value: 0 })
        );

        let week = TimeoutConfig::default().with_overall_seconds(MAX_OVERALL_SECONDS);
        assert!(week.validate().is_ok());

        let too_long = TimeoutConfig::default().with_overall_seconds(MAX_OVERALL_SECONDS + 1);
        assert!(too_long.validate().is_err());

        let no_grace = TimeoutConfig {
            overall_seconds: None,
            termination_grace_seconds: 0,
        };
        assert_eq!(
            no_grace.validate(),
            Err(TimeoutValidationError::GraceOutOfBounds { value: 0 })
        );
    }

    #[test]
    fn test_unlimited_never_times_out() {
        let enforcer = TimeoutEnforcer::new(&TimeoutConfig::default());
        assert_eq!(enforcer.check(), TimeoutStatus::Ok);
        assert_eq!(enforcer.remaining(), None);
        assert_eq!(enforcer.limit_seconds(), None);
    }

    #[test]
    fn test_limit_expires() {
        let enforcer = TimeoutEnforcer::with_limit(Some(Duration::from_millis(50)));
        assert!(!enforcer.check().is_timeout());
        sleep(Duration::from_millis(80));
        assert_eq!(enforcer.check(), TimeoutStatus::OverallTimeout);
        assert_eq!(enforcer.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn test_limit_seconds_rounds_up() {
        let enforcer = TimeoutEnforcer::with_limit(Some(Duration::from_millis(1500)));
        assert_eq!(enforcer.limit_seconds(), Some(2));
        let enforcer = TimeoutEnforcer::new(&TimeoutConfig::default().with_overall_seconds(30));
        assert_eq!(enforcer.limit_seconds(), Some(30));
    }

    #[test]
    fn test_deserialize_partial_table() {
        let config: TimeoutConfig =
            serde_json::from_value(serde_json::json!({"overall_seconds": 600})).unwrap();
        assert_eq!(config.overall_seconds, Some(600));
        assert_eq!(config.termination_grace_seconds, 10);
    }
}
