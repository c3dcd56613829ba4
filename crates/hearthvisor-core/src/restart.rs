//! Restart backoff and ceiling decisions.
//!
//! Everything here is pure: functions read or update a [`ServiceStatus`] value and never
//! touch timers or processes, so the whole policy is testable without a runtime.

use crate::config::RestartConfig;
use crate::status::{LifecycleState, ServiceStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// What to do after a failed health probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Restart once the delay has elapsed
    RestartAfter(Duration),
    /// Ceiling reached; mark the service failed and stop restarting it
    GiveUp,
}

/// An accepted operator restart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManualRestart {
    /// The override flag was used and the restart counter starts over
    pub reset: bool,
}

/// Why an operator restart was refused
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "reason")]
pub enum RestartRejection {
    #[error("service has failed permanently; retry with override once the fault is fixed")]
    Failed,

    #[error("restart limit reached after {restart_count} attempts; retry with override")]
    CeilingReached { restart_count: u32 },

    #[error("a restart of this service is already pending")]
    Pending,

    #[error("orchestrator is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RestartPolicy {
    base_backoff: Duration,
    max_backoff: Duration,
    max_restarts: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::new(&RestartConfig::default())
    }
}

impl RestartPolicy {
    pub fn new(config: &RestartConfig) -> Self {
        Self {
            base_backoff: config.base_backoff(),
            max_backoff: config.max_backoff(),
            max_restarts: config.max_restarts,
        }
    }

    pub fn base_backoff(&self) -> Duration {
        self.base_backoff
    }

    pub fn max_restarts(&self) -> u32 {
        self.max_restarts
    }

    /// `min(prev * 2, max)`
    pub fn next_backoff(&self, prev: Duration) -> Duration {
        prev.saturating_mul(2).min(self.max_backoff)
    }

    pub fn evaluate(&self, status: &ServiceStatus) -> RestartDecision {
        if status.restart_count >= self.max_restarts {
            RestartDecision::GiveUp
        } else {
            RestartDecision::RestartAfter(status.current_backoff())
        }
    }

    /// Decide on an operator restart. Without `override_ceiling` a failed service, or one
    /// at the ceiling, is refused.
    pub fn evaluate_manual(
        &self,
        status: &ServiceStatus,
        override_ceiling: bool,
    ) -> Result<ManualRestart, RestartRejection> {
        if override_ceiling {
            return Ok(ManualRestart { reset: true });
        }

        if status.lifecycle_state == LifecycleState::Failed {
            return Err(RestartRejection::Failed);
        }

        if status.restart_count >= self.max_restarts {
            return Err(RestartRejection::CeilingReached {
                restart_count: status.restart_count,
            });
        }

        Ok(ManualRestart { reset: false })
    }

    /// Bookkeeping once a restart has been carried out
    pub fn record_restart(&self, status: &mut ServiceStatus, at: DateTime<Utc>) {
        status.restart_count = (status.restart_count + 1).min(self.max_restarts);
        status.last_restart_at = Some(at);
        status.current_backoff_seconds = self.next_backoff(status.current_backoff()).as_secs();
    }

    /// Operator override: counter and backoff start over
    pub fn record_override(&self, status: &mut ServiceStatus, at: DateTime<Utc>) {
        status.restart_count = 0;
        status.last_restart_at = Some(at);
        status.current_backoff_seconds = self.base_backoff.as_secs();
    }

    /// A successful probe clears the failure history
    pub fn record_healthy(&self, status: &mut ServiceStatus) {
        status.restart_count = 0;
        status.current_backoff_seconds = self.base_backoff.as_secs();
    }
}
