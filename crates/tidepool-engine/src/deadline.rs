//! Wall-clock budget for one bounded invocation

use std::time::Duration;
use tokio::time::Instant;

use crate::config::DeadlineConfig;

/// Point in time after which no new unit of work may start.
///
/// Checked at loop boundaries; expiry leads to a clean stop and a continuation
/// descriptor rather than an interrupt.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    expires_at: Instant,
}

impl Deadline {
    /// Remaining budget minus the safety buffer, starting now
    pub fn from_budget(budget: Duration, safety_buffer: Duration) -> Self {
        Self {
            expires_at: Instant::now() + budget.saturating_sub(safety_buffer),
        }
    }

    pub fn from_config(config: &DeadlineConfig) -> Self {
        Self::from_budget(
            Duration::from_secs(config.budget_secs),
            Duration::from_secs(config.safety_buffer_secs),
        )
    }

    pub fn after(duration: Duration) -> Self {
        Self {
            expires_at: Instant::now() + duration,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}
