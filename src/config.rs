use std::time::Duration;

use crate::failover::{FailoverStrategy, RestartStrategy};

/// Per-job scheduling configuration.
#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Prefer redeploying a recovered task to the worker it last ran on.
    pub local_recovery: bool,
    /// Scope of restart after a task failure.
    pub failover: FailoverStrategy,
    /// Whether and when to retry after a failure.
    pub restart: RestartStrategy,
    /// How long an unused leased slot is kept before it is returned to the
    /// worker pool.
    pub slot_idle_timeout: Duration,
    /// How long a queued slot request waits before it fails.
    pub allocation_timeout: Duration,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            local_recovery: false,
            failover: FailoverStrategy::Region,
            restart: RestartStrategy::FixedDelay {
                max_attempts: 3,
                delay: Duration::from_secs(1),
            },
            slot_idle_timeout: Duration::from_secs(10),
            allocation_timeout: Duration::from_secs(10),
        }
    }
}

impl JobConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_local_recovery(mut self, enabled: bool) -> Self {
        self.local_recovery = enabled;
        self
    }

    pub fn with_failover(mut self, failover: FailoverStrategy) -> Self {
        self.failover = failover;
        self
    }

    pub fn with_restart(mut self, restart: RestartStrategy) -> Self {
        self.restart = restart;
        self
    }

    pub fn with_slot_idle_timeout(mut self, timeout: Duration) -> Self {
        self.slot_idle_timeout = timeout;
        self
    }

    pub fn with_allocation_timeout(mut self, timeout: Duration) -> Self {
        self.allocation_timeout = timeout;
        self
    }
}
