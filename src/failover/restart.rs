use std::time::Duration;

/// Whether and when to retry after a failure. The decision is scope-local:
/// the scheduler keeps one restart counter per independently-restarted
/// region (a single shared counter when the failover scope is the full job).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartStrategy {
    /// Retry after a fixed delay, at most `max_attempts` times per scope.
    FixedDelay { max_attempts: u32, delay: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    RetryAfter(Duration),
    Abort,
}

impl RestartStrategy {
    pub fn fixed_delay(max_attempts: u32, delay: Duration) -> Self {
        RestartStrategy::FixedDelay {
            max_attempts,
            delay,
        }
    }

    pub fn decide(&self, restarts_used: u32) -> RestartDecision {
        match *self {
            RestartStrategy::FixedDelay {
                max_attempts,
                delay,
            } => {
                if restarts_used < max_attempts {
                    RestartDecision::RetryAfter(delay)
                } else {
                    RestartDecision::Abort
                }
            }
        }
    }
}
