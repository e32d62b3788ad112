use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Retries allowed by the compatible retry policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryBudget {
    /// Retries that reuse the endpoint of the failed attempt.
    pub same_server: u32,
    /// Retries after which the load balancer picks a new endpoint.
    pub next_server: u32,
}

impl RetryBudget {
    #[must_use]
    pub fn new(same_server: u32, next_server: u32) -> Self {
        Self {
            same_server,
            next_server,
        }
    }

    #[must_use]
    pub fn total(&self) -> u32 {
        self.same_server.saturating_add(self.next_server)
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.total() > 0
    }
}

/// Compatible retry configuration: a default budget plus per-microservice overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub default: RetryBudget,
    pub microservices: HashMap<String, RetryBudget>,
}

impl RetryConfig {
    #[must_use]
    pub fn budget_for(&self, microservice: &str) -> RetryBudget {
        self.microservices
            .get(microservice)
            .copied()
            .unwrap_or(self.default)
    }
}

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct InvokerConfig {
    /// Reject synchronous invocations issued from an event-loop thread.
    /// Disable only for callers that cannot avoid it.
    pub guard_sync_in_event_loop: bool,
    /// Worker threads of the runtime that runs retry backoff timers.
    pub retry_scheduler_threads: usize,
    pub retry: RetryConfig,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            guard_sync_in_event_loop: true,
            retry_scheduler_threads: 2,
            retry: RetryConfig::default(),
        }
    }
}
