//! Retry decoration contract.
//!
//! A governance module may supply a [`RetryActuator`] per operation. When it
//! does not, the dispatcher falls back to [`CompatibleRetryPolicy`], driven by
//! the configured same-server/next-server budgets.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use rpcflow_core::{Fault, InvocationType, TransportError};

use super::InvokeError;
use crate::config::RetryBudget;
use crate::invocation::Invocation;

/// Outcome of one attempt, as seen by the retry decorator.
pub type AttemptOutcome = Result<rpcflow_core::Response, InvokeError>;

/// Decides whether and how often an invocation is retried.
pub trait RetryActuator: Send + Sync {
    /// Total attempts, the first one included.
    fn max_attempts(&self) -> u32;

    fn should_retry(&self, outcome: &AttemptOutcome) -> bool;

    /// Pause before attempt `attempt + 1`.
    fn backoff(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }

    /// Retries driven by the load balancer clear the resolved endpoint once
    /// the same-server budget is spent.
    fn is_load_balance_retry(&self) -> bool {
        false
    }
}

/// What governance knows about the invocation it decorates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GovernanceRequest {
    pub microservice: String,
    pub schema_id: String,
    pub operation_id: String,
    pub invocation_type: InvocationType,
    pub transport: String,
}

impl GovernanceRequest {
    #[must_use]
    pub fn from_invocation(invocation: &Invocation) -> Self {
        let operation = invocation.operation();
        Self {
            microservice: operation.microservice_name.clone(),
            schema_id: operation.schema_id.clone(),
            operation_id: operation.operation_id.clone(),
            invocation_type: invocation.invocation_type(),
            transport: invocation.transport().to_string(),
        }
    }
}

/// Source of governance-defined retry actuators.
pub trait RetryGovernance: Send + Sync {
    fn retry_actuator(&self, request: &GovernanceRequest) -> Option<Arc<dyn RetryActuator>>;
}

/// Governance that never supplies an actuator.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoGovernance;

impl RetryGovernance for NoGovernance {
    fn retry_actuator(&self, _request: &GovernanceRequest) -> Option<Arc<dyn RetryActuator>> {
        None
    }
}

// ---------------------------------------------------------------------------
// Compatible policy
// ---------------------------------------------------------------------------

/// Load-balancing retry on unavailable servers and broken connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompatibleRetryPolicy {
    budget: RetryBudget,
}

impl CompatibleRetryPolicy {
    /// Returns `None` when the budget allows no retry at all.
    #[must_use]
    pub fn new(budget: RetryBudget) -> Option<Self> {
        budget.is_enabled().then_some(Self { budget })
    }

    #[must_use]
    pub fn budget(&self) -> RetryBudget {
        self.budget
    }
}

impl RetryActuator for CompatibleRetryPolicy {
    fn max_attempts(&self) -> u32 {
        self.budget.total().saturating_add(1)
    }

    fn should_retry(&self, outcome: &AttemptOutcome) -> bool {
        match outcome {
            Ok(response) => match response.fault() {
                Some(Fault::Invocation(err)) => {
                    err.status() == StatusCode::SERVICE_UNAVAILABLE
                        || err.cause().is_some_and(is_retriable_error)
                }
                Some(Fault::Raw(err)) => is_retriable_error(err),
                None => false,
            },
            Err(InvokeError::Invocation(err)) => {
                err.status() == StatusCode::SERVICE_UNAVAILABLE || err.cause().is_some_and(is_retriable_error)
            }
            Err(InvokeError::Raw(err)) => is_retriable_error(err),
            Err(_) => false,
        }
    }

    fn is_load_balance_retry(&self) -> bool {
        true
    }
}

/// `true` if any error in the chain is a connection-level failure.
#[must_use]
pub fn is_retriable_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if cause.is::<TransportError>() {
            return true;
        }
        cause.downcast_ref::<io::Error>().is_some_and(|io| {
            matches!(
                io.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::BrokenPipe
            )
        })
    })
}

#[cfg(test)]
mod tests {
    use anyhow::Context;
    use rpcflow_core::{InvocationError, Response};

    use super::*;

    fn policy() -> CompatibleRetryPolicy {
        CompatibleRetryPolicy::new(RetryBudget::new(1, 1)).unwrap()
    }

    #[test]
    fn zero_budget_disables_policy() {
        assert!(CompatibleRetryPolicy::new(RetryBudget::default()).is_none());
        assert_eq!(policy().budget(), RetryBudget::new(1, 1));
        assert_eq!(policy().max_attempts(), 3);
        assert!(policy().is_load_balance_retry());
    }

    #[test]
    fn unavailable_is_retried_bad_request_is_not() {
        let unavailable = Ok(Response::from_error(InvocationError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "overloaded",
        )));
        let bad_request = Ok(Response::from_error(InvocationError::new(
            StatusCode::BAD_REQUEST,
            "invalid",
        )));
        assert!(policy().should_retry(&unavailable));
        assert!(!policy().should_retry(&bad_request));
        assert!(!policy().should_retry(&Ok(Response::success("fine"))));
    }

    #[test]
    fn connection_failures_are_retried() {
        let refused = anyhow::Error::new(TransportError::ConnectRefused {
            address: "10.0.0.1:8080".to_string(),
        })
        .context("sending request");
        assert!(is_retriable_error(&refused));

        let reset = Err::<(), _>(io::Error::from(io::ErrorKind::ConnectionReset))
            .context("reading reply")
            .unwrap_err();
        assert!(is_retriable_error(&reset));

        let wrapped = InvocationError::consumer_inner("send failed").with_cause(refused);
        assert!(policy().should_retry(&Err(InvokeError::Invocation(wrapped))));
    }

    #[test]
    fn other_errors_are_not_retried() {
        let denied = anyhow::Error::new(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(!is_retriable_error(&denied));
        assert!(!policy().should_retry(&Err(InvokeError::Raw(anyhow::anyhow!("bug")))));
        assert!(!policy().should_retry(&Err(InvokeError::Timeout(
            InvocationError::request_timeout("slow")
        ))));
        assert!(!policy().should_retry(&Err(InvokeError::InEventLoop)));
    }
}
