//! Invocation dispatch: entry points, retry decoration, and the blocking bridge.
//!
//! - [`dispatcher`]: `sync_invoke`, `reactive_invoke`, `invoke`, and the tower adapter
//! - [`retry`]: retry governance contract and the compatible retry policy
//! - [`bridge`]: one-shot primitive a blocking caller waits on
//! - [`execution`]: injected event-loop query and task spawner
//! - [`scheduler`]: dedicated runtime for retry backoff timers

pub mod bridge;
pub mod dispatcher;
pub mod execution;
pub mod retry;
pub mod scheduler;

use http::StatusCode;
use rpcflow_core::InvocationError;

use crate::filter::ChainConfigError;

pub use bridge::SyncBridge;
pub use dispatcher::{Dispatcher, DispatcherBuilder, InvokeService, ResponseCallback};
pub use execution::{
    event_loop_scope, is_event_loop_thread, mark_scheduler_threads, ExecutionContext, TokioExecution,
};
pub use retry::{
    is_retriable_error, AttemptOutcome, CompatibleRetryPolicy, GovernanceRequest, NoGovernance,
    RetryActuator, RetryGovernance,
};
pub use scheduler::RetryScheduler;

/// Failure of a dispatched invocation as seen by the caller.
///
/// Typed failures other than the internal consumer error are delivered as
/// failure [`Response`](rpcflow_core::Response)s, not as `InvokeError`.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("can not execute sync logic in event loop")]
    InEventLoop,
    #[error("{0}")]
    Timeout(InvocationError),
    #[error(transparent)]
    Invocation(InvocationError),
    #[error(transparent)]
    Raw(anyhow::Error),
    #[error(transparent)]
    Config(#[from] ChainConfigError),
}

impl InvokeError {
    /// Status code carried by typed errors.
    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Timeout(err) | Self::Invocation(err) => Some(err.status()),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}
