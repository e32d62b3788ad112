//! Producer-side schedule point.
//!
//! Everything after this filter runs on an executor chosen per operation,
//! so business logic never occupies the I/O loop that received the call.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use rpcflow_core::{InvocationError, InvocationType, Response};
use tokio::runtime::Handle;
use tracing::Instrument;

use super::registry::{FilterProvider, FilterRegistration};
use super::{Filter, FilterNode, FilterResult};
use crate::invocation::Invocation;

pub const SCHEDULE_FILTER: &str = "schedule";

/// Moves the remainder of the chain onto an operation's executor.
pub struct ScheduleFilter {
    default_executor: Handle,
    operation_executors: DashMap<String, Handle>,
}

impl ScheduleFilter {
    #[must_use]
    pub fn new(default_executor: Handle) -> Self {
        Self {
            default_executor,
            operation_executors: DashMap::new(),
        }
    }

    /// Dedicates `executor` to the operation with the given qualified name.
    #[must_use]
    pub fn with_operation_executor(self, qualified_name: impl Into<String>, executor: Handle) -> Self {
        self.operation_executors.insert(qualified_name.into(), executor);
        self
    }

    fn executor_for(&self, invocation: &Invocation) -> Handle {
        self.operation_executors
            .get(&invocation.qualified_name())
            .map_or_else(|| self.default_executor.clone(), |entry| entry.value().clone())
    }
}

#[async_trait]
impl Filter for ScheduleFilter {
    fn name(&self) -> &str {
        SCHEDULE_FILTER
    }

    fn order(&self, _invocation_type: InvocationType, _microservice: &str) -> i32 {
        100
    }

    fn enabled_for_invocation_type(&self, invocation_type: InvocationType) -> bool {
        invocation_type == InvocationType::Producer
    }

    async fn on_filter(&self, invocation: Arc<Invocation>, next: FilterNode) -> FilterResult {
        let executor = self.executor_for(&invocation);
        let span = tracing::Span::current();
        match executor
            .spawn(async move { next.on_filter(invocation).await }.instrument(span))
            .await
        {
            Ok(result) => result,
            Err(err) => Ok(Response::from_error(
                InvocationError::producer_inner("scheduled chain did not complete").with_cause(err.into()),
            )),
        }
    }
}

/// Contributes the schedule filter to a registry.
pub struct ScheduleFilterProvider {
    filter: Arc<ScheduleFilter>,
}

impl ScheduleFilterProvider {
    #[must_use]
    pub fn new(filter: ScheduleFilter) -> Self {
        Self {
            filter: Arc::new(filter),
        }
    }
}

impl FilterProvider for ScheduleFilterProvider {
    fn filters(&self) -> Vec<FilterRegistration> {
        vec![FilterRegistration::Shared(Arc::clone(&self.filter) as Arc<dyn Filter>)]
    }
}
