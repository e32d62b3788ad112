//! Filter SPI and chain assembly.
//!
//! - [`node`]: immutable chain nodes, including transport branches
//! - [`registry`]: filter providers and name-based registration
//! - [`config`]: declarative per-direction chain configuration
//! - [`builder`]: resolves configuration into built chains
//! - [`schedule`]: built-in filter that moves the rest of a chain onto an executor

pub mod builder;
pub mod config;
pub mod node;
pub mod registry;
pub mod schedule;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use rpcflow_core::{InvocationType, Response};

use crate::invocation::Invocation;

pub use builder::FilterChainsManager;
pub use config::{ChainItem, DirectionChains, FilterChainsConfig};
pub use node::{ChainElement, FilterNode};
pub use registry::{ChainConfigError, FilterContext, FilterProvider, FilterRegistration, FilterRegistry};
pub use schedule::{ScheduleFilter, ScheduleFilterProvider, SCHEDULE_FILTER};

/// Outcome of a filter: `Err` is an exceptional completion.
pub type FilterResult = anyhow::Result<Response>;

/// Boxed future returned by chain nodes.
pub type FilterFuture = Pin<Box<dyn Future<Output = FilterResult> + Send>>;

/// A pluggable, orderable interceptor in the invocation pipeline.
///
/// Filters are immutable once built. A filter registered as shared is reused
/// across chains and must not keep per-invocation state.
#[async_trait]
pub trait Filter: Send + Sync + 'static {
    /// Unique name used by chain configuration.
    fn name(&self) -> &str;

    /// Sort key used when a chain is not configured explicitly. Lower runs first.
    fn order(&self, _invocation_type: InvocationType, _microservice: &str) -> i32 {
        0
    }

    fn enabled_for_invocation_type(&self, _invocation_type: InvocationType) -> bool {
        true
    }

    fn enabled_for_transport(&self, _transport: &str) -> bool {
        true
    }

    fn enabled_for_microservice(&self, _microservice: &str) -> bool {
        true
    }

    /// Combined enablement check evaluated by the chain for each invocation.
    fn enabled(&self, invocation: &Invocation) -> bool {
        self.enabled_for_invocation_type(invocation.invocation_type())
            && self.enabled_for_transport(invocation.transport())
            && self.enabled_for_microservice(invocation.microservice_name())
    }

    /// Processes the invocation, usually delegating to `next`.
    async fn on_filter(&self, invocation: Arc<Invocation>, next: FilterNode) -> FilterResult;
}
