//! Invocation entry points.
//!
//! Each attempt runs the whole chain from its head. The attempt's finish hook
//! fires before its outcome reaches the retry decorator, and the overall
//! result is delivered exactly once: returned from [`Dispatcher::sync_invoke`],
//! handed to the callback of [`Dispatcher::reactive_invoke`], or resolved by
//! the future of [`Dispatcher::invoke`].

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use metrics::{counter, histogram};
use rpcflow_core::{Fault, Response};
use tower::Service;
use tracing::{error, info_span, warn, Instrument, Span};

use super::bridge::SyncBridge;
use super::execution::ExecutionContext;
use super::retry::{AttemptOutcome, CompatibleRetryPolicy, GovernanceRequest, NoGovernance, RetryActuator, RetryGovernance};
use super::scheduler::RetryScheduler;
use super::InvokeError;
use crate::config::InvokerConfig;
use crate::filter::{FilterChainsManager, FilterNode, FilterResult};
use crate::invocation::{Invocation, InvocationObserver, ResponseExecutor};

/// Receives the final outcome of a reactive invocation.
pub type ResponseCallback = Box<dyn FnOnce(Result<Response, InvokeError>) + Send + 'static>;

struct DispatcherInner {
    chains: Arc<FilterChainsManager>,
    execution: Arc<dyn ExecutionContext>,
    governance: Arc<dyn RetryGovernance>,
    config: InvokerConfig,
    observers: Vec<Arc<dyn InvocationObserver>>,
    scheduler: RetryScheduler,
}

// ---------------------------------------------------------------------------
// DispatcherBuilder
// ---------------------------------------------------------------------------

/// Assembles a [`Dispatcher`].
pub struct DispatcherBuilder {
    chains: Arc<FilterChainsManager>,
    execution: Arc<dyn ExecutionContext>,
    governance: Arc<dyn RetryGovernance>,
    config: InvokerConfig,
    observers: Vec<Arc<dyn InvocationObserver>>,
}

impl DispatcherBuilder {
    #[must_use]
    pub fn governance(mut self, governance: Arc<dyn RetryGovernance>) -> Self {
        self.governance = governance;
        self
    }

    #[must_use]
    pub fn config(mut self, config: InvokerConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn observer(mut self, observer: Arc<dyn InvocationObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Starts the retry scheduler and returns the dispatcher.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the retry scheduler runtime can't be created.
    pub fn build(self) -> io::Result<Dispatcher> {
        let scheduler = RetryScheduler::new(self.config.retry_scheduler_threads)?;
        Ok(Dispatcher {
            inner: Arc::new(DispatcherInner {
                chains: self.chains,
                execution: self.execution,
                governance: self.governance,
                config: self.config,
                observers: self.observers,
                scheduler,
            }),
        })
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Runs invocations through their filter chain. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    #[must_use]
    pub fn builder(chains: Arc<FilterChainsManager>, execution: Arc<dyn ExecutionContext>) -> DispatcherBuilder {
        DispatcherBuilder {
            chains,
            execution,
            governance: Arc::new(NoGovernance),
            config: InvokerConfig::default(),
            observers: Vec::new(),
        }
    }

    #[must_use]
    pub fn chains(&self) -> &Arc<FilterChainsManager> {
        &self.inner.chains
    }

    #[must_use]
    pub fn config(&self) -> &InvokerConfig {
        &self.inner.config
    }

    /// Runs the invocation and blocks the calling thread for its outcome.
    ///
    /// The chain runs on the execution context; completion work runs back on
    /// this thread. Each attempt waits at most the operation's sync timeout.
    ///
    /// # Errors
    ///
    /// - [`InvokeError::InEventLoop`] when called from an event-loop thread
    ///   while the guard is enabled; no chain is started.
    /// - [`InvokeError::Timeout`] when an attempt does not complete in time.
    /// - [`InvokeError::Invocation`] for internal consumer errors.
    /// - [`InvokeError::Raw`] for opaque failures.
    /// - [`InvokeError::Config`] when the chain can't be built.
    pub fn sync_invoke(&self, invocation: Arc<Invocation>) -> Result<Response, InvokeError> {
        if self.inner.config.guard_sync_in_event_loop && self.inner.execution.in_event_loop() {
            return Err(InvokeError::InEventLoop);
        }
        invocation.set_sync(true);
        let chain = self.chain_for(&invocation)?;
        let timeout = invocation.operation().config.sync_wait_timeout();

        let Some(policy) = self.retry_policy(&invocation) else {
            return self.run_sync_attempt(&chain, &invocation, timeout);
        };
        let max_attempts = policy.max_attempts().max(1);
        loop {
            let outcome = self.run_sync_attempt(&chain, &invocation, timeout);
            let Some(backoff) = self.next_retry(&invocation, policy.as_ref(), max_attempts, &outcome) else {
                return outcome;
            };
            if !backoff.is_zero() {
                std::thread::sleep(backoff);
            }
            prepare_retry(&invocation, policy.as_ref());
        }
    }

    /// Runs the invocation without blocking and hands the outcome to
    /// `callback` through the invocation's response executor.
    pub fn reactive_invoke(&self, invocation: Arc<Invocation>, callback: ResponseCallback) {
        let outcome = self.invoke(Arc::clone(&invocation));
        self.inner.execution.spawn(Box::pin(async move {
            let outcome = outcome.await;
            invocation
                .response_executor()
                .execute(Box::new(move || callback(outcome)));
        }));
    }

    /// Runs the invocation, resolving once with the final outcome.
    pub fn invoke(
        &self,
        invocation: Arc<Invocation>,
    ) -> impl Future<Output = Result<Response, InvokeError>> + Send + 'static {
        let this = self.clone();
        async move { this.invoke_with_retry(invocation).await }
    }

    /// Exposes [`Dispatcher::invoke`] as a tower service.
    #[must_use]
    pub fn into_service(self) -> InvokeService {
        InvokeService { dispatcher: self }
    }

    // -- attempts -----------------------------------------------------------

    async fn invoke_with_retry(&self, invocation: Arc<Invocation>) -> AttemptOutcome {
        invocation.set_sync(false);
        let chain = self.chain_for(&invocation)?;

        let Some(policy) = self.retry_policy(&invocation) else {
            return self.run_attempt(&chain, &invocation).await;
        };
        let max_attempts = policy.max_attempts().max(1);
        loop {
            let outcome = self.run_attempt(&chain, &invocation).await;
            let Some(backoff) = self.next_retry(&invocation, policy.as_ref(), max_attempts, &outcome) else {
                return outcome;
            };
            self.inner.scheduler.delay(backoff).await;
            prepare_retry(&invocation, policy.as_ref());
        }
    }

    async fn run_attempt(&self, chain: &FilterNode, invocation: &Arc<Invocation>) -> AttemptOutcome {
        let span = self.start(invocation);
        async {
            invocation.on_dispatch();
            let result = chain.on_filter(Arc::clone(invocation)).await;
            let response = boundary(invocation, result);
            self.finish(invocation, &response);
            complete(response)
        }
        .instrument(span)
        .await
    }

    fn run_sync_attempt(&self, chain: &FilterNode, invocation: &Arc<Invocation>, timeout: Duration) -> AttemptOutcome {
        let bridge = Arc::new(SyncBridge::new());
        invocation.set_response_executor(Arc::clone(&bridge) as Arc<dyn ResponseExecutor>);
        let span = self.start(invocation);
        let _entered = span.enter();

        // The bridge is only referenced weakly from the chain side: once the
        // caller stops waiting, a late completion has nowhere to go.
        let completion = Arc::downgrade(&bridge);
        let this = self.clone();
        let task_invocation = Arc::clone(invocation);
        let chain = chain.clone();
        self.inner.execution.spawn(Box::pin(
            async move {
                task_invocation.on_dispatch();
                let result = chain.on_filter(Arc::clone(&task_invocation)).await;
                let response = boundary(&task_invocation, result);
                let Some(bridge) = completion.upgrade() else {
                    return;
                };
                bridge.execute(Box::new(move || {
                    this.finish(&task_invocation, &response);
                    if let Some(bridge) = completion.upgrade() {
                        bridge.set_response(response);
                    }
                }));
            }
            .instrument(span.clone()),
        ));

        match bridge.wait_and_run(timeout) {
            Ok(response) => {
                self.finish(invocation, &response);
                complete(response)
            }
            Err(err) => {
                warn!(
                    trace_id = %invocation.trace_id(),
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "synchronous invocation timed out"
                );
                self.finish(invocation, &Response::from_error(err.clone()));
                Err(InvokeError::Timeout(err))
            }
        }
    }

    fn start(&self, invocation: &Invocation) -> Span {
        let attempt = invocation.on_start();
        for observer in &self.inner.observers {
            observer.on_start(invocation);
        }
        counter!(
            "rpcflow_invocation_attempts_total",
            "microservice" => invocation.microservice_name().to_string(),
            "invocation_type" => invocation.invocation_type().to_string()
        )
        .increment(1);
        info_span!(
            "invocation",
            microservice = invocation.microservice_name(),
            operation = %invocation.qualified_name(),
            transport = invocation.transport(),
            attempt,
            status = tracing::field::Empty,
        )
    }

    fn finish(&self, invocation: &Invocation, response: &Response) {
        if !invocation.on_finish(response) {
            return;
        }
        for observer in &self.inner.observers {
            observer.on_finish(invocation, response);
        }
        Span::current().record("status", response.status().as_u16());
        if let Some(elapsed) = invocation.timings().attempt_duration() {
            histogram!(
                "rpcflow_invocation_duration_seconds",
                "microservice" => invocation.microservice_name().to_string(),
                "status" => response.status().as_str().to_string()
            )
            .record(elapsed.as_secs_f64());
        }
    }

    // -- retry --------------------------------------------------------------

    fn retry_policy(&self, invocation: &Invocation) -> Option<Arc<dyn RetryActuator>> {
        let request = GovernanceRequest::from_invocation(invocation);
        if let Some(actuator) = self.inner.governance.retry_actuator(&request) {
            return Some(actuator);
        }
        let budget = self.inner.config.retry.budget_for(invocation.microservice_name());
        let policy = CompatibleRetryPolicy::new(budget)?;
        invocation.init_same_server_budget(policy.budget().same_server);
        Some(Arc::new(policy))
    }

    /// Backoff before the next attempt, or `None` when `outcome` is final.
    fn next_retry(
        &self,
        invocation: &Invocation,
        policy: &dyn RetryActuator,
        max_attempts: u32,
        outcome: &AttemptOutcome,
    ) -> Option<Duration> {
        let attempt = invocation.attempts();
        if attempt >= max_attempts || !policy.should_retry(outcome) {
            return None;
        }
        let status = match outcome {
            Ok(response) => Some(response.status()),
            Err(err) => err.status(),
        };
        warn!(
            trace_id = %invocation.trace_id(),
            operation = %invocation.qualified_name(),
            attempt,
            max_attempts,
            status = ?status,
            "retrying invocation"
        );
        counter!(
            "rpcflow_invocation_retries_total",
            "microservice" => invocation.microservice_name().to_string()
        )
        .increment(1);
        Some(policy.backoff(attempt))
    }

    fn chain_for(&self, invocation: &Invocation) -> Result<FilterNode, InvokeError> {
        Ok(self
            .inner
            .chains
            .chain_for(invocation.invocation_type(), invocation.microservice_name())?)
    }
}

fn prepare_retry(invocation: &Invocation, policy: &dyn RetryActuator) {
    let reselect = policy.is_load_balance_retry() && !invocation.try_same_server();
    invocation.prepare_retry(reselect);
}

/// Outer error boundary: an exceptional chain completion becomes a
/// consumer-failure response.
fn boundary(invocation: &Invocation, result: FilterResult) -> Response {
    result.unwrap_or_else(|err| {
        let message = format!("{err:#}");
        error!(
            trace_id = %invocation.trace_id(),
            operation = %invocation.qualified_name(),
            error = %message,
            "invocation failed"
        );
        Response::consumer_fail(err)
    })
}

/// Raw failures and internal consumer errors are raised; every other
/// response, failed or not, is returned as is.
fn complete(response: Response) -> AttemptOutcome {
    let response = response.lift_raw_fault().map_err(InvokeError::Raw)?;
    match response.fault() {
        Some(Fault::Invocation(err)) if err.is_consumer_inner() => Err(InvokeError::Invocation(err.clone())),
        _ => Ok(response),
    }
}

// ---------------------------------------------------------------------------
// InvokeService
// ---------------------------------------------------------------------------

/// Tower adapter over [`Dispatcher::invoke`].
#[derive(Clone)]
pub struct InvokeService {
    dispatcher: Dispatcher,
}

impl Service<Arc<Invocation>> for InvokeService {
    type Response = Response;
    type Error = InvokeError;
    type Future = Pin<Box<dyn Future<Output = Result<Response, InvokeError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, invocation: Arc<Invocation>) -> Self::Future {
        Box::pin(self.dispatcher.invoke(invocation))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
