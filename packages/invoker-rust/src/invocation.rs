//! Per-call invocation state.
//!
//! An [`Invocation`] is created once per logical call by an external factory,
//! shared as `Arc<Invocation>` with every filter of the chain, and reset (not
//! recreated) between retry attempts. Attempt bookkeeping follows the state
//! machine `Created -> Started -> Dispatching -> Finished`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use rpcflow_core::{Endpoint, InvocationType, OperationMeta, Response, Value};

/// Context key under which the trace identifier travels.
pub const TRACE_ID_KEY: &str = "X-B3-TraceId";

// ---------------------------------------------------------------------------
// Response executor
// ---------------------------------------------------------------------------

/// Deferred completion work.
pub type Command = Box<dyn FnOnce() + Send + 'static>;

/// Decides which thread runs completion work for an invocation.
///
/// Synchronous calls install a `SyncBridge` so that completion runs on the
/// blocked caller thread instead of the dispatch thread.
pub trait ResponseExecutor: Send + Sync {
    fn execute(&self, command: Command);
}

/// Runs commands inline on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct SameThreadExecutor;

impl ResponseExecutor for SameThreadExecutor {
    fn execute(&self, command: Command) {
        command();
    }
}

// ---------------------------------------------------------------------------
// Observer hooks
// ---------------------------------------------------------------------------

/// Receives the start and finish hooks of every attempt.
///
/// `on_finish` fires exactly once per attempt and never before `on_start`.
pub trait InvocationObserver: Send + Sync {
    fn on_start(&self, _invocation: &Invocation) {}

    fn on_finish(&self, _invocation: &Invocation, _response: &Response) {}
}

// ---------------------------------------------------------------------------
// Attempt state
// ---------------------------------------------------------------------------

/// Lifecycle of the current attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    Created,
    Started,
    Dispatching,
    Finished,
}

/// Retry bookkeeping carried across attempts of one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryContext {
    attempts: u32,
    same_server_budget: u32,
    retrying: bool,
}

impl RetryContext {
    /// Number of attempts started so far (the first call counts).
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Remaining retries that may reuse the current endpoint.
    #[must_use]
    pub fn same_server_budget(&self) -> u32 {
        self.same_server_budget
    }

    /// Returns `true` once the invocation has been retried.
    #[must_use]
    pub fn is_retry(&self) -> bool {
        self.retrying
    }

    /// Consumes one same-server retry if any is left.
    pub fn try_same_server(&mut self) -> bool {
        if self.same_server_budget == 0 {
            return false;
        }
        self.same_server_budget -= 1;
        true
    }
}

/// Timing marks of the invocation and of its current attempt.
#[derive(Debug, Clone, Copy)]
pub struct InvocationTimings {
    pub created: Instant,
    /// Start of the first attempt.
    pub first_started: Option<Instant>,
    pub started: Option<Instant>,
    pub dispatched: Option<Instant>,
    pub finished: Option<Instant>,
}

impl InvocationTimings {
    fn new() -> Self {
        Self {
            created: Instant::now(),
            first_started: None,
            started: None,
            dispatched: None,
            finished: None,
        }
    }

    /// Duration of the current attempt, once finished.
    #[must_use]
    pub fn attempt_duration(&self) -> Option<Duration> {
        Some(self.finished?.saturating_duration_since(self.started?))
    }

    /// Duration from the first start to the latest finish.
    #[must_use]
    pub fn total_duration(&self) -> Option<Duration> {
        Some(self.finished?.saturating_duration_since(self.first_started?))
    }
}

struct AttemptState {
    state: InvocationState,
    sync: bool,
    retry: RetryContext,
    timings: InvocationTimings,
    endpoint: Option<Endpoint>,
    response_executor: Arc<dyn ResponseExecutor>,
}

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// Mutable per-call state flowing through the filter chain.
pub struct Invocation {
    operation: Arc<OperationMeta>,
    invocation_type: InvocationType,
    transport: String,
    arguments: HashMap<String, Value>,
    /// String context propagated to the remote side (trace id, headers).
    context: DashMap<String, String>,
    /// Process-local scratch space shared between filters.
    local_context: DashMap<String, Value>,
    attempt: Mutex<AttemptState>,
}

impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("operation", &self.operation.qualified_name())
            .field("invocation_type", &self.invocation_type)
            .field("transport", &self.transport)
            .field("state", &self.state())
            .field("attempts", &self.attempts())
            .finish_non_exhaustive()
    }
}

impl Invocation {
    /// Starts building a consumer invocation for `operation` over `transport`.
    #[must_use]
    pub fn consumer(operation: Arc<OperationMeta>, transport: impl Into<String>) -> InvocationBuilder {
        InvocationBuilder::new(operation, InvocationType::Consumer, transport.into())
    }

    /// Starts building a producer invocation for `operation` over `transport`.
    #[must_use]
    pub fn producer(operation: Arc<OperationMeta>, transport: impl Into<String>) -> InvocationBuilder {
        InvocationBuilder::new(operation, InvocationType::Producer, transport.into())
    }

    #[must_use]
    pub fn operation(&self) -> &OperationMeta {
        &self.operation
    }

    #[must_use]
    pub fn microservice_name(&self) -> &str {
        &self.operation.microservice_name
    }

    #[must_use]
    pub fn qualified_name(&self) -> String {
        self.operation.qualified_name()
    }

    #[must_use]
    pub fn invocation_type(&self) -> InvocationType {
        self.invocation_type
    }

    #[must_use]
    pub fn transport(&self) -> &str {
        &self.transport
    }

    #[must_use]
    pub fn arguments(&self) -> &HashMap<String, Value> {
        &self.arguments
    }

    #[must_use]
    pub fn argument(&self, name: &str) -> Option<&Value> {
        self.arguments.get(name)
    }

    // -- context ------------------------------------------------------------

    #[must_use]
    pub fn context(&self, key: &str) -> Option<String> {
        self.context.get(key).map(|entry| entry.value().clone())
    }

    pub fn add_context(&self, key: impl Into<String>, value: impl Into<String>) {
        self.context.insert(key.into(), value.into());
    }

    /// Snapshot of the propagated context.
    #[must_use]
    pub fn context_snapshot(&self) -> HashMap<String, String> {
        self.context
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    #[must_use]
    pub fn trace_id(&self) -> String {
        self.context(TRACE_ID_KEY).unwrap_or_default()
    }

    #[must_use]
    pub fn local(&self, key: &str) -> Option<Value> {
        self.local_context.get(key).map(|entry| entry.value().clone())
    }

    pub fn set_local(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.local_context.insert(key.into(), value.into());
    }

    pub fn remove_local(&self, key: &str) -> Option<Value> {
        self.local_context.remove(key).map(|(_, value)| value)
    }

    // -- mode and sinks -----------------------------------------------------

    #[must_use]
    pub fn is_sync(&self) -> bool {
        self.attempt.lock().sync
    }

    pub fn set_sync(&self, sync: bool) {
        self.attempt.lock().sync = sync;
    }

    #[must_use]
    pub fn response_executor(&self) -> Arc<dyn ResponseExecutor> {
        Arc::clone(&self.attempt.lock().response_executor)
    }

    pub fn set_response_executor(&self, executor: Arc<dyn ResponseExecutor>) {
        self.attempt.lock().response_executor = executor;
    }

    // -- endpoint and retry -------------------------------------------------

    #[must_use]
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.attempt.lock().endpoint.clone()
    }

    pub fn set_endpoint(&self, endpoint: Option<Endpoint>) {
        self.attempt.lock().endpoint = endpoint;
    }

    #[must_use]
    pub fn retry_context(&self) -> RetryContext {
        self.attempt.lock().retry.clone()
    }

    /// Number of attempts started so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempt.lock().retry.attempts
    }

    /// Sets the number of retries that may reuse the current endpoint.
    pub fn init_same_server_budget(&self, budget: u32) {
        self.attempt.lock().retry.same_server_budget = budget;
    }

    /// Consumes one same-server retry if any is left.
    pub fn try_same_server(&self) -> bool {
        self.attempt.lock().retry.try_same_server()
    }

    // -- lifecycle ----------------------------------------------------------

    #[must_use]
    pub fn state(&self) -> InvocationState {
        self.attempt.lock().state
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state() == InvocationState::Finished
    }

    #[must_use]
    pub fn timings(&self) -> InvocationTimings {
        self.attempt.lock().timings
    }

    /// Start hook: begins a new attempt and returns its number (1-based).
    pub fn on_start(&self) -> u32 {
        let mut attempt = self.attempt.lock();
        let now = Instant::now();
        attempt.state = InvocationState::Started;
        attempt.retry.attempts += 1;
        attempt.timings.started = Some(now);
        attempt.timings.dispatched = None;
        attempt.timings.finished = None;
        attempt.timings.first_started.get_or_insert(now);
        attempt.retry.attempts
    }

    /// Marks the chain of the current attempt as executing.
    pub fn on_dispatch(&self) {
        let mut attempt = self.attempt.lock();
        if attempt.state == InvocationState::Started {
            attempt.state = InvocationState::Dispatching;
            attempt.timings.dispatched = Some(Instant::now());
        }
    }

    /// Finish hook. Returns `true` only for the first call of an attempt that
    /// has been started; repeated or premature calls are ignored.
    pub fn on_finish(&self, _response: &Response) -> bool {
        let mut attempt = self.attempt.lock();
        match attempt.state {
            InvocationState::Started | InvocationState::Dispatching => {
                attempt.state = InvocationState::Finished;
                attempt.timings.finished = Some(Instant::now());
                true
            }
            InvocationState::Created | InvocationState::Finished => false,
        }
    }

    /// Resets the invocation for another attempt.
    ///
    /// With `reselect_endpoint` the resolved endpoint is cleared so the load
    /// balancer has to choose a new one.
    pub fn prepare_retry(&self, reselect_endpoint: bool) {
        let mut attempt = self.attempt.lock();
        attempt.state = InvocationState::Created;
        attempt.retry.retrying = true;
        if reselect_endpoint {
            attempt.endpoint = None;
        }
    }
}

// ---------------------------------------------------------------------------
// InvocationBuilder
// ---------------------------------------------------------------------------

/// Builder used by invocation factories.
pub struct InvocationBuilder {
    operation: Arc<OperationMeta>,
    invocation_type: InvocationType,
    transport: String,
    arguments: HashMap<String, Value>,
    context: HashMap<String, String>,
    endpoint: Option<Endpoint>,
}

impl InvocationBuilder {
    fn new(operation: Arc<OperationMeta>, invocation_type: InvocationType, transport: String) -> Self {
        Self {
            operation,
            invocation_type,
            transport,
            arguments: HashMap::new(),
            context: HashMap::new(),
            endpoint: None,
        }
    }

    #[must_use]
    pub fn argument(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn arguments(mut self, arguments: HashMap<String, Value>) -> Self {
        self.arguments.extend(arguments);
        self
    }

    #[must_use]
    pub fn context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Finishes the invocation, generating a trace id when none was given.
    #[must_use]
    pub fn build(self) -> Arc<Invocation> {
        let context: DashMap<String, String> = self.context.into_iter().collect();
        context
            .entry(TRACE_ID_KEY.to_string())
            .or_insert_with(|| uuid::Uuid::new_v4().simple().to_string());

        Arc::new(Invocation {
            operation: self.operation,
            invocation_type: self.invocation_type,
            transport: self.transport,
            arguments: self.arguments,
            context,
            local_context: DashMap::new(),
            attempt: Mutex::new(AttemptState {
                state: InvocationState::Created,
                sync: true,
                retry: RetryContext::default(),
                timings: InvocationTimings::new(),
                endpoint: self.endpoint,
                response_executor: Arc::new(SameThreadExecutor),
            }),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use rpcflow_core::transports;

    use super::*;

    fn make_invocation() -> Arc<Invocation> {
        let operation = Arc::new(OperationMeta::new("orders", "OrderApi", "create"));
        Invocation::consumer(operation, transports::REST)
            .argument("id", 7_i64)
            .endpoint(Endpoint::new(transports::REST, "10.0.0.1:8080"))
            .build()
    }

    #[test]
    fn builder_generates_trace_id() {
        let invocation = make_invocation();
        assert_eq!(invocation.trace_id().len(), 32);
        assert_eq!(invocation.argument("id"), Some(&Value::Int(7)));
        assert_eq!(invocation.state(), InvocationState::Created);
    }

    #[test]
    fn builder_keeps_given_trace_id() {
        let operation = Arc::new(OperationMeta::new("orders", "OrderApi", "create"));
        let invocation = Invocation::consumer(operation, transports::REST)
            .context(TRACE_ID_KEY, "abc")
            .build();
        assert_eq!(invocation.trace_id(), "abc");
    }

    #[test]
    fn finish_fires_once_per_attempt() {
        let invocation = make_invocation();
        let response = Response::success(Value::Null);

        assert!(!invocation.on_finish(&response), "finish before start");
        assert_eq!(invocation.on_start(), 1);
        invocation.on_dispatch();
        assert_eq!(invocation.state(), InvocationState::Dispatching);
        assert!(invocation.on_finish(&response));
        assert!(!invocation.on_finish(&response));

        invocation.prepare_retry(false);
        assert_eq!(invocation.on_start(), 2);
        assert!(invocation.on_finish(&response));
        assert!(invocation.retry_context().is_retry());
        assert!(invocation.timings().attempt_duration().is_some());
        assert!(invocation.timings().total_duration().is_some());
    }

    #[test]
    fn retry_clears_endpoint_only_on_reselect() {
        let invocation = make_invocation();
        invocation.prepare_retry(false);
        assert!(invocation.endpoint().is_some());
        invocation.prepare_retry(true);
        assert!(invocation.endpoint().is_none());
    }

    #[test]
    fn same_server_budget_is_consumed() {
        let invocation = make_invocation();
        invocation.init_same_server_budget(1);
        assert!(invocation.try_same_server());
        assert!(!invocation.try_same_server());
        assert_eq!(invocation.retry_context().same_server_budget(), 0);
    }

    #[test]
    fn local_context_roundtrip() {
        let invocation = make_invocation();
        invocation.set_local("lb.attempt", 3_i64);
        assert_eq!(invocation.local("lb.attempt"), Some(Value::Int(3)));
        assert_eq!(invocation.remove_local("lb.attempt"), Some(Value::Int(3)));
        assert!(invocation.local("lb.attempt").is_none());
    }

    #[test]
    fn same_thread_executor_runs_inline() {
        let ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&ran);
        SameThreadExecutor.execute(Box::new(move || *flag.lock() = true));
        assert!(*ran.lock());
    }
}
