//! Shared fixtures for unit tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rpcflow_core::{InvocationType, OperationConfig, OperationMeta, Response};

use crate::filter::{Filter, FilterNode, FilterResult};
use crate::invocation::Invocation;

pub(crate) type CallLog = Arc<Mutex<Vec<String>>>;

pub(crate) fn call_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub(crate) fn operation(microservice: &str) -> Arc<OperationMeta> {
    Arc::new(OperationMeta::new(microservice, "TestSchema", "call"))
}

pub(crate) fn operation_with_timeout(microservice: &str, invocation_timeout: Duration) -> Arc<OperationMeta> {
    Arc::new(
        OperationMeta::new(microservice, "TestSchema", "call").with_config(OperationConfig {
            request_timeout: Duration::from_secs(30),
            invocation_timeout: Some(invocation_timeout),
        }),
    )
}

pub(crate) fn consumer(microservice: &str, transport: &str) -> Arc<Invocation> {
    Invocation::consumer(operation(microservice), transport).build()
}

/// Logs its name, remembers the `next` it was handed, and delegates.
pub(crate) struct RecordingFilter {
    name: String,
    log: CallLog,
    enabled: bool,
    only_type: Option<InvocationType>,
    order: i32,
    seen_next: Mutex<Vec<FilterNode>>,
}

impl RecordingFilter {
    pub(crate) fn new(name: &str, log: &CallLog) -> Self {
        Self {
            name: name.to_string(),
            log: Arc::clone(log),
            enabled: true,
            only_type: None,
            order: 0,
            seen_next: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub(crate) fn only(mut self, invocation_type: InvocationType) -> Self {
        self.only_type = Some(invocation_type);
        self
    }

    pub(crate) fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub(crate) fn seen_next(&self) -> Vec<FilterNode> {
        self.seen_next.lock().clone()
    }
}

#[async_trait]
impl Filter for RecordingFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn order(&self, _invocation_type: InvocationType, _microservice: &str) -> i32 {
        self.order
    }

    fn enabled_for_invocation_type(&self, invocation_type: InvocationType) -> bool {
        self.enabled && self.only_type.map_or(true, |only| only == invocation_type)
    }

    async fn on_filter(&self, invocation: Arc<Invocation>, next: FilterNode) -> FilterResult {
        self.log.lock().push(self.name.clone());
        self.seen_next.lock().push(next.clone());
        next.on_filter(invocation).await
    }
}

/// Answers each call with the next scripted outcome; never calls `next`.
pub(crate) struct ScriptedFilter {
    name: String,
    script: Mutex<VecDeque<Box<dyn FnOnce() -> FilterResult + Send>>>,
    calls: Mutex<u32>,
}

impl ScriptedFilter {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(0),
        }
    }

    pub(crate) fn then(self, outcome: impl FnOnce() -> FilterResult + Send + 'static) -> Self {
        self.script.lock().push_back(Box::new(outcome));
        self
    }

    pub(crate) fn calls(&self) -> u32 {
        *self.calls.lock()
    }
}

#[async_trait]
impl Filter for ScriptedFilter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_filter(&self, _invocation: Arc<Invocation>, _next: FilterNode) -> FilterResult {
        *self.calls.lock() += 1;
        let outcome = self.script.lock().pop_front();
        match outcome {
            Some(outcome) => outcome(),
            None => Ok(Response::success("default")),
        }
    }
}

/// Never completes.
pub(crate) struct HangingFilter;

#[async_trait]
impl Filter for HangingFilter {
    fn name(&self) -> &str {
        "hanging"
    }

    async fn on_filter(&self, _invocation: Arc<Invocation>, _next: FilterNode) -> FilterResult {
        std::future::pending().await
    }
}
