//! Immutable filter chain nodes.
//!
//! A chain is a singly-linked list of [`FilterNode`]s ending in a shared
//! terminal node. A transport branch node fans out to per-transport
//! sub-chains whose tails are spliced onto the node that follows the branch,
//! so every transport-specific prefix rejoins the common suffix.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use rpcflow_core::{Response, Value};

use super::{Filter, FilterFuture};
use crate::invocation::Invocation;

/// One element of a resolved chain, before linking.
pub enum ChainElement {
    Filter(Arc<dyn Filter>),
    /// Sub-chains keyed by transport tag.
    TransportBranch(BTreeMap<String, Vec<ChainElement>>),
}

enum NodeKind {
    Terminal,
    Filter {
        filter: Arc<dyn Filter>,
        next: FilterNode,
    },
    TransportBranch {
        branches: BTreeMap<String, FilterNode>,
        next: FilterNode,
    },
}

/// A link of a built filter chain. Cloning is cheap and shares the node.
#[derive(Clone)]
pub struct FilterNode {
    kind: Arc<NodeKind>,
}

impl FilterNode {
    fn new(kind: NodeKind) -> Self {
        Self {
            kind: Arc::new(kind),
        }
    }

    /// The terminal node: returns an empty success.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(NodeKind::Terminal)
    }

    /// Links `elements` into a chain ending in a terminal node.
    #[must_use]
    pub fn build(elements: Vec<ChainElement>) -> Self {
        Self::build_onto(elements, Self::empty())
    }

    // Back-to-front: each node is created after its successor exists, and a
    // branch builds its sub-chains on top of the node that follows it.
    fn build_onto(elements: Vec<ChainElement>, tail: FilterNode) -> Self {
        elements
            .into_iter()
            .rev()
            .fold(tail, |next, element| match element {
                ChainElement::Filter(filter) => Self::new(NodeKind::Filter { filter, next }),
                ChainElement::TransportBranch(sub_chains) => {
                    let branches = sub_chains
                        .into_iter()
                        .map(|(transport, items)| (transport, Self::build_onto(items, next.clone())))
                        .collect();
                    Self::new(NodeKind::TransportBranch { branches, next })
                }
            })
    }

    /// Runs this node and, transitively, the rest of the chain.
    ///
    /// A filter node whose filter is disabled for the invocation is skipped.
    /// A panic inside a filter, including one raised before its future
    /// exists, and a `Fault::Raw` failure response both come back as `Err`;
    /// typed failures stay inside `Ok`.
    #[must_use]
    pub fn on_filter(&self, invocation: Arc<Invocation>) -> FilterFuture {
        match &*self.kind {
            NodeKind::Terminal => Box::pin(std::future::ready(Ok(Response::success(Value::Null)))),
            NodeKind::Filter { filter, next } => {
                let filter = Arc::clone(filter);
                let next = next.clone();
                Box::pin(async move {
                    // Enablement and future construction run under the guard too.
                    let outcome = AssertUnwindSafe(async {
                        if filter.enabled(&invocation) {
                            filter.on_filter(invocation, next).await
                        } else {
                            next.on_filter(invocation).await
                        }
                    })
                    .catch_unwind()
                    .await;
                    match outcome {
                        Ok(Ok(response)) => response.lift_raw_fault(),
                        Ok(Err(err)) => Err(err),
                        Err(panic) => Err(anyhow::anyhow!(
                            "filter {} panicked: {}",
                            filter.name(),
                            panic_message(panic.as_ref())
                        )),
                    }
                })
            }
            NodeKind::TransportBranch { branches, next } => branches
                .get(invocation.transport())
                .unwrap_or(next)
                .on_filter(invocation),
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(*self.kind, NodeKind::Terminal)
    }

    #[must_use]
    pub fn is_transport_branch(&self) -> bool {
        matches!(*self.kind, NodeKind::TransportBranch { .. })
    }

    /// Name of the wrapped filter, for filter nodes.
    #[must_use]
    pub fn filter_name(&self) -> Option<&str> {
        match &*self.kind {
            NodeKind::Filter { filter, .. } => Some(filter.name()),
            _ => None,
        }
    }

    /// The node after this one; `None` for the terminal node.
    #[must_use]
    pub fn next(&self) -> Option<&FilterNode> {
        match &*self.kind {
            NodeKind::Terminal => None,
            NodeKind::Filter { next, .. } | NodeKind::TransportBranch { next, .. } => Some(next),
        }
    }

    /// Head of the sub-chain for `transport`, for branch nodes.
    #[must_use]
    pub fn branch(&self, transport: &str) -> Option<&FilterNode> {
        match &*self.kind {
            NodeKind::TransportBranch { branches, .. } => branches.get(transport),
            _ => None,
        }
    }

    /// Returns `true` if both handles refer to the same node.
    #[must_use]
    pub fn ptr_eq(&self, other: &FilterNode) -> bool {
        Arc::ptr_eq(&self.kind, &other.kind)
    }

    /// Renders the chain layout, e.g. `auth -> {highway: [hw-client], rest: [rest-client]} -> end`.
    #[must_use]
    pub fn describe(&self) -> String {
        let mut parts = self.describe_until(None);
        parts.push("end".to_string());
        parts.join(" -> ")
    }

    fn describe_until(&self, stop: Option<&FilterNode>) -> Vec<String> {
        let mut parts = Vec::new();
        let mut current = self;
        loop {
            if stop.is_some_and(|stop| stop.ptr_eq(current)) {
                break;
            }
            match &*current.kind {
                NodeKind::Terminal => break,
                NodeKind::Filter { filter, next } => {
                    parts.push(filter.name().to_string());
                    current = next;
                }
                NodeKind::TransportBranch { branches, next } => {
                    let rendered: Vec<String> = branches
                        .iter()
                        .map(|(transport, head)| {
                            format!("{transport}: [{}]", head.describe_until(Some(next)).join(", "))
                        })
                        .collect();
                    parts.push(format!("{{{}}}", rendered.join(", ")));
                    current = next;
                }
            }
        }
        parts
    }
}

impl fmt::Debug for FilterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FilterNode").field(&self.describe()).finish()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::pin::Pin;

    use async_trait::async_trait;
    use http::StatusCode;
    use proptest::prelude::*;
    use rpcflow_core::{transports, Fault, InvocationError, InvocationType};

    use super::*;
    use crate::filter::FilterResult;
    use crate::testing::{call_log, consumer, RecordingFilter, ScriptedFilter};

    fn filters(elements: Vec<Arc<RecordingFilter>>) -> Vec<ChainElement> {
        elements
            .into_iter()
            .map(|f| ChainElement::Filter(f as Arc<dyn Filter>))
            .collect()
    }

    #[tokio::test]
    async fn empty_chain_returns_null_success() {
        let resp = FilterNode::empty()
            .on_filter(consumer("orders", transports::REST))
            .await
            .unwrap();
        assert!(resp.is_succeeded());
        assert_eq!(resp.result(), Some(&Value::Null));
    }

    #[tokio::test]
    async fn each_filter_receives_its_successor() {
        let log = call_log();
        let f1 = Arc::new(RecordingFilter::new("f1", &log));
        let f2 = Arc::new(RecordingFilter::new("f2", &log));
        let f3 = Arc::new(RecordingFilter::new("f3", &log));

        let head = FilterNode::build(filters(vec![f1.clone(), f2.clone(), f3.clone()]));
        let resp = head.on_filter(consumer("orders", transports::REST)).await.unwrap();

        assert!(resp.is_succeeded());
        assert_eq!(resp.result(), Some(&Value::Null));
        assert_eq!(*log.lock(), vec!["f1", "f2", "f3"]);

        let node2 = head.next().unwrap();
        let node3 = node2.next().unwrap();
        assert!(f1.seen_next()[0].ptr_eq(node2));
        assert!(f2.seen_next()[0].ptr_eq(node3));
        assert!(f3.seen_next()[0].is_terminal());
        assert_eq!(node2.filter_name(), Some("f2"));
    }

    #[tokio::test]
    async fn disabled_filter_is_transparent() {
        let log = call_log();
        let a = Arc::new(RecordingFilter::new("a", &log).disabled());
        let b = Arc::new(RecordingFilter::new("b", &log));

        let with_disabled = FilterNode::build(filters(vec![a.clone(), b.clone()]));
        with_disabled
            .on_filter(consumer("orders", transports::REST))
            .await
            .unwrap();
        let first = log.lock().clone();

        log.lock().clear();
        let alone = FilterNode::build(filters(vec![b.clone()]));
        alone.on_filter(consumer("orders", transports::REST)).await.unwrap();

        assert_eq!(first, *log.lock());
        assert_eq!(first, vec!["b"]);
        assert!(a.seen_next().is_empty());
        // Structurally present: the disabled node still heads the chain.
        assert_eq!(with_disabled.filter_name(), Some("a"));
    }

    #[tokio::test]
    async fn transport_branch_rejoins_common_tail() {
        let log = call_log();
        let fa = Arc::new(RecordingFilter::new("fa", &log));
        let fb = Arc::new(RecordingFilter::new("fb", &log));
        let fc = Arc::new(RecordingFilter::new("fc", &log));

        let mut branches = BTreeMap::new();
        branches.insert(
            transports::REST.to_string(),
            vec![ChainElement::Filter(fa.clone() as Arc<dyn Filter>)],
        );
        branches.insert(
            transports::HIGHWAY.to_string(),
            vec![ChainElement::Filter(fb.clone() as Arc<dyn Filter>)],
        );
        let head = FilterNode::build(vec![
            ChainElement::TransportBranch(branches),
            ChainElement::Filter(fc.clone() as Arc<dyn Filter>),
        ]);

        head.on_filter(consumer("orders", transports::REST)).await.unwrap();
        assert_eq!(*log.lock(), vec!["fa", "fc"]);
        assert!(fb.seen_next().is_empty());

        // Both branch tails are the very node that follows the branch.
        assert!(head.is_transport_branch());
        let tail = head.next().unwrap();
        assert!(!tail.is_transport_branch());
        assert!(fa.seen_next()[0].ptr_eq(tail));
        assert!(head.branch(transports::HIGHWAY).unwrap().next().unwrap().ptr_eq(tail));
        assert_eq!(
            head.describe(),
            "{highway: [fb], rest: [fa]} -> fc -> end"
        );
    }

    #[tokio::test]
    async fn unmatched_transport_skips_branch() {
        let log = call_log();
        let fa = Arc::new(RecordingFilter::new("fa", &log));
        let fc = Arc::new(RecordingFilter::new("fc", &log));
        let mut branches = BTreeMap::new();
        branches.insert(
            transports::REST.to_string(),
            vec![ChainElement::Filter(fa as Arc<dyn Filter>)],
        );
        let head = FilterNode::build(vec![
            ChainElement::TransportBranch(branches),
            ChainElement::Filter(fc as Arc<dyn Filter>),
        ]);

        head.on_filter(consumer("orders", "grpc")).await.unwrap();
        assert_eq!(*log.lock(), vec!["fc"]);
    }

    #[tokio::test]
    async fn raw_failure_becomes_error() {
        let filter = ScriptedFilter::new("raw")
            .then(|| Ok(Response::raw(anyhow::anyhow!("socket reset"))));
        let head = FilterNode::build(vec![ChainElement::Filter(Arc::new(filter))]);
        let err = head
            .on_filter(consumer("orders", transports::REST))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "socket reset");
    }

    #[tokio::test]
    async fn typed_failure_stays_a_response() {
        let filter = ScriptedFilter::new("typed").then(|| {
            Ok(Response::from_error(InvocationError::new(
                StatusCode::BAD_REQUEST,
                "invalid argument",
            )))
        });
        let head = FilterNode::build(vec![ChainElement::Filter(Arc::new(filter))]);
        let resp = head
            .on_filter(consumer("orders", transports::REST))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(matches!(resp.fault(), Some(Fault::Invocation(_))));
    }

    struct PanickingFilter;

    #[async_trait]
    impl Filter for PanickingFilter {
        fn name(&self) -> &str {
            "panicky"
        }

        async fn on_filter(&self, _invocation: Arc<Invocation>, _next: FilterNode) -> FilterResult {
            panic!("bad state");
        }
    }

    #[tokio::test]
    async fn panic_is_captured_as_error() {
        let log = call_log();
        let after = Arc::new(RecordingFilter::new("after", &log));
        let head = FilterNode::build(vec![
            ChainElement::Filter(Arc::new(PanickingFilter)),
            ChainElement::Filter(after as Arc<dyn Filter>),
        ]);
        let err = head
            .on_filter(consumer("orders", transports::REST))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "filter panicky panicked: bad state");
        assert!(log.lock().is_empty(), "failure halts the chain");
    }

    /// Panics while building its future, before anything is polled.
    struct EagerPanicFilter;

    impl Filter for EagerPanicFilter {
        fn name(&self) -> &str {
            "eager"
        }

        fn on_filter<'life0, 'async_trait>(
            &'life0 self,
            _invocation: Arc<Invocation>,
            _next: FilterNode,
        ) -> Pin<Box<dyn Future<Output = FilterResult> + Send + 'async_trait>>
        where
            'life0: 'async_trait,
            Self: 'async_trait,
        {
            panic!("rejected before polling");
        }
    }

    #[tokio::test]
    async fn panic_before_future_is_captured_as_error() {
        let log = call_log();
        let after = Arc::new(RecordingFilter::new("after", &log));
        let head = FilterNode::build(vec![
            ChainElement::Filter(Arc::new(EagerPanicFilter)),
            ChainElement::Filter(after as Arc<dyn Filter>),
        ]);
        let outcome = AssertUnwindSafe(head.on_filter(consumer("orders", transports::REST)))
            .catch_unwind()
            .await;
        let err = outcome.expect("panic stays inside the chain future").unwrap_err();
        assert_eq!(err.to_string(), "filter eager panicked: rejected before polling");
        assert!(log.lock().is_empty());
    }

    struct BrokenEnablementFilter;

    #[async_trait]
    impl Filter for BrokenEnablementFilter {
        fn name(&self) -> &str {
            "broken-enablement"
        }

        fn enabled_for_transport(&self, _transport: &str) -> bool {
            panic!("no transport table");
        }

        async fn on_filter(&self, invocation: Arc<Invocation>, next: FilterNode) -> FilterResult {
            next.on_filter(invocation).await
        }
    }

    #[tokio::test]
    async fn panic_in_enablement_is_captured_as_error() {
        let head = FilterNode::build(vec![ChainElement::Filter(Arc::new(BrokenEnablementFilter))]);
        let outcome = AssertUnwindSafe(head.on_filter(consumer("orders", transports::REST)))
            .catch_unwind()
            .await;
        let err = outcome.expect("panic stays inside the chain future").unwrap_err();
        assert_eq!(err.to_string(), "filter broken-enablement panicked: no transport table");
    }

    #[tokio::test]
    async fn producer_only_filter_skipped_for_consumer() {
        let log = call_log();
        let p = Arc::new(RecordingFilter::new("p", &log).only(InvocationType::Producer));
        let c = Arc::new(RecordingFilter::new("c", &log));
        let head = FilterNode::build(filters(vec![p, c]));
        head.on_filter(consumer("orders", transports::REST)).await.unwrap();
        assert_eq!(*log.lock(), vec!["c"]);
    }

    proptest! {
        #[test]
        fn enabled_filters_run_once_in_order(enabled in proptest::collection::vec(any::<bool>(), 1..8)) {
            let log = call_log();
            let elements: Vec<Arc<RecordingFilter>> = enabled
                .iter()
                .enumerate()
                .map(|(i, on)| {
                    let filter = RecordingFilter::new(&format!("f{i}"), &log);
                    Arc::new(if *on { filter } else { filter.disabled() })
                })
                .collect();
            let head = FilterNode::build(filters(elements));

            let resp = futures_util::FutureExt::now_or_never(
                head.on_filter(consumer("orders", transports::REST)),
            )
            .expect("chain of inline filters completes immediately")
            .unwrap();
            prop_assert!(resp.is_succeeded());

            let expected: Vec<String> = enabled
                .iter()
                .enumerate()
                .filter(|(_, on)| **on)
                .map(|(i, _)| format!("f{i}"))
                .collect();
            prop_assert_eq!(log.lock().clone(), expected);
        }
    }
}
