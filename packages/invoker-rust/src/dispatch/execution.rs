use std::cell::Cell;
use std::future::Future;

use futures_util::future::{poll_fn, BoxFuture};
use tokio::runtime::{Builder, Handle};

/// Where invocation chains run, and whether the caller sits on an event loop.
pub trait ExecutionContext: Send + Sync {
    /// `true` when the current thread drives cooperative I/O and must not block.
    fn in_event_loop(&self) -> bool;

    /// Runs `task` to completion without blocking the caller.
    fn spawn(&self, task: BoxFuture<'static, ()>);
}

thread_local! {
    static SCHEDULER_THREAD: Cell<bool> = const { Cell::new(false) };
    static LOOP_POLLS: Cell<u32> = const { Cell::new(0) };
}

/// Installs park hooks that flag the runtime's scheduler threads as event
/// loops.
///
/// Only scheduler threads park, so `spawn_blocking` threads never carry the
/// flag. A worker is recognized from its first park on.
pub fn mark_scheduler_threads(builder: &mut Builder) -> &mut Builder {
    builder
        .on_thread_park(|| SCHEDULER_THREAD.with(|flag| flag.set(true)))
        .on_thread_unpark(|| SCHEDULER_THREAD.with(|flag| flag.set(true)))
}

/// Polls `future` as event-loop work: while it is being polled the thread
/// counts as an event loop.
pub async fn event_loop_scope<F: Future>(future: F) -> F::Output {
    let mut future = std::pin::pin!(future);
    poll_fn(|cx| {
        let _scope = LoopScope::enter();
        future.as_mut().poll(cx)
    })
    .await
}

/// `true` on a marked scheduler thread or inside [`event_loop_scope`].
#[must_use]
pub fn is_event_loop_thread() -> bool {
    SCHEDULER_THREAD.with(Cell::get) || LOOP_POLLS.with(Cell::get) > 0
}

struct LoopScope;

impl LoopScope {
    fn enter() -> Self {
        LOOP_POLLS.with(|polls| polls.set(polls.get() + 1));
        Self
    }
}

impl Drop for LoopScope {
    fn drop(&mut self) {
        LOOP_POLLS.with(|polls| polls.set(polls.get() - 1));
    }
}

// ---------------------------------------------------------------------------
// TokioExecution
// ---------------------------------------------------------------------------

/// Runs chains on a tokio runtime.
///
/// Spawned chains are polled inside [`event_loop_scope`]. Other threads of the
/// runtime count as event loops only when it was built through
/// [`mark_scheduler_threads`].
#[derive(Debug, Clone)]
pub struct TokioExecution {
    handle: Handle,
}

impl TokioExecution {
    #[must_use]
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Wraps the runtime of the calling thread, if any.
    #[must_use]
    pub fn try_current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }

    #[must_use]
    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl ExecutionContext for TokioExecution {
    fn in_event_loop(&self) -> bool {
        is_event_loop_thread()
    }

    fn spawn(&self, task: BoxFuture<'static, ()>) {
        drop(self.handle.spawn(event_loop_scope(task)));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::FutureExt;
    use tokio::sync::oneshot;

    use super::*;

    #[test]
    fn plain_thread_is_not_an_event_loop() {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let execution = TokioExecution::new(runtime.handle().clone());
        assert!(!execution.in_event_loop());
        assert!(TokioExecution::try_current().is_none());
    }

    #[test]
    fn scope_marks_only_while_polling() {
        let inside = event_loop_scope(async {
            let nested = event_loop_scope(async { is_event_loop_thread() }).await;
            nested && is_event_loop_thread()
        })
        .now_or_never()
        .unwrap();
        assert!(inside);
        assert!(!is_event_loop_thread());
    }

    #[tokio::test]
    async fn spawned_chain_task_is_an_event_loop() {
        let execution = TokioExecution::try_current().unwrap();
        let context = execution.clone();
        let (tx, rx) = oneshot::channel();
        execution.spawn(Box::pin(async move {
            let _ = tx.send(context.in_event_loop());
        }));
        assert!(rx.await.unwrap());
    }

    #[test]
    fn scheduler_threads_marked_blocking_threads_not() {
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        let runtime = mark_scheduler_threads(&mut builder)
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();

        let (on_worker, on_blocking) = runtime.block_on(async {
            let on_worker = tokio::spawn(async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                is_event_loop_thread()
            })
            .await
            .unwrap();
            let on_blocking = tokio::task::spawn_blocking(is_event_loop_thread).await.unwrap();
            (on_worker, on_blocking)
        });
        assert!(on_worker);
        assert!(!on_blocking);
    }
}
