use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};

/// Dedicated runtime for retry backoff timers, owned by the dispatcher.
///
/// Dropping the scheduler shuts the runtime down without waiting for
/// pending timers.
pub struct RetryScheduler {
    runtime: Option<Runtime>,
    handle: Handle,
}

impl RetryScheduler {
    /// # Errors
    ///
    /// Returns the I/O error of the runtime builder if threads can't be spawned.
    pub fn new(worker_threads: usize) -> io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name("rpcflow-retry")
            .enable_time()
            .build()?;
        let handle = runtime.handle().clone();
        Ok(Self {
            runtime: Some(runtime),
            handle,
        })
    }

    #[must_use]
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Completes after `duration`, timed on the scheduler's threads.
    pub fn delay(&self, duration: Duration) -> impl Future<Output = ()> + Send + 'static {
        let timer = (!duration.is_zero()).then(|| self.handle.spawn(tokio::time::sleep(duration)));
        async move {
            if let Some(timer) = timer {
                // A cancelled timer means the scheduler is shutting down.
                let _ = timer.await;
            }
        }
    }
}

impl Drop for RetryScheduler {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
