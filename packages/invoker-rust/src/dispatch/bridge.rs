//! One-shot bridge between an asynchronously completing chain and a blocked
//! caller thread.
//!
//! The completion side either hands over a value with [`SyncBridge::set_response`]
//! or a command with [`ResponseExecutor::execute`]; a command runs on the
//! waiting thread and normally calls `set_response` itself. Release may happen
//! before or after the caller starts waiting.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use rpcflow_core::{InvocationError, Response};
use tracing::debug;

use crate::invocation::{Command, ResponseExecutor};

#[derive(Default)]
struct BridgeState {
    command: Option<Command>,
    response: Option<Response>,
    released: bool,
    interrupted: bool,
    /// The waiter gave up; later completions are dropped.
    abandoned: bool,
}

/// Blocking rendezvous for one synchronous attempt.
pub struct SyncBridge {
    state: Mutex<BridgeState>,
    ready: Condvar,
}

impl SyncBridge {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BridgeState::default()),
            ready: Condvar::new(),
        }
    }

    /// Stores the response. Releases the waiter unless a command was handed
    /// over, in which case that command is the releasing event.
    pub fn set_response(&self, response: Response) {
        let mut state = self.state.lock();
        state.response = Some(response);
        if state.command.is_none() && !state.released {
            state.released = true;
            self.ready.notify_all();
        }
    }

    /// Wakes the waiter without a result; it reports a timeout.
    pub fn interrupt(&self) {
        let mut state = self.state.lock();
        state.interrupted = true;
        self.ready.notify_all();
    }

    /// Blocks until released or until `timeout` elapses.
    ///
    /// A handed-over command runs on this thread before the response is read.
    /// A `timeout` too large to form a deadline waits without one.
    ///
    /// # Errors
    ///
    /// Returns a request-timeout [`InvocationError`] when nothing arrives in
    /// time or the wait is interrupted. The in-flight work is not cancelled.
    pub fn wait_and_run(&self, timeout: Duration) -> Result<Response, InvocationError> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        while !state.released {
            if state.interrupted || (self.wait(&mut state, deadline) && !state.released) {
                state.abandoned = true;
                return Err(InvocationError::request_timeout(format!(
                    "invocation timed out after {}ms",
                    timeout.as_millis()
                )));
            }
        }

        if let Some(command) = state.command.take() {
            drop(state);
            command();
            state = self.state.lock();
        }
        Ok(state.response.take().unwrap_or_else(|| {
            Response::from_error(InvocationError::consumer_inner("invocation completed without a response"))
        }))
    }

    /// Returns `true` if the deadline passed.
    fn wait(&self, state: &mut MutexGuard<'_, BridgeState>, deadline: Option<Instant>) -> bool {
        match deadline {
            Some(deadline) => self.ready.wait_until(state, deadline).timed_out(),
            None => {
                self.ready.wait(state);
                false
            }
        }
    }
}

impl Default for SyncBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseExecutor for SyncBridge {
    fn execute(&self, command: Command) {
        let mut state = self.state.lock();
        if state.released || state.abandoned {
            debug!("sync bridge already settled, dropping completion");
            return;
        }
        state.command = Some(command);
        state.released = true;
        self.ready.notify_all();
    }
}
