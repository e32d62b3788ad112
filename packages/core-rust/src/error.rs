//! Typed invocation errors and transient transport failures.

use std::fmt;
use std::sync::Arc;

use http::StatusCode;

use crate::types::Value;

/// Reserved status codes used by the invocation runtime.
pub mod status {
    /// Unexpected failure on the consumer side of an invocation.
    ///
    /// Typed errors carrying this code are rethrown to callers instead of
    /// being returned as failure responses.
    pub const CONSUMER_INNER: u16 = 490;

    /// Unexpected failure on the producer side of an invocation.
    pub const PRODUCER_INNER: u16 = 590;
}

/// A typed, status-coded invocation error.
///
/// These travel inside failure responses so callers can branch on the status
/// code. Only the [`status::CONSUMER_INNER`] code is surfaced as an error by
/// the dispatcher.
#[derive(Debug, Clone)]
pub struct InvocationError {
    status: StatusCode,
    message: String,
    data: Option<Value>,
    /// Underlying error this one was converted from, if any.
    cause: Option<Arc<anyhow::Error>>,
}

impl InvocationError {
    /// Creates an error with the given status and message.
    #[must_use]
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            data: None,
            cause: None,
        }
    }

    /// Creates an internal consumer error (status 490).
    #[must_use]
    pub fn consumer_inner(message: impl Into<String>) -> Self {
        Self::new(consumer_inner_status(), message)
    }

    /// Creates an internal producer error (status 590).
    #[must_use]
    pub fn producer_inner(message: impl Into<String>) -> Self {
        Self::new(producer_inner_status(), message)
    }

    /// Creates a request-timeout error (status 408).
    #[must_use]
    pub fn request_timeout(message: impl Into<String>) -> Self {
        Self::new(StatusCode::REQUEST_TIMEOUT, message)
    }

    /// Attaches an error payload returned by the remote side.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Records the error this one was converted from.
    #[must_use]
    pub fn with_cause(mut self, cause: anyhow::Error) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    #[must_use]
    pub fn cause(&self) -> Option<&anyhow::Error> {
        self.cause.as_deref()
    }

    /// Returns `true` if this error carries the reserved consumer-inner code.
    #[must_use]
    pub fn is_consumer_inner(&self) -> bool {
        self.status.as_u16() == status::CONSUMER_INNER
    }
}

// Equality ignores the cause: two errors are the same if the caller would
// observe the same status, message and payload.
impl PartialEq for InvocationError {
    fn eq(&self, other: &Self) -> bool {
        self.status == other.status && self.message == other.message && self.data == other.data
    }
}

impl fmt::Display for InvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invocation failed with status {}: {}",
            self.status.as_u16(),
            self.message
        )
    }
}

impl std::error::Error for InvocationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| &**cause as &(dyn std::error::Error + 'static))
    }
}

/// Transient transport failures. Raised by transport filters and wrapped as
/// raw faults; the compatible retry policy treats them as retriable.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection refused: {address}")]
    ConnectRefused { address: String },
    #[error("connect to {address} timed out after {timeout_ms}ms")]
    ConnectTimeout { address: String, timeout_ms: u64 },
    #[error("connection to {address} closed")]
    ConnectionClosed { address: String },
    #[error("no route to host: {address}")]
    NoRouteToHost { address: String },
}

/// Status code for internal consumer errors.
#[must_use]
pub fn consumer_inner_status() -> StatusCode {
    StatusCode::from_u16(status::CONSUMER_INNER).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// Status code for internal producer errors.
#[must_use]
pub fn producer_inner_status() -> StatusCode {
    StatusCode::from_u16(status::PRODUCER_INNER).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}
