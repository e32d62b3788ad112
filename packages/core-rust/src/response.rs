//! Tagged success/failure response envelope.

use std::collections::BTreeMap;

use http::StatusCode;

use crate::error::{consumer_inner_status, InvocationError};
use crate::types::Value;

/// Failure payload of a [`Response`].
///
/// The variant is the flag that separates typed, caller-visible errors from
/// opaque failures that the chain has to normalize.
#[derive(Debug, thiserror::Error)]
pub enum Fault {
    /// Status-coded error the caller may branch on.
    #[error(transparent)]
    Invocation(InvocationError),
    /// Opaque error without a status contract.
    #[error(transparent)]
    Raw(anyhow::Error),
}

impl Fault {
    /// Returns `true` for [`Fault::Raw`].
    #[must_use]
    pub fn is_raw(&self) -> bool {
        matches!(self, Fault::Raw(_))
    }

    /// Status code implied by this fault. Raw faults map to 490.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Fault::Invocation(err) => err.status(),
            Fault::Raw(_) => consumer_inner_status(),
        }
    }
}

/// Result of one invocation attempt.
///
/// Exactly one of success or failure holds: the body is a `Result`.
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: BTreeMap<String, String>,
    body: Result<Value, Fault>,
}

impl Response {
    /// Successful response with status 200.
    #[must_use]
    pub fn success(result: impl Into<Value>) -> Self {
        Self::success_with_status(StatusCode::OK, result)
    }

    #[must_use]
    pub fn success_with_status(status: StatusCode, result: impl Into<Value>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: Ok(result.into()),
        }
    }

    /// Failure response; the status is taken from the fault.
    #[must_use]
    pub fn failure(fault: Fault) -> Self {
        Self {
            status: fault.status(),
            headers: BTreeMap::new(),
            body: Err(fault),
        }
    }

    /// Failure response carrying a typed error.
    #[must_use]
    pub fn from_error(err: InvocationError) -> Self {
        Self::failure(Fault::Invocation(err))
    }

    /// Failure response carrying an opaque error.
    #[must_use]
    pub fn raw(err: anyhow::Error) -> Self {
        Self::failure(Fault::Raw(err))
    }

    /// Converts an arbitrary consumer-side error into a typed failure.
    ///
    /// An `InvocationError` inside `err` is kept as is; anything else becomes
    /// a 490 consumer-inner error whose message is the full cause chain and
    /// which keeps the original error as its cause.
    #[must_use]
    pub fn consumer_fail(err: anyhow::Error) -> Self {
        match err.downcast::<InvocationError>() {
            Ok(typed) => Self::from_error(typed),
            Err(other) => Self::from_error(
                InvocationError::consumer_inner(format!("{other:#}")).with_cause(other),
            ),
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    #[must_use]
    pub fn is_succeeded(&self) -> bool {
        self.body.is_ok()
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.body.is_err()
    }

    /// The success payload, if any.
    #[must_use]
    pub fn result(&self) -> Option<&Value> {
        self.body.as_ref().ok()
    }

    /// The failure payload, if any.
    #[must_use]
    pub fn fault(&self) -> Option<&Fault> {
        self.body.as_ref().err()
    }

    /// Returns `true` if this is a failure whose payload is opaque.
    #[must_use]
    pub fn is_raw_failure(&self) -> bool {
        self.fault().is_some_and(Fault::is_raw)
    }

    #[must_use]
    pub fn into_body(self) -> Result<Value, Fault> {
        self.body
    }

    /// Splits an opaque failure out of the response.
    ///
    /// Returns `Err` with the raw error when the body is [`Fault::Raw`],
    /// otherwise hands the response back unchanged.
    ///
    /// # Errors
    ///
    /// Returns the opaque error carried by a raw failure.
    pub fn lift_raw_fault(self) -> Result<Self, anyhow::Error> {
        match self.body {
            Err(Fault::Raw(err)) => Err(err),
            body => Ok(Self {
                status: self.status,
                headers: self.headers,
                body,
            }),
        }
    }

    #[must_use]
    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name.into(), value.into());
    }

    /// Builder-style variant of [`Response::set_header`].
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }
}
