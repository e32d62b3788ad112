//! Resolved operation metadata and endpoints.
//!
//! Operations and endpoints are resolved by discovery and schema layers
//! outside this workspace; the invoker only reads them.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Well-known transport tags.
pub mod transports {
    pub const REST: &str = "rest";
    pub const HIGHWAY: &str = "highway";
}

/// Direction of an invocation relative to this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationType {
    /// Outgoing call made by this process.
    Consumer,
    /// Incoming call served by this process.
    Producer,
}

impl fmt::Display for InvocationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvocationType::Consumer => f.write_str("consumer"),
            InvocationType::Producer => f.write_str("producer"),
        }
    }
}

/// Per-operation timeout configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationConfig {
    /// Timeout of a single request to the remote side.
    pub request_timeout: Duration,
    /// Timeout of the whole invocation. `None` or zero means unset.
    pub invocation_timeout: Option<Duration>,
}

impl Default for OperationConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            invocation_timeout: None,
        }
    }
}

impl OperationConfig {
    /// How long a blocking caller waits for one attempt.
    ///
    /// The configured invocation timeout when positive, otherwise twice the
    /// request timeout: an invocation may itself issue nested remote calls.
    #[must_use]
    pub fn sync_wait_timeout(&self) -> Duration {
        match self.invocation_timeout {
            Some(timeout) if !timeout.is_zero() => timeout,
            _ => self.request_timeout.saturating_mul(2),
        }
    }
}

/// Identity and configuration of one callable operation.
#[derive(Debug, Clone)]
pub struct OperationMeta {
    pub app_id: String,
    pub microservice_name: String,
    pub schema_id: String,
    pub operation_id: String,
    /// HTTP method of the operation, used when matching governance rules.
    pub http_method: String,
    /// Relative path of the operation, used when matching governance rules.
    pub path: String,
    pub config: OperationConfig,
}

impl OperationMeta {
    #[must_use]
    pub fn new(
        microservice_name: impl Into<String>,
        schema_id: impl Into<String>,
        operation_id: impl Into<String>,
    ) -> Self {
        Self {
            app_id: "default".to_string(),
            microservice_name: microservice_name.into(),
            schema_id: schema_id.into(),
            operation_id: operation_id.into(),
            http_method: "POST".to_string(),
            path: "/".to_string(),
            config: OperationConfig::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: OperationConfig) -> Self {
        self.config = config;
        self
    }

    /// `microservice.schema.operation`
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!(
            "{}.{}.{}",
            self.microservice_name, self.schema_id, self.operation_id
        )
    }
}

/// A resolved target instance for a remote call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub transport: String,
    pub address: String,
}

impl Endpoint {
    #[must_use]
    pub fn new(transport: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            transport: transport.into(),
            address: address.into(),
        }
    }
}
