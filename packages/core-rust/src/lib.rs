//! `rpcflow` core: values, responses, typed invocation errors, and operation metadata.

pub mod error;
pub mod operation;
pub mod response;
pub mod types;

pub use error::{status, InvocationError, TransportError};
pub use operation::{transports, Endpoint, InvocationType, OperationConfig, OperationMeta};
pub use response::{Fault, Response};
pub use types::Value;
