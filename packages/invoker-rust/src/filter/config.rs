//! Declarative filter-chain configuration.
//!
//! ```json
//! {
//!   "enabled": true,
//!   "consumer": {
//!     "default": ["auth", { "transport": { "rest": ["rest-client"], "highway": ["highway-client"] } }, "metrics"],
//!     "microservices": { "billing": ["auth", "rest-client"] }
//!   }
//! }
//! ```
//!
//! Loading this from files or a config center happens elsewhere; the types
//! only describe the shape.

use std::collections::{BTreeMap, HashMap};

use rpcflow_core::InvocationType;
use serde::{Deserialize, Serialize};

/// One entry of a configured chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChainItem {
    /// A registered filter, by name.
    Filter(String),
    /// Per-transport sub-chains that rejoin the rest of the list.
    TransportBranch {
        transport: BTreeMap<String, Vec<ChainItem>>,
    },
}

impl ChainItem {
    #[must_use]
    pub fn filter(name: impl Into<String>) -> Self {
        Self::Filter(name.into())
    }
}

/// Chains of one invocation direction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectionChains {
    /// Chain used by every microservice without an override. When absent,
    /// all registered filters enabled for the chain run, sorted by order.
    pub default: Option<Vec<ChainItem>>,
    /// Per-microservice chains, taking precedence over `default`.
    pub microservices: HashMap<String, Vec<ChainItem>>,
}

/// Filter-chain configuration for both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterChainsConfig {
    /// When `false`, every chain is the empty chain.
    pub enabled: bool,
    pub consumer: DirectionChains,
    pub producer: DirectionChains,
}

impl Default for FilterChainsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            consumer: DirectionChains::default(),
            producer: DirectionChains::default(),
        }
    }
}

impl FilterChainsConfig {
    #[must_use]
    pub fn direction(&self, invocation_type: InvocationType) -> &DirectionChains {
        match invocation_type {
            InvocationType::Consumer => &self.consumer,
            InvocationType::Producer => &self.producer,
        }
    }

    /// Configured chain for `microservice`: its override, else the default.
    /// `None` means no explicit list is configured.
    #[must_use]
    pub fn resolve(&self, invocation_type: InvocationType, microservice: &str) -> Option<&[ChainItem]> {
        let direction = self.direction(invocation_type);
        direction
            .microservices
            .get(microservice)
            .or(direction.default.as_ref())
            .map(Vec::as_slice)
    }
}
