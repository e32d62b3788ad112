use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use rpcflow_core::InvocationType;

use super::Filter;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Fatal filter-chain configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ChainConfigError {
    #[error("duplicate filter name: {name}")]
    DuplicateFilter { name: String },
    #[error("unknown filter {name} in {invocation_type} chain of {microservice}")]
    UnknownFilter {
        name: String,
        invocation_type: InvocationType,
        microservice: String,
    },
    #[error("failed to create filter {name}")]
    FactoryFailed {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

// ---------------------------------------------------------------------------
// Registrations
// ---------------------------------------------------------------------------

/// What a factory knows about the chain it builds a filter for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterContext {
    pub invocation_type: InvocationType,
    pub microservice: String,
}

/// Creates a fresh filter instance for one chain.
pub type FilterFactory =
    Arc<dyn Fn(&FilterContext) -> anyhow::Result<Arc<dyn Filter>> + Send + Sync>;

/// A filter offered by a provider.
#[derive(Clone)]
pub enum FilterRegistration {
    /// Constructed once and reused by every chain.
    Shared(Arc<dyn Filter>),
    /// Instantiated per chain; may hold per-chain configuration.
    Factory { name: String, create: FilterFactory },
}

impl FilterRegistration {
    pub fn shared<F: Filter>(filter: F) -> Self {
        Self::Shared(Arc::new(filter))
    }

    pub fn factory<C>(name: impl Into<String>, create: C) -> Self
    where
        C: Fn(&FilterContext) -> anyhow::Result<Arc<dyn Filter>> + Send + Sync + 'static,
    {
        Self::Factory {
            name: name.into(),
            create: Arc::new(create),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Shared(filter) => filter.name(),
            Self::Factory { name, .. } => name,
        }
    }

    #[must_use]
    pub fn is_shared(&self) -> bool {
        matches!(self, Self::Shared(_))
    }

    fn instantiate(&self, ctx: &FilterContext) -> Result<Arc<dyn Filter>, ChainConfigError> {
        match self {
            Self::Shared(filter) => Ok(Arc::clone(filter)),
            Self::Factory { name, create } => {
                create(ctx).map_err(|source| ChainConfigError::FactoryFailed {
                    name: name.clone(),
                    source,
                })
            }
        }
    }
}

/// Supplies filters to the registry. Implemented by independent modules.
pub trait FilterProvider: Send + Sync {
    fn filters(&self) -> Vec<FilterRegistration>;
}

// ---------------------------------------------------------------------------
// FilterRegistry
// ---------------------------------------------------------------------------

/// Name-indexed registry of filters.
///
/// Read-only once initialization is done; registration order is kept so
/// listings are deterministic.
pub struct FilterRegistry {
    by_name: DashMap<String, FilterRegistration>,
    order: RwLock<Vec<String>>,
}

impl FilterRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_name: DashMap::new(),
            order: RwLock::new(Vec::new()),
        }
    }

    /// Registers every filter of every provider.
    ///
    /// # Errors
    ///
    /// Returns [`ChainConfigError::DuplicateFilter`] if two filters share a name.
    pub fn from_providers(providers: &[Arc<dyn FilterProvider>]) -> Result<Self, ChainConfigError> {
        let registry = Self::new();
        for provider in providers {
            for registration in provider.filters() {
                registry.register(registration)?;
            }
        }
        Ok(registry)
    }

    /// Registers one filter.
    ///
    /// # Errors
    ///
    /// Returns [`ChainConfigError::DuplicateFilter`] if the name is taken.
    pub fn register(&self, registration: FilterRegistration) -> Result<(), ChainConfigError> {
        let name = registration.name().to_string();
        match self.by_name.entry(name.clone()) {
            Entry::Occupied(_) => Err(ChainConfigError::DuplicateFilter { name }),
            Entry::Vacant(slot) => {
                slot.insert(registration);
                self.order.write().push(name);
                Ok(())
            }
        }
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Registered names, in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.order.read().clone()
    }

    /// Resolves `name` into a filter for the chain described by `ctx`.
    ///
    /// # Errors
    ///
    /// Returns [`ChainConfigError::UnknownFilter`] for unregistered names and
    /// [`ChainConfigError::FactoryFailed`] when a factory fails.
    pub fn instantiate(&self, name: &str, ctx: &FilterContext) -> Result<Arc<dyn Filter>, ChainConfigError> {
        let registration = self
            .by_name
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ChainConfigError::UnknownFilter {
                name: name.to_string(),
                invocation_type: ctx.invocation_type,
                microservice: ctx.microservice.clone(),
            })?;
        registration.instantiate(ctx)
    }

    /// Instantiates every registered filter for the chain described by `ctx`.
    ///
    /// # Errors
    ///
    /// Returns [`ChainConfigError::FactoryFailed`] when a factory fails.
    pub fn instantiate_all(&self, ctx: &FilterContext) -> Result<Vec<Arc<dyn Filter>>, ChainConfigError> {
        self.names()
            .iter()
            .map(|name| self.instantiate(name, ctx))
            .collect()
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
