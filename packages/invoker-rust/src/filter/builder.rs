//! Resolves chain configuration into built [`FilterNode`] chains.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use rpcflow_core::InvocationType;
use tracing::debug;

use super::config::{ChainItem, FilterChainsConfig};
use super::node::{ChainElement, FilterNode};
use super::registry::{ChainConfigError, FilterContext, FilterRegistry};

/// Builds and caches one chain per `(direction, microservice)`.
pub struct FilterChainsManager {
    registry: Arc<FilterRegistry>,
    config: ArcSwap<FilterChainsConfig>,
    chains: DashMap<(InvocationType, String), FilterNode>,
}

impl FilterChainsManager {
    #[must_use]
    pub fn new(registry: Arc<FilterRegistry>, config: FilterChainsConfig) -> Self {
        Self {
            registry,
            config: ArcSwap::from_pointee(config),
            chains: DashMap::new(),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<FilterRegistry> {
        &self.registry
    }

    /// Current configuration snapshot.
    #[must_use]
    pub fn config(&self) -> Arc<FilterChainsConfig> {
        self.config.load_full()
    }

    /// Returns the chain for `microservice`, building it on first use.
    ///
    /// # Errors
    ///
    /// Returns a [`ChainConfigError`] if the configured chain names an
    /// unregistered filter or a filter factory fails.
    pub fn chain_for(
        &self,
        invocation_type: InvocationType,
        microservice: &str,
    ) -> Result<FilterNode, ChainConfigError> {
        let key = (invocation_type, microservice.to_string());
        if let Some(chain) = self.chains.get(&key) {
            return Ok(chain.value().clone());
        }
        let chain = self.build_chain(invocation_type, microservice)?;
        // A concurrent builder may have won; keep whichever landed first.
        Ok(self.chains.entry(key).or_insert(chain).value().clone())
    }

    /// Builds a fresh chain from the current configuration, bypassing the cache.
    ///
    /// # Errors
    ///
    /// See [`FilterChainsManager::chain_for`].
    pub fn build_chain(
        &self,
        invocation_type: InvocationType,
        microservice: &str,
    ) -> Result<FilterNode, ChainConfigError> {
        let config = self.config.load();
        if !config.enabled {
            debug!(%invocation_type, microservice, "filter chains disabled");
            return Ok(FilterNode::empty());
        }

        let ctx = FilterContext {
            invocation_type,
            microservice: microservice.to_string(),
        };
        let elements = match config.resolve(invocation_type, microservice) {
            Some(items) => self.resolve_items(items, &ctx)?,
            None => self.default_elements(&ctx)?,
        };
        let chain = FilterNode::build(elements);
        debug!(%invocation_type, microservice, chain = %chain.describe(), "built filter chain");
        Ok(chain)
    }

    /// Replaces the configuration and drops every cached chain.
    pub fn reload(&self, config: FilterChainsConfig) {
        self.config.store(Arc::new(config));
        self.chains.clear();
        debug!("filter chain configuration reloaded");
    }

    fn resolve_items(
        &self,
        items: &[ChainItem],
        ctx: &FilterContext,
    ) -> Result<Vec<ChainElement>, ChainConfigError> {
        items
            .iter()
            .map(|item| match item {
                ChainItem::Filter(name) => self.registry.instantiate(name, ctx).map(ChainElement::Filter),
                ChainItem::TransportBranch { transport } => {
                    let mut branches = BTreeMap::new();
                    for (tag, sub_items) in transport {
                        branches.insert(tag.clone(), self.resolve_items(sub_items, ctx)?);
                    }
                    Ok(ChainElement::TransportBranch(branches))
                }
            })
            .collect()
    }

    // Every registered filter that applies to this chain, lowest order first.
    fn default_elements(&self, ctx: &FilterContext) -> Result<Vec<ChainElement>, ChainConfigError> {
        let mut filters: Vec<_> = self
            .registry
            .instantiate_all(ctx)?
            .into_iter()
            .filter(|filter| {
                filter.enabled_for_invocation_type(ctx.invocation_type)
                    && filter.enabled_for_microservice(&ctx.microservice)
            })
            .map(|filter| (filter.order(ctx.invocation_type, &ctx.microservice), filter))
            .collect();
        filters.sort_by(|(a_order, a), (b_order, b)| a_order.cmp(b_order).then_with(|| a.name().cmp(b.name())));
        Ok(filters
            .into_iter()
            .map(|(_, filter)| ChainElement::Filter(filter))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
