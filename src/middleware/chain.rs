//! Chain composition.
//!
//! # Responsibilities
//! - Order instances by priority (stable: insertion order breaks ties)
//! - Instantiate each through the registry (or reuse a cached instance)
//! - Fold `wrap` so the lowest priority ends up outermost

use std::sync::Arc;
use thiserror::Error;

use crate::middleware::{Middleware, ProxyService, Registry, RegistryError, ValidationError};
use crate::store::MiddlewareInstance;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("middleware '{id}': {source}")]
    UnknownType {
        id: String,
        #[source]
        source: RegistryError,
    },

    #[error("middleware '{id}': {source}")]
    Invalid {
        id: String,
        #[source]
        source: ValidationError,
    },
}

/// Instances in execution order.
pub fn order_instances(instances: &[MiddlewareInstance]) -> Vec<&MiddlewareInstance> {
    let mut ordered: Vec<&MiddlewareInstance> = instances.iter().collect();
    // `sort_by_key` is stable.
    ordered.sort_by_key(|instance| instance.priority);
    ordered
}

/// Compose `instances` around `base`, instantiating each through `registry`.
pub fn build_chain(
    instances: &[MiddlewareInstance],
    registry: &Registry,
    base: ProxyService,
) -> Result<ProxyService, ChainError> {
    compose(instances, base, |instance| instantiate(registry, instance))
}

/// Build the runtime middleware for one instance.
pub(crate) fn instantiate(registry: &Registry, instance: &MiddlewareInstance) -> Result<Arc<dyn Middleware>, ChainError> {
    let spec = registry
        .get_spec(&instance.type_name)
        .map_err(|source| ChainError::UnknownType {
            id: instance.id.clone(),
            source,
        })?;
    spec.instantiate(&instance.config)
        .map_err(|source| ChainError::Invalid {
            id: instance.id.clone(),
            source,
        })
}

/// Fold the middleware `build` yields for each instance around `base`.
pub(crate) fn compose<F>(instances: &[MiddlewareInstance], base: ProxyService, mut build: F) -> Result<ProxyService, ChainError>
where
    F: FnMut(&MiddlewareInstance) -> Result<Arc<dyn Middleware>, ChainError>,
{
    let mut built: Vec<Arc<dyn Middleware>> = Vec::with_capacity(instances.len());
    for instance in order_instances(instances) {
        built.push(build(instance)?);
    }

    Ok(built
        .iter()
        .rev()
        .fold(base, |inner, middleware| middleware.wrap(inner)))
}
