//! Middleware type registry.
//!
//! # Responsibilities
//! - Map a type name to its `MiddlewareSpec`
//! - Reject duplicate registrations
//! - Provide the process-wide registry used by the store and the router
//!
//! # Design Decisions
//! - Registration needs `&mut self`, so it can only happen before sharing
//! - The global instance lives in a `OnceLock`: written once, read lock-free

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use thiserror::Error;

use crate::middleware::MiddlewareSpec;

static GLOBAL: OnceLock<Registry> = OnceLock::new();

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("middleware type '{0}' not found")]
    NotFound(String),

    #[error("middleware type '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("global registry is already initialized")]
    AlreadyInstalled,
}

/// Set of known middleware types.
#[derive(Default)]
pub struct Registry {
    specs: BTreeMap<&'static str, Arc<dyn MiddlewareSpec>>,
}

impl Registry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every bundled plugin.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::security::register_builtins(&mut registry);
        registry
    }

    /// Process-wide registry; builtins unless [`Registry::install`] ran first.
    pub fn global() -> &'static Registry {
        GLOBAL.get_or_init(Registry::with_builtins)
    }

    /// Make `self` the process-wide registry. Must run before any call to
    /// [`Registry::global`].
    pub fn install(self) -> Result<&'static Registry, RegistryError> {
        GLOBAL.set(self).map_err(|_| RegistryError::AlreadyInstalled)?;
        Ok(Self::global())
    }

    pub fn register(&mut self, spec: Arc<dyn MiddlewareSpec>) -> Result<(), RegistryError> {
        let name = spec.type_name();
        if self.specs.contains_key(name) {
            return Err(RegistryError::AlreadyRegistered(name.to_string()));
        }
        tracing::debug!(middleware_type = name, "Middleware type registered");
        self.specs.insert(name, spec);
        Ok(())
    }

    pub fn get_spec(&self, type_name: &str) -> Result<Arc<dyn MiddlewareSpec>, RegistryError> {
        self.specs
            .get(type_name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(type_name.to_string()))
    }

    /// Registered type names, sorted.
    pub fn type_names(&self) -> Vec<&'static str> {
        self.specs.keys().copied().collect()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("types", &self.type_names())
            .finish()
    }
}
