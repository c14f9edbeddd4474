//! Cloud provider implementations and registry
//!
//! Providers register under their name at startup; a pool selects one with
//! the `provider` configuration key. The reconciler only ever talks to the
//! [`CloudProvider`] trait.

use std::collections::HashMap;
use std::sync::Arc;

use spotherd_core::{CloudProvider, Result, SpotherdError};

pub mod ec2spot;
pub mod mock;

/// Static registry of provider implementations, keyed by provider name.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<&'static str, Arc<dyn CloudProvider>>,
}

impl ProviderRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every production provider.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ec2spot::Ec2SpotProvider::new()));
        registry
    }

    pub fn register(&mut self, provider: Arc<dyn CloudProvider>) {
        self.providers.insert(provider.name(), provider);
    }

    /// Resolve a provider by the name a pool configuration carries.
    pub fn by_name(&self, name: &str) -> Result<Arc<dyn CloudProvider>> {
        self.providers.get(name).cloned().ok_or_else(|| {
            SpotherdError::Config(format!("unknown cloud provider: {name}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_has_ec2spot() {
        let registry = ProviderRegistry::with_defaults();
        assert!(registry.by_name("EC2Spot").is_ok());
        assert!(matches!(
            registry.by_name("NoSuchCloud"),
            Err(SpotherdError::Config(_))
        ));
    }
}
