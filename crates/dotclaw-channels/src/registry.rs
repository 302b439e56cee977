//! Provider routing.
//!
//! Chat ids are provider-prefixed (`telegram:-100123`); the registry maps
//! the prefix to the registered adapter.

use std::collections::HashMap;
use std::sync::Arc;

use crate::traits::{Provider, ProviderError};

/// Maps provider names to adapters and routes prefixed chat ids.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its [`Provider::name`].
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    /// All registered adapters.
    pub fn all(&self) -> impl Iterator<Item = &Arc<dyn Provider>> {
        self.providers.values()
    }

    /// Route a prefixed chat id to its adapter.
    pub fn route(&self, chat_id: &str) -> Result<Arc<dyn Provider>, ProviderError> {
        let prefix = chat_id.split(':').next().unwrap_or_default();
        self.providers
            .get(prefix)
            .cloned()
            .ok_or_else(|| ProviderError::NoProvider(chat_id.to_string()))
    }
}
