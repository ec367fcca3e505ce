use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;

use super::{pixverse::PixverseAdapter, remaker::RemakerAdapter, sora::SoraAdapter, ProviderAdapter};
use crate::domain::params::OperationType;

/// Closed registry mapping `provider_id` to its adapter. Populated once at
/// startup from a fixed set of providers; there is no runtime registration
/// path.
#[derive(Clone)]
pub struct Registry {
    adapters: HashMap<&'static str, Arc<dyn ProviderAdapter>>,
}

impl Registry {
    pub fn bootstrap(provider_timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(provider_timeout)
            .build()
            .expect("failed to build shared provider HTTP client");

        let mut adapters: HashMap<&'static str, Arc<dyn ProviderAdapter>> = HashMap::new();
        let pixverse = Arc::new(PixverseAdapter::new(client.clone()));
        let sora = Arc::new(SoraAdapter::new(client.clone()));
        let remaker = Arc::new(RemakerAdapter::new(client));
        adapters.insert(pixverse.manifest().id, pixverse);
        adapters.insert(sora.manifest().id, sora);
        adapters.insert(remaker.manifest().id, remaker);

        Self { adapters }
    }

    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(provider_id).cloned()
    }

    pub fn supports(&self, provider_id: &str, operation: OperationType) -> bool {
        self.get(provider_id)
            .map(|adapter| adapter.supported_operations().contains(&operation))
            .unwrap_or(false)
    }

    pub fn is_registered(&self, provider_id: &str) -> bool {
        self.adapters.contains_key(provider_id)
    }
}
