//! Name-keyed lookup of build strategies

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::client::BuildClient;
use crate::s2i::S2iStrategy;
use crate::settings::BuildSettings;
use crate::strategy::BuildStrategy;
use crate::tekton::TektonStrategy;

/// Strategies available to the controller, keyed by [`BuildStrategy::name`]
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    strategies: BTreeMap<String, Arc<dyn BuildStrategy>>,
}

impl StrategyRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the S2I and Tekton backends over one client
    pub fn with_defaults(client: Arc<dyn BuildClient>, settings: BuildSettings) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(S2iStrategy::new(client.clone())));
        registry.register(Arc::new(TektonStrategy::new(client, settings)));
        registry
    }

    /// Add a strategy, replacing any with the same name
    pub fn register(&mut self, strategy: Arc<dyn BuildStrategy>) {
        let name = strategy.name().to_string();
        if self.strategies.insert(name.clone(), strategy).is_some() {
            debug!(strategy = %name, "replaced registered build strategy");
        }
    }

    /// Strategy with the given name
    pub fn get(&self, name: &str) -> Option<Arc<dyn BuildStrategy>> {
        self.strategies.get(name).cloned()
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        self.strategies.keys().cloned().collect()
    }

    /// Names of strategies whose APIs the cluster serves in `namespace`.
    ///
    /// A failed detection counts as unavailable.
    pub async fn detect_available(&self, namespace: &str) -> Vec<String> {
        let mut available = Vec::new();
        for (name, strategy) in &self.strategies {
            match strategy.detect(namespace).await {
                Ok(true) => available.push(name.clone()),
                Ok(false) => debug!(strategy = %name, namespace, "build strategy not available"),
                Err(e) => warn!(strategy = %name, namespace, error = %e, "build strategy detection failed"),
            }
        }
        available
    }
}
