//! Resolution of the protocol catalog for a flow's deployed code.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use fm_domain::config::Config;
use fm_domain::error::{Error, Result};
use fm_protocol::{HoldingIdentity, ProtocolCatalog};

/// Loads (or looks up) the sandbox for a deployment and returns its
/// protocol catalog.  Failures are transient: the caller may retry.
pub trait ProtocolSandboxResolver: Send + Sync {
    fn resolve(
        &self,
        identity: &HoldingIdentity,
        bundle_hashes: &[String],
    ) -> Result<Arc<ProtocolCatalog>>;
}

type CacheKey = (HoldingIdentity, Vec<String>);

/// Resolver over a fixed set of deployments, keyed by bundle hash set.
#[derive(Default)]
pub struct StaticSandboxResolver {
    deployments: HashMap<Vec<String>, Arc<ProtocolCatalog>>,
    cache: RwLock<HashMap<CacheKey, Arc<ProtocolCatalog>>>,
}

impl StaticSandboxResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one catalog from `[protocols]` and register it for every
    /// configured deployment.
    pub fn from_config(config: &Config) -> Result<Self> {
        let catalog = Arc::new(ProtocolCatalog::from_config(&config.protocols)?);
        let mut resolver = Self::new();
        for deployment in &config.deployments {
            resolver.add_deployment(&deployment.bundle_hashes, catalog.clone());
            tracing::info!(
                deployment = %deployment.name,
                bundles = deployment.bundle_hashes.len(),
                "deployment registered"
            );
        }
        Ok(resolver)
    }

    /// Register `catalog` for the given bundle hashes (order-insensitive).
    pub fn add_deployment(
        &mut self,
        bundle_hashes: &[String],
        catalog: Arc<ProtocolCatalog>,
    ) -> &mut Self {
        self.deployments.insert(sorted(bundle_hashes), catalog);
        self
    }

    pub fn deployment_count(&self) -> usize {
        self.deployments.len()
    }
}

impl ProtocolSandboxResolver for StaticSandboxResolver {
    fn resolve(
        &self,
        identity: &HoldingIdentity,
        bundle_hashes: &[String],
    ) -> Result<Arc<ProtocolCatalog>> {
        let hashes = sorted(bundle_hashes);
        let key = (identity.clone(), hashes);

        if let Some(hit) = self.cache.read().get(&key) {
            return Ok(hit.clone());
        }

        let catalog = self.deployments.get(&key.1).cloned().ok_or_else(|| {
            Error::Sandbox(format!(
                "no sandbox for {identity} with bundles {:?}",
                key.1
            ))
        })?;

        tracing::debug!(identity = %identity, "sandbox resolved");
        self.cache.write().insert(key, catalog.clone());
        Ok(catalog)
    }
}

fn sorted(hashes: &[String]) -> Vec<String> {
    let mut v = hashes.to_vec();
    v.sort();
    v
}
