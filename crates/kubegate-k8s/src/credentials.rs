//! Credential capabilities
//!
//! Every cluster owns exactly one [`KubeCredentials`] implementation, selected
//! once when the cluster is registered.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::kubeconfig::load_static_kube_config;

/// Source of ready-to-use connection settings for one cluster
pub trait KubeCredentials: Send + Sync {
    /// Current connection settings. Fails once the credentials have expired
    /// and no renewal has landed.
    fn kube_config(&self) -> Result<Arc<kube::Config>>;

    /// Stop any background renewal and wait for it to exit
    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

/// Long-lived credentials read from a kubeconfig
pub struct StaticCredentials {
    config: Arc<kube::Config>,
}

impl StaticCredentials {
    pub fn new(config: kube::Config) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Load credentials from a raw kubeconfig document
    pub async fn from_kubeconfig(cluster_name: &str, raw: &str) -> Result<Self> {
        let config = load_static_kube_config(cluster_name, raw).await?;
        Ok(Self::new(config))
    }
}

impl KubeCredentials for StaticCredentials {
    fn kube_config(&self) -> Result<Arc<kube::Config>> {
        Ok(Arc::clone(&self.config))
    }
}
