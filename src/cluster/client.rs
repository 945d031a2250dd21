//! Cluster client construction
//!
//! The factory is injected into the controller instead of living behind
//! rebindable module globals; tests supply their own factory.

use crate::config::KUBECONFIG_ENV;
use crate::error::{Error, Result};
use async_trait::async_trait;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::info;

/// Builds the Kubernetes client the provisioner talks through.
#[async_trait]
pub trait ClusterClientFactory: Send + Sync {
    async fn build_client(&self) -> Result<Client>;
}

/// Production factory: `KUBECONFIG` when set, in-cluster credentials
/// otherwise.
#[derive(Debug, Default)]
pub struct DefaultClientFactory;

#[async_trait]
impl ClusterClientFactory for DefaultClientFactory {
    async fn build_client(&self) -> Result<Client> {
        let kubeconfig_path = std::env::var(KUBECONFIG_ENV)
            .ok()
            .filter(|p| !p.is_empty());

        let config = match kubeconfig_path {
            Some(path) => {
                info!("Creating client using kubeconfig file {}", path);
                let kubeconfig = Kubeconfig::read_from(&path).map_err(|e| {
                    Error::Configuration(format!("cannot read kubeconfig {}: {}", path, e))
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| {
                        Error::Configuration(format!("invalid kubeconfig {}: {}", path, e))
                    })?
            }
            None => {
                info!("Creating client using in-cluster config");
                Config::incluster().map_err(|e| {
                    Error::Configuration(format!("in-cluster config unavailable: {}", e))
                })?
            }
        };

        Ok(Client::try_from(config)?)
    }
}
