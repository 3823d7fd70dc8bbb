//! Service addresses from the Kubernetes API.

use super::ServiceAddressProvider;

use std::net::IpAddr;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, ListParams};
use kube::{Client, Config};

/// Lists the ClusterIP of every Service in every namespace.
///
/// The client configuration is inferred on each call: in-cluster service account credentials
/// when running in a pod, the local kubeconfig otherwise.
#[derive(Debug, Default, Clone)]
pub struct KubernetesProvider;

impl KubernetesProvider {
    pub fn new() -> Self {
        KubernetesProvider
    }

    async fn client() -> Result<Client> {
        let config = Config::infer()
            .await
            .context("Failed to load Kubernetes config")?;
        Client::try_from(config).context("Failed to create Kubernetes client")
    }
}

impl ServiceAddressProvider for KubernetesProvider {
    async fn list_service_addresses(&self) -> Result<Vec<IpAddr>> {
        let client = Self::client().await?;
        let services = Api::<Service>::all(client)
            .list(&ListParams::default())
            .await
            .context("Failed to list services")?;
        Ok(services
            .items
            .iter()
            .filter_map(|svc| svc.spec.as_ref()?.cluster_ip.as_deref())
            .filter_map(parse_cluster_ip)
            .collect())
    }
}

/// Parses a ClusterIP, skipping headless (`"None"`) and unset services.
fn parse_cluster_ip(cluster_ip: &str) -> Option<IpAddr> {
    if cluster_ip.is_empty() || cluster_ip == "None" {
        return None;
    }
    match cluster_ip.parse() {
        Ok(addr) => Some(addr),
        Err(_) => {
            log::warn!("Ignoring invalid ClusterIP {:?}", cluster_ip);
            None
        }
    }
}
