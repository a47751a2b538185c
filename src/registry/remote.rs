//! HTTP client for a registry served by a manager.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::debug;
use url::Url;

use super::RegistryClient;
use crate::core::{MeshError, MeshResult};
use crate::protocols::{NetworkService, NetworkServiceEndpoint};

#[derive(Debug, Clone)]
pub struct HttpRegistryClient {
    base: Url,
    client: Client,
}

impl HttpRegistryClient {
    pub fn new(base_url: &str, timeout: Duration) -> MeshResult<Self> {
        let base = Url::parse(base_url).map_err(|e| MeshError::Registry {
            reason: format!("invalid registry url {}: {}", base_url, e),
        })?;
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| MeshError::Registry {
                reason: format!("failed to build registry client: {}", e),
            })?;
        Ok(Self { base, client })
    }

    /// Reuse an existing reqwest client (e.g. one carrying a TLS identity).
    pub fn with_client(base_url: &str, client: Client) -> MeshResult<Self> {
        let base = Url::parse(base_url).map_err(|e| MeshError::Registry {
            reason: format!("invalid registry url {}: {}", base_url, e),
        })?;
        Ok(Self { base, client })
    }

    fn endpoint_url(&self, segments: &[&str]) -> MeshResult<Url> {
        let mut url = self.base.clone();
        {
            let mut path = url.path_segments_mut().map_err(|_| MeshError::Registry {
                reason: format!("registry url {} cannot be a base", self.base),
            })?;
            path.pop_if_empty();
            path.extend(["v1", "registry"]);
            path.extend(segments);
        }
        Ok(url)
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> MeshResult<Option<T>> {
        let response = request.send().await.map_err(registry_error)?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MeshError::Registry {
                reason: format!("registry returned {}: {}", status, body),
            });
        }
        response.json::<T>().await.map(Some).map_err(registry_error)
    }
}

fn registry_error(e: reqwest::Error) -> MeshError {
    MeshError::Registry {
        reason: e.to_string(),
    }
}

fn unexpected_not_found(what: &str) -> MeshError {
    MeshError::Registry {
        reason: format!("registry does not serve {}", what),
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn register_network_service(
        &self,
        service: NetworkService,
    ) -> MeshResult<NetworkService> {
        let url = self.endpoint_url(&["network-services"])?;
        self.send(self.client.post(url).json(&service))
            .await?
            .ok_or_else(|| unexpected_not_found("network services"))
    }

    async fn register_endpoint(
        &self,
        endpoint: NetworkServiceEndpoint,
    ) -> MeshResult<NetworkServiceEndpoint> {
        let url = self.endpoint_url(&["endpoints"])?;
        debug!(endpoint = %endpoint.name, registry = %self.base, "Registering endpoint");
        self.send(self.client.post(url).json(&endpoint))
            .await?
            .ok_or_else(|| unexpected_not_found("endpoints"))
    }

    async fn unregister_endpoint(&self, name: &str) -> MeshResult<bool> {
        let url = self.endpoint_url(&["endpoints", name])?;
        let response = self
            .client
            .delete(url)
            .send()
            .await
            .map_err(registry_error)?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(MeshError::Registry {
                reason: format!("registry returned {} unregistering {}", status, name),
            }),
        }
    }

    async fn find_endpoints(
        &self,
        network_service: &str,
    ) -> MeshResult<Vec<NetworkServiceEndpoint>> {
        let url = self.endpoint_url(&["endpoints"])?;
        let request = self
            .client
            .get(url)
            .query(&[("network_service", network_service)]);
        Ok(self.send(request).await?.unwrap_or_default())
    }

    async fn find_endpoint(&self, name: &str) -> MeshResult<Option<NetworkServiceEndpoint>> {
        let url = self.endpoint_url(&["endpoints", name])?;
        self.send(self.client.get(url)).await
    }
}
