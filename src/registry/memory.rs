//! In-memory registry
//!
//! Endpoints are keyed by name. Each service keeps an immutable snapshot of the
//! endpoint names serving it, replaced on write, so lookups never contend with
//! registrations.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info};

use super::RegistryClient;
use crate::core::{MeshError, MeshResult};
use crate::protocols::{NetworkService, NetworkServiceEndpoint};

#[derive(Debug, Default)]
pub struct MemoryRegistry {
    services: DashMap<String, NetworkService>,
    endpoints: DashMap<String, NetworkServiceEndpoint>,
    /// Service name -> endpoint names in registration order
    service_index: DashMap<String, Arc<[String]>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    pub fn register_endpoint_sync(
        &self,
        endpoint: NetworkServiceEndpoint,
    ) -> MeshResult<NetworkServiceEndpoint> {
        if endpoint.name.is_empty() {
            return Err(MeshError::Registry {
                reason: "endpoint name must not be empty".to_string(),
            });
        }
        if endpoint.url.is_empty() {
            return Err(MeshError::Registry {
                reason: format!("endpoint {} has no url", endpoint.name),
            });
        }

        let previous = self
            .endpoints
            .insert(endpoint.name.clone(), endpoint.clone());

        if let Some(previous) = &previous {
            for service in &previous.network_service_names {
                if !endpoint.serves(service) {
                    self.remove_from_index(service, &endpoint.name);
                }
            }
        }
        for service in &endpoint.network_service_names {
            self.add_to_index(service, &endpoint.name);
        }

        match previous {
            Some(previous) => info!(
                endpoint = %endpoint.name,
                old_url = %previous.url,
                url = %endpoint.url,
                "Updated endpoint registration"
            ),
            None => info!(
                endpoint = %endpoint.name,
                url = %endpoint.url,
                services = ?endpoint.network_service_names,
                "Registered endpoint"
            ),
        }

        Ok(endpoint)
    }

    pub fn find_endpoints_sync(&self, network_service: &str) -> Vec<NetworkServiceEndpoint> {
        let names = match self.service_index.get(network_service) {
            Some(names) => Arc::clone(names.value()),
            None => return Vec::new(),
        };

        // The index can briefly lag a concurrent re-registration.
        names
            .iter()
            .filter_map(|name| self.endpoints.get(name).map(|e| e.value().clone()))
            .filter(|endpoint| endpoint.serves(network_service))
            .collect()
    }

    fn add_to_index(&self, service: &str, name: &str) {
        self.service_index
            .entry(service.to_string())
            .and_modify(|existing| {
                if !existing.iter().any(|n| n == name) {
                    let mut names: Vec<String> = existing.iter().cloned().collect();
                    names.push(name.to_string());
                    *existing = Arc::from(names.into_boxed_slice());
                }
            })
            .or_insert_with(|| Arc::from(vec![name.to_string()].into_boxed_slice()));
    }

    fn remove_from_index(&self, service: &str, name: &str) {
        if let Some(mut entry) = self.service_index.get_mut(service) {
            let names: Vec<String> = entry.iter().filter(|n| *n != name).cloned().collect();
            *entry = Arc::from(names.into_boxed_slice());
        }
    }
}

#[async_trait]
impl RegistryClient for MemoryRegistry {
    async fn register_network_service(
        &self,
        service: NetworkService,
    ) -> MeshResult<NetworkService> {
        if service.name.is_empty() {
            return Err(MeshError::Registry {
                reason: "network service name must not be empty".to_string(),
            });
        }
        self.services.insert(service.name.clone(), service.clone());
        debug!(network_service = %service.name, "Registered network service");
        Ok(service)
    }

    async fn register_endpoint(
        &self,
        endpoint: NetworkServiceEndpoint,
    ) -> MeshResult<NetworkServiceEndpoint> {
        self.register_endpoint_sync(endpoint)
    }

    async fn unregister_endpoint(&self, name: &str) -> MeshResult<bool> {
        let Some((_, endpoint)) = self.endpoints.remove(name) else {
            return Ok(false);
        };
        for service in &endpoint.network_service_names {
            self.remove_from_index(service, name);
        }
        info!(endpoint = %name, "Unregistered endpoint");
        Ok(true)
    }

    async fn find_endpoints(
        &self,
        network_service: &str,
    ) -> MeshResult<Vec<NetworkServiceEndpoint>> {
        Ok(self.find_endpoints_sync(network_service))
    }

    async fn find_endpoint(&self, name: &str) -> MeshResult<Option<NetworkServiceEndpoint>> {
        Ok(self.endpoints.get(name).map(|e| e.value().clone()))
    }
}
