//! Registry of network services and their endpoints.
//!
//! Managers host a [`MemoryRegistry`] and serve it over HTTP; endpoints and
//! cross-connects reach it through [`HttpRegistryClient`]. Discovery only sees the
//! [`RegistryClient`] trait.

mod memory;
mod remote;

use async_trait::async_trait;

pub use memory::MemoryRegistry;
pub use remote::HttpRegistryClient;

use crate::core::MeshResult;
use crate::protocols::{NetworkService, NetworkServiceEndpoint};

#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn register_network_service(&self, service: NetworkService)
        -> MeshResult<NetworkService>;

    /// Register an endpoint, replacing any earlier record with the same name.
    async fn register_endpoint(
        &self,
        endpoint: NetworkServiceEndpoint,
    ) -> MeshResult<NetworkServiceEndpoint>;

    /// Returns `true` when an endpoint was removed.
    async fn unregister_endpoint(&self, name: &str) -> MeshResult<bool>;

    /// Endpoints serving `network_service`, in registration order.
    async fn find_endpoints(&self, network_service: &str)
        -> MeshResult<Vec<NetworkServiceEndpoint>>;

    async fn find_endpoint(&self, name: &str) -> MeshResult<Option<NetworkServiceEndpoint>>;
}
