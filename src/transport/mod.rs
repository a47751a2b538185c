//! Outbound transport between hops.
//!
//! The forwarding stage talks to the next hop through a [`NetworkServiceClient`]
//! obtained from a [`ClientPool`]; how clients are created is behind [`Dialer`].

mod http;
mod pool;

use std::time::Duration;

use async_trait::async_trait;

pub use self::http::{HttpDialer, HttpNetworkServiceClient};
pub use pool::ClientPool;

use crate::core::MeshResult;
use crate::protocols::{Connection, NetworkServiceRequest};

pub const REQUEST_PATH: &str = "/v1/network-service/request";
pub const CLOSE_PATH: &str = "/v1/network-service/close";
/// Remaining call budget in milliseconds, propagated hop to hop.
pub const DEADLINE_HEADER: &str = "x-mesh-deadline-ms";

/// Per-call metadata sent alongside the payload.
#[derive(Debug, Clone, Default)]
pub struct CallMetadata {
    /// Bearer token identifying the sending hop.
    pub token: Option<String>,
    pub deadline: Option<Duration>,
}

#[async_trait]
pub trait NetworkServiceClient: Send + Sync {
    async fn request(
        &self,
        request: &NetworkServiceRequest,
        metadata: &CallMetadata,
    ) -> MeshResult<Connection>;

    async fn close(&self, connection: &Connection, metadata: &CallMetadata) -> MeshResult<()>;

    fn address(&self) -> &str;
}

#[async_trait]
pub trait Dialer: Send + Sync {
    /// Create a client for `address`. Failures are reported as `MeshError::Dial`.
    async fn dial(
        &self,
        address: &str,
    ) -> MeshResult<std::sync::Arc<dyn NetworkServiceClient>>;
}

/// Body of every non-success RPC response.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorBody {
    pub error: crate::core::MeshError,
}
