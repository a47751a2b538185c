//! Clients to downstream hops, keyed by address.
//!
//! Clients are created lazily on first use, shared by every connection forwarded to
//! the same address, evicted when a dial fails and dropped on shutdown.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use super::{Dialer, NetworkServiceClient};
use crate::core::MeshResult;

pub struct ClientPool {
    dialer: Arc<dyn Dialer>,
    clients: DashMap<String, Arc<dyn NetworkServiceClient>>,
}

impl std::fmt::Debug for ClientPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientPool")
            .field("clients", &self.clients.len())
            .finish()
    }
}

impl ClientPool {
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        Self {
            dialer,
            clients: DashMap::new(),
        }
    }

    pub async fn get_or_dial(&self, address: &str) -> MeshResult<Arc<dyn NetworkServiceClient>> {
        if let Some(client) = self.clients.get(address) {
            return Ok(Arc::clone(client.value()));
        }

        // Dial without holding a shard lock; a concurrent dial to the same address
        // keeps whichever client was inserted first.
        let client = self.dialer.dial(address).await?;
        let client = self
            .clients
            .entry(address.to_string())
            .or_insert(client)
            .value()
            .clone();
        debug!(address = %address, "Dialed client");
        Ok(client)
    }

    pub fn evict(&self, address: &str) {
        if self.clients.remove(address).is_some() {
            debug!(address = %address, "Evicted client");
        }
    }

    pub fn contains(&self, address: &str) -> bool {
        self.clients.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn close_all(&self) {
        let count = self.clients.len();
        self.clients.clear();
        info!(clients = count, "Closed client pool");
    }
}
