//! Registry records for network services and the endpoints that serve them.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkService {
    pub name: String,
}

impl NetworkService {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// A named endpoint serving one or more network services at a network address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkServiceEndpoint {
    pub name: String,
    #[serde(default)]
    pub network_service_names: Vec<String>,
    pub url: String,
}

impl NetworkServiceEndpoint {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            network_service_names: Vec::new(),
            url: url.into(),
        }
    }

    pub fn serving(mut self, network_service: impl Into<String>) -> Self {
        self.network_service_names.push(network_service.into());
        self
    }

    pub fn serves(&self, network_service: &str) -> bool {
        self.network_service_names
            .iter()
            .any(|name| name == network_service)
    }
}

/// Query parameters for endpoint lookup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointQuery {
    pub network_service: String,
}
