//! Connection data model exchanged between hops.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Mechanism class for a connection local to the receiving node.
pub const LOCAL: &str = "LOCAL";
/// Mechanism class for a connection crossing node boundaries.
pub const REMOTE: &str = "REMOTE";

/// Kernel interface mechanism type.
pub const KERNEL: &str = "KERNEL";
/// Shared-memory packet interface mechanism type.
pub const MEMIF: &str = "MEMIF";

/// A data-plane mechanism offered by a requester or chosen by an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mechanism {
    pub cls: String,
    #[serde(rename = "type")]
    pub mechanism_type: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

impl Mechanism {
    pub fn new(cls: impl Into<String>, mechanism_type: impl Into<String>) -> Self {
        Self {
            cls: cls.into(),
            mechanism_type: mechanism_type.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn kernel() -> Self {
        Self::new(LOCAL, KERNEL)
    }
}

/// One hop's contribution to a connection path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathSegment {
    /// Name of the hop that appended the segment.
    pub name: String,
    /// Hop-local identifier for this connection.
    pub id: String,
    /// Credential minted by the hop.
    pub token: String,
    pub expires: DateTime<Utc>,
}

/// Ordered record of every hop a connection traversed.
///
/// `index` is the position of the hop currently processing the connection. It is
/// rewound by each hop on the way back, so the requester always receives the path
/// with `index` pointing at the first segment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Path {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub path_segments: Vec<PathSegment>,
}

impl Path {
    pub fn len(&self) -> usize {
        self.path_segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.path_segments.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.path_segments.iter().map(|segment| segment.name.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionContext {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_context: BTreeMap<String, String>,
}

/// The unit of work routed through the mesh.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    /// Caller-assigned identifier, constant for the lifetime of the connection.
    pub id: String,
    pub network_service: String,
    /// Set once a terminal endpoint has been selected.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub network_service_endpoint_name: String,
    #[serde(default)]
    pub context: ConnectionContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mechanism: Option<Mechanism>,
    #[serde(default)]
    pub path: Path,
}

impl Connection {
    pub fn new(id: impl Into<String>, network_service: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            network_service: network_service.into(),
            ..Default::default()
        }
    }
}

/// A request to establish (or refresh) a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkServiceRequest {
    pub connection: Connection,
    /// Mechanisms acceptable to the requester, most preferred first.
    #[serde(default)]
    pub mechanism_preferences: Vec<Mechanism>,
}

impl NetworkServiceRequest {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            mechanism_preferences: Vec::new(),
        }
    }

    pub fn with_mechanism_preference(mut self, mechanism: Mechanism) -> Self {
        self.mechanism_preferences.push(mechanism);
        self
    }
}
