//! Error types for the mesh router core
//!
//! `MeshError` is serializable so that a failure raised several hops away reaches the
//! original caller with its kind and fields intact.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MeshError {
    #[error("Authorization denied for {identity} on network service {network_service}: {reason}")]
    Authorization {
        identity: String,
        network_service: String,
        reason: String,
    },

    #[error("Discovery failed for network service {network_service}: {reason}")]
    Discovery {
        network_service: String,
        reason: String,
    },

    #[error("Failed to dial {address}: {reason}")]
    Dial { address: String, reason: String },

    #[error("Timed out after {timeout_ms}ms waiting for {address}")]
    Timeout { address: String, timeout_ms: u64 },

    #[error(
        "No reachable endpoint for network service {network_service} after {attempts} attempt(s), last tried {last_address}: {last_error}"
    )]
    NoReachableEndpoint {
        network_service: String,
        attempts: usize,
        last_address: String,
        #[source]
        last_error: Box<MeshError>,
    },

    #[error("Request cancelled")]
    Cancelled,

    #[error("No supported mechanism for network service {network_service}")]
    NoSupportedMechanism { network_service: String },

    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("Registry error: {reason}")]
    Registry { reason: String },

    #[error("Credential error: {reason}")]
    Credential { reason: String },

    #[error("Internal error: {reason}")]
    Internal { reason: String },
}

/// Result type for mesh operations
pub type MeshResult<T> = Result<T, MeshError>;

impl MeshError {
    pub fn dial(address: impl Into<String>, reason: impl ToString) -> Self {
        MeshError::Dial {
            address: address.into(),
            reason: reason.to_string(),
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        MeshError::InvalidRequest {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl ToString) -> Self {
        MeshError::Internal {
            reason: reason.to_string(),
        }
    }

    /// Short machine-readable name of the error kind, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            MeshError::Authorization { .. } => "authorization",
            MeshError::Discovery { .. } => "discovery",
            MeshError::Dial { .. } => "dial",
            MeshError::Timeout { .. } => "timeout",
            MeshError::NoReachableEndpoint { .. } => "no_reachable_endpoint",
            MeshError::Cancelled => "cancelled",
            MeshError::NoSupportedMechanism { .. } => "no_supported_mechanism",
            MeshError::InvalidRequest { .. } => "invalid_request",
            MeshError::Registry { .. } => "registry",
            MeshError::Credential { .. } => "credential",
            MeshError::Internal { .. } => "internal",
        }
    }

    /// Whether a selection stage may move on to its next candidate.
    ///
    /// Only dial and timeout failures for the address this hop dialed qualify. The
    /// same kinds reported by a hop further downstream name a different address and
    /// are returned to the caller unchanged.
    pub fn is_retryable_for(&self, dialed: Option<&str>) -> bool {
        match self {
            MeshError::Dial { address, .. } | MeshError::Timeout { address, .. } => {
                dialed == Some(address.as_str())
            }
            _ => false,
        }
    }
}
