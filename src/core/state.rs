//! Per-hop connection lifecycle.

use std::fmt;

use super::MeshError;

/// Phases a connection passes through at a single hop.
///
/// `Received → Authorizing → Discovering → Selecting → Forwarding → Established`,
/// with the failures terminating in `Rejected`, `Unresolvable` or `Unreachable`,
/// and `Established → Closing → Closed` on teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Received,
    Authorizing,
    Discovering,
    Selecting,
    Forwarding,
    Established,
    Rejected,
    Unresolvable,
    Unreachable,
    Closing,
    Closed,
}

impl ConnectionPhase {
    /// Terminal phase a failed request ends in.
    pub fn from_error(error: &MeshError) -> Self {
        match error {
            MeshError::Authorization { .. } => ConnectionPhase::Rejected,
            MeshError::Discovery { .. } => ConnectionPhase::Unresolvable,
            MeshError::Dial { .. }
            | MeshError::Timeout { .. }
            | MeshError::NoReachableEndpoint { .. }
            | MeshError::Cancelled => ConnectionPhase::Unreachable,
            _ => ConnectionPhase::Rejected,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionPhase::Rejected
                | ConnectionPhase::Unresolvable
                | ConnectionPhase::Unreachable
                | ConnectionPhase::Closed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionPhase::Received => "received",
            ConnectionPhase::Authorizing => "authorizing",
            ConnectionPhase::Discovering => "discovering",
            ConnectionPhase::Selecting => "selecting",
            ConnectionPhase::Forwarding => "forwarding",
            ConnectionPhase::Established => "established",
            ConnectionPhase::Rejected => "rejected",
            ConnectionPhase::Unresolvable => "unresolvable",
            ConnectionPhase::Unreachable => "unreachable",
            ConnectionPhase::Closing => "closing",
            ConnectionPhase::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
