//! Core types for the mesh router
//!
//! - Error taxonomy shared across hops
//! - Per-call context (cancellation, deadline, hop position)
//! - Path tracking helpers
//! - Connection lifecycle phases

pub mod context;
pub mod error;
pub mod path;
pub mod state;

pub use context::{CallContext, Discovered};
pub use error::{MeshError, MeshResult};
pub use path::HopPosition;
pub use state::ConnectionPhase;
