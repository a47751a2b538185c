pub mod chain;
pub mod config;
pub mod core;
pub mod credentials;
pub mod node;
pub mod observability;
pub mod protocols;
pub mod registry;
pub mod server;
pub mod transport;

pub use crate::chain::{Chain, ChainStage, Next};
pub use crate::core::{CallContext, MeshError, MeshResult};
pub use crate::node::{Client, Node};
