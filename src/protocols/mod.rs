//! Wire types shared by every hop and the registry.

pub mod connection;
pub mod registry;

pub use connection::{
    Connection, ConnectionContext, Mechanism, NetworkServiceRequest, Path, PathSegment,
};
pub use registry::{EndpointQuery, NetworkService, NetworkServiceEndpoint};
