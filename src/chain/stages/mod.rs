//! Stage implementations
//!
//! Typical orderings:
//! - manager: update_path, authorize, tracker, discover, round_robin, connect
//! - endpoint: update_path, authorize, tracker, set_extra_context, select_mechanism
//! - client: tracker, connect

mod authorize;
mod connect;
mod discover;
mod extra_context;
mod mechanism;
mod round_robin;
mod tracker;
mod update_path;

pub use authorize::AuthorizeStage;
pub use connect::ConnectStage;
pub use discover::DiscoverStage;
pub use extra_context::SetExtraContextStage;
pub use mechanism::SelectMechanismStage;
pub use round_robin::RoundRobinStage;
pub use tracker::{ConnectionTrackerStage, TrackedConnection};
pub use update_path::UpdatePathStage;
