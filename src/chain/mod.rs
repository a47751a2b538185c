//! Chain composition
//!
//! A node handles each request and close by running a fixed, ordered list of
//! [`ChainStage`]s. Each stage receives the call plus a [`Next`] handle to the rest
//! of the chain and decides when (and how many times) to invoke it.

mod composer;
pub mod stages;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

pub use composer::{Chain, ChainBuilder};

use crate::core::{CallContext, MeshResult};
use crate::protocols::{Connection, NetworkServiceRequest};

/// Trait for stages that take part in request and close handling
#[async_trait]
pub trait ChainStage: Send + Sync {
    /// Handle a request. Implementations normally do local work, call
    /// `next.request`, then post-process the returned connection.
    async fn request(
        &self,
        ctx: &mut CallContext,
        request: NetworkServiceRequest,
        next: Next<'_>,
    ) -> MeshResult<Connection>;

    /// Handle a close. Implementations release local state, then relay.
    async fn close(
        &self,
        ctx: &mut CallContext,
        connection: Connection,
        next: Next<'_>,
    ) -> MeshResult<()>;

    /// Stage name for logging
    fn name(&self) -> &'static str;
}

/// Handle to the remainder of a chain.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    stages: &'a [Arc<dyn ChainStage>],
    depth: usize,
}

impl<'a> Next<'a> {
    pub(crate) fn new(stages: &'a [Arc<dyn ChainStage>]) -> Self {
        Self { stages, depth: 0 }
    }

    /// Whether the chain ends here.
    pub fn is_tail(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run the rest of the chain for a request.
    ///
    /// When the stage at this position fails after the part of the chain below it
    /// had already produced a connection, that part is closed before the error is
    /// returned so nothing stays half established.
    pub async fn request(
        self,
        ctx: &mut CallContext,
        request: NetworkServiceRequest,
    ) -> MeshResult<Connection> {
        let Some((stage, rest)) = self.stages.split_first() else {
            return Ok(request.connection);
        };
        let rest = Next {
            stages: rest,
            depth: self.depth + 1,
        };

        ctx.reset_established(self.depth + 1);
        let result = stage.request(ctx, request, rest).await;
        let established_below = ctx.take_established(self.depth + 1);

        match result {
            Ok(connection) => {
                ctx.mark_established(self.depth, &connection);
                Ok(connection)
            }
            Err(err) => {
                if let Some(connection) = established_below {
                    warn!(
                        stage = stage.name(),
                        connection_id = %connection.id,
                        error = %err,
                        "Stage failed after downstream was established, closing downstream"
                    );
                    if let Err(close_err) = rest.close(ctx, connection).await {
                        warn!(
                            stage = stage.name(),
                            error = %close_err,
                            "Failed to close downstream while unwinding"
                        );
                    }
                } else {
                    debug!(stage = stage.name(), error = %err, "Stage failed");
                }
                Err(err)
            }
        }
    }

    /// Run the rest of the chain for a close.
    pub async fn close(self, ctx: &mut CallContext, connection: Connection) -> MeshResult<()> {
        let Some((stage, rest)) = self.stages.split_first() else {
            return Ok(());
        };
        let rest = Next {
            stages: rest,
            depth: self.depth + 1,
        };
        stage.close(ctx, connection, rest).await
    }
}
