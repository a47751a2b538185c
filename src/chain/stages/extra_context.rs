use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::chain::{ChainStage, Next};
use crate::core::{CallContext, MeshResult};
use crate::protocols::{Connection, NetworkServiceRequest};

/// Adds fixed key/value pairs to the connection context.
#[derive(Debug, Default)]
pub struct SetExtraContextStage {
    values: BTreeMap<String, String>,
}

impl SetExtraContextStage {
    pub fn new(values: BTreeMap<String, String>) -> Self {
        Self { values }
    }
}

#[async_trait]
impl ChainStage for SetExtraContextStage {
    async fn request(
        &self,
        ctx: &mut CallContext,
        mut request: NetworkServiceRequest,
        next: Next<'_>,
    ) -> MeshResult<Connection> {
        request
            .connection
            .context
            .extra_context
            .extend(self.values.iter().map(|(k, v)| (k.clone(), v.clone())));
        next.request(ctx, request).await
    }

    async fn close(
        &self,
        ctx: &mut CallContext,
        connection: Connection,
        next: Next<'_>,
    ) -> MeshResult<()> {
        next.close(ctx, connection).await
    }

    fn name(&self) -> &'static str {
        "set_extra_context"
    }
}
