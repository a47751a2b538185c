//! Forwards calls to the next hop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::chain::{ChainStage, Next};
use crate::core::{CallContext, MeshError, MeshResult};
use crate::credentials::CredentialSource;
use crate::protocols::{Connection, NetworkServiceRequest};
use crate::transport::{CallMetadata, ClientPool};

/// Sends the call to the next hop and returns its answer.
///
/// The destination is either fixed (`connect_to`) or the candidate chosen by the
/// selection stage. Forwarding ends the local chain: stages after this one are
/// never invoked.
pub struct ConnectStage {
    name: String,
    pool: Arc<ClientPool>,
    credentials: Arc<dyn CredentialSource>,
    call_timeout: Duration,
    connect_to: Option<String>,
}

impl ConnectStage {
    pub fn new(
        name: impl Into<String>,
        pool: Arc<ClientPool>,
        credentials: Arc<dyn CredentialSource>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            pool,
            credentials,
            call_timeout,
            connect_to: None,
        }
    }

    /// Always forward to `address`, ignoring any selection.
    pub fn connect_to(mut self, address: impl Into<String>) -> Self {
        self.connect_to = Some(address.into());
        self
    }

    fn destination(&self, ctx: &CallContext) -> Option<String> {
        self.connect_to
            .clone()
            .or_else(|| ctx.target().map(str::to_string))
    }

    fn metadata(&self, ctx: &CallContext) -> MeshResult<CallMetadata> {
        Ok(CallMetadata {
            token: Some(self.credentials.token(&self.name)?.token),
            deadline: ctx.remaining(),
        })
    }
}

#[async_trait]
impl ChainStage for ConnectStage {
    async fn request(
        &self,
        ctx: &mut CallContext,
        request: NetworkServiceRequest,
        _next: Next<'_>,
    ) -> MeshResult<Connection> {
        let address = self.destination(ctx).ok_or_else(|| {
            MeshError::internal("no destination selected for forwarding")
        })?;
        ctx.ensure_live(&address)?;
        ctx.set_dialed(address.clone());

        let client = self.pool.get_or_dial(&address).await?;
        let metadata = self.metadata(ctx)?;
        let timeout = ctx.bounded_timeout(self.call_timeout);

        debug!(address = %address, timeout_ms = timeout.as_millis() as u64, "Forwarding request");
        let result = tokio::select! {
            biased;
            _ = ctx.cancellation().cancelled() => Err(MeshError::Cancelled),
            result = tokio::time::timeout(timeout, client.request(&request, &metadata)) => {
                result.unwrap_or_else(|_| Err(MeshError::Timeout {
                    address: address.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                }))
            }
        };

        if let Err(MeshError::Dial { address: failed, .. }) = &result {
            if failed == &address {
                self.pool.evict(&address);
            }
        }
        result
    }

    async fn close(
        &self,
        ctx: &mut CallContext,
        connection: Connection,
        _next: Next<'_>,
    ) -> MeshResult<()> {
        let Some(address) = self.destination(ctx) else {
            debug!(connection_id = %connection.id, "Nothing downstream to close");
            return Ok(());
        };
        ctx.ensure_live(&address)?;

        let client = self.pool.get_or_dial(&address).await?;
        let metadata = self.metadata(ctx)?;
        let timeout = ctx.bounded_timeout(self.call_timeout);

        debug!(address = %address, "Forwarding close");
        tokio::select! {
            biased;
            _ = ctx.cancellation().cancelled() => Err(MeshError::Cancelled),
            result = tokio::time::timeout(timeout, client.close(&connection, &metadata)) => {
                result.unwrap_or_else(|_| Err(MeshError::Timeout {
                    address: address.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                }))
            }
        }
    }

    fn name(&self) -> &'static str {
        "connect"
    }
}
