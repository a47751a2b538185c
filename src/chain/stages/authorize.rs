use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::chain::{ChainStage, Next};
use crate::config::AuthorizePolicy;
use crate::core::{CallContext, MeshError, MeshResult};
use crate::credentials::CredentialSource;
use crate::protocols::{Connection, NetworkServiceRequest};

const ANONYMOUS: &str = "anonymous";

/// Admits or rejects the caller before any routing work happens.
///
/// The caller identity is the subject of the bearer token presented on the
/// inbound call. Applies to both requests and closes.
pub struct AuthorizeStage {
    policy: AuthorizePolicy,
    credentials: Arc<dyn CredentialSource>,
}

impl AuthorizeStage {
    pub fn new(policy: AuthorizePolicy, credentials: Arc<dyn CredentialSource>) -> Self {
        Self {
            policy,
            credentials,
        }
    }

    fn check(&self, ctx: &CallContext, network_service: &str) -> MeshResult<()> {
        if matches!(self.policy, AuthorizePolicy::Any) {
            return Ok(());
        }

        let identity = match ctx.caller_token() {
            Some(token) => {
                self.credentials
                    .verify(token)
                    .map_err(|e| MeshError::Authorization {
                        identity: ANONYMOUS.to_string(),
                        network_service: network_service.to_string(),
                        reason: e.to_string(),
                    })?
                    .sub
            }
            None => {
                return Err(MeshError::Authorization {
                    identity: ANONYMOUS.to_string(),
                    network_service: network_service.to_string(),
                    reason: "no caller credential presented".to_string(),
                })
            }
        };

        if self.policy.allows(&identity, network_service) {
            debug!(identity = %identity, network_service = %network_service, "Caller authorized");
            Ok(())
        } else {
            warn!(identity = %identity, network_service = %network_service, "Caller denied");
            Err(MeshError::Authorization {
                identity,
                network_service: network_service.to_string(),
                reason: "not permitted by policy".to_string(),
            })
        }
    }
}

#[async_trait]
impl ChainStage for AuthorizeStage {
    async fn request(
        &self,
        ctx: &mut CallContext,
        request: NetworkServiceRequest,
        next: Next<'_>,
    ) -> MeshResult<Connection> {
        self.check(ctx, &request.connection.network_service)?;
        next.request(ctx, request).await
    }

    async fn close(
        &self,
        ctx: &mut CallContext,
        connection: Connection,
        next: Next<'_>,
    ) -> MeshResult<()> {
        self.check(ctx, &connection.network_service)?;
        next.close(ctx, connection).await
    }

    fn name(&self) -> &'static str {
        "authorize"
    }
}
