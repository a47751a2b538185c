use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::chain::{ChainStage, Next};
use crate::core::{path, CallContext, MeshResult};
use crate::credentials::CredentialSource;
use crate::protocols::{Connection, NetworkServiceRequest};

/// Records this hop on the connection path.
///
/// Must be the first stage of any chain that receives calls from another hop; it
/// sets the hop position every later stage keys its state on.
pub struct UpdatePathStage {
    name: String,
    credentials: Arc<dyn CredentialSource>,
}

impl UpdatePathStage {
    pub fn new(name: impl Into<String>, credentials: Arc<dyn CredentialSource>) -> Self {
        Self {
            name: name.into(),
            credentials,
        }
    }
}

#[async_trait]
impl ChainStage for UpdatePathStage {
    async fn request(
        &self,
        ctx: &mut CallContext,
        mut request: NetworkServiceRequest,
        next: Next<'_>,
    ) -> MeshResult<Connection> {
        let token = self.credentials.token(&self.name)?;
        let position = path::enter_request(&mut request.connection.path, &self.name, token);
        debug!(
            hop = %self.name,
            index = position.index,
            segments = request.connection.path.len(),
            "Entered path"
        );
        ctx.set_hop(Some(position.clone()));

        let mut connection = next.request(ctx, request).await?;
        path::leave(&mut connection.path, &position);
        Ok(connection)
    }

    async fn close(
        &self,
        ctx: &mut CallContext,
        mut connection: Connection,
        next: Next<'_>,
    ) -> MeshResult<()> {
        let position = path::enter_close(&mut connection.path, &self.name);
        if position.is_none() {
            debug!(hop = %self.name, "Hop not on path, nothing was established here");
        }
        ctx.set_hop(position);
        next.close(ctx, connection).await
    }

    fn name(&self) -> &'static str {
        "update_path"
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::chain::Chain;
    use crate::credentials::JwtCredentialSource;

    fn creds() -> Arc<dyn CredentialSource> {
        Arc::new(JwtCredentialSource::new(
            b"secret",
            "test.mesh",
            Duration::from_secs(60),
        ))
    }

    #[tokio::test]
    async fn test_segment_appended_and_index_restored() {
        let chain = Chain::builder("nsmgr")
            .stage(UpdatePathStage::new("nsmgr", creds()))
            .build();
        let mut ctx = CallContext::new();

        let conn = chain
            .request(
                &mut ctx,
                NetworkServiceRequest::new(Connection::new("1", "my-service")),
            )
            .await
            .unwrap();

        assert_eq!(conn.path.len(), 1);
        assert_eq!(conn.path.path_segments[0].name, "nsmgr");
        assert!(!conn.path.path_segments[0].token.is_empty());
        assert_eq!(conn.path.index, 0);
        assert_eq!(
            ctx.hop().map(|h| h.segment_id.clone()),
            Some(conn.path.path_segments[0].id.clone())
        );
    }

    #[tokio::test]
    async fn test_rerequest_keeps_single_segment() {
        let chain = Chain::builder("nsmgr")
            .stage(UpdatePathStage::new("nsmgr", creds()))
            .build();

        let first = chain
            .request(
                &mut CallContext::new(),
                NetworkServiceRequest::new(Connection::new("1", "my-service")),
            )
            .await
            .unwrap();
        let second = chain
            .request(&mut CallContext::new(), NetworkServiceRequest::new(first.clone()))
            .await
            .unwrap();

        assert_eq!(second.path.len(), 1);
        assert_eq!(second.path.path_segments[0].id, first.path.path_segments[0].id);
    }

    #[tokio::test]
    async fn test_close_does_not_append() {
        let chain = Chain::builder("nse-1")
            .stage(UpdatePathStage::new("nse-1", creds()))
            .build();

        let mut ctx = CallContext::new();
        chain
            .close(&mut ctx, Connection::new("1", "my-service"))
            .await
            .unwrap();
        assert!(ctx.hop().is_none());
    }
}
