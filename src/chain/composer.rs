use std::sync::Arc;

use tracing::{debug, info_span, Instrument};

use super::{ChainStage, Next};
use crate::core::{CallContext, MeshError, MeshResult};
use crate::protocols::{Connection, NetworkServiceRequest};

/// Ordered list of stages, assembled once and shared by every call.
#[derive(Clone)]
pub struct Chain {
    name: String,
    stages: Arc<[Arc<dyn ChainStage>]>,
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("name", &self.name)
            .field("stages", &self.stage_names())
            .finish()
    }
}

impl Chain {
    pub fn builder(name: impl Into<String>) -> ChainBuilder {
        ChainBuilder {
            name: name.into(),
            stages: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    pub async fn request(
        &self,
        ctx: &mut CallContext,
        request: NetworkServiceRequest,
    ) -> MeshResult<Connection> {
        validate(&request.connection)?;
        if ctx.is_cancelled() {
            return Err(MeshError::Cancelled);
        }

        let span = info_span!(
            "request",
            chain = %self.name,
            connection_id = %request.connection.id,
            network_service = %request.connection.network_service,
        );
        async {
            debug!(stages = self.stages.len(), "Running request chain");
            Next::new(&self.stages).request(ctx, request).await
        }
        .instrument(span)
        .await
    }

    pub async fn close(&self, ctx: &mut CallContext, connection: Connection) -> MeshResult<()> {
        validate(&connection)?;

        let span = info_span!(
            "close",
            chain = %self.name,
            connection_id = %connection.id,
        );
        async {
            debug!(stages = self.stages.len(), "Running close chain");
            Next::new(&self.stages).close(ctx, connection).await
        }
        .instrument(span)
        .await
    }
}

fn validate(connection: &Connection) -> MeshResult<()> {
    if connection.id.is_empty() {
        return Err(MeshError::invalid("connection id must not be empty"));
    }
    if connection.network_service.is_empty() {
        return Err(MeshError::invalid("network service must not be empty"));
    }
    let path = &connection.path;
    if !path.is_empty() && path.index as usize >= path.len() {
        return Err(MeshError::invalid(format!(
            "path index {} out of range for {} segments",
            path.index,
            path.len()
        )));
    }
    Ok(())
}

pub struct ChainBuilder {
    name: String,
    stages: Vec<Arc<dyn ChainStage>>,
}

impl ChainBuilder {
    pub fn stage<S: ChainStage + 'static>(mut self, stage: S) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    pub fn shared_stage(mut self, stage: Arc<dyn ChainStage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn build(self) -> Chain {
        Chain {
            name: self.name,
            stages: Arc::from(self.stages),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::protocols::PathSegment;

    /// Records the order in which stages see requests and closes.
    #[derive(Clone, Default)]
    struct Journal(Arc<Mutex<Vec<String>>>);

    impl Journal {
        fn push(&self, entry: String) {
            self.0.lock().push(entry);
        }

        fn entries(&self) -> Vec<String> {
            self.0.lock().clone()
        }
    }

    struct Recording {
        label: &'static str,
        journal: Journal,
    }

    #[async_trait]
    impl ChainStage for Recording {
        async fn request(
            &self,
            ctx: &mut CallContext,
            request: NetworkServiceRequest,
            next: Next<'_>,
        ) -> MeshResult<Connection> {
            self.journal.push(format!("request:{}", self.label));
            next.request(ctx, request).await
        }

        async fn close(
            &self,
            ctx: &mut CallContext,
            connection: Connection,
            next: Next<'_>,
        ) -> MeshResult<()> {
            self.journal.push(format!("close:{}", self.label));
            next.close(ctx, connection).await
        }

        fn name(&self) -> &'static str {
            self.label
        }
    }

    /// Fails after its tail succeeded.
    struct FailAfterNext;

    #[async_trait]
    impl ChainStage for FailAfterNext {
        async fn request(
            &self,
            ctx: &mut CallContext,
            request: NetworkServiceRequest,
            next: Next<'_>,
        ) -> MeshResult<Connection> {
            next.request(ctx, request).await?;
            Err(MeshError::internal("post-processing failed"))
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
            "fail_after_next"
        }
    }

    struct Reject(Arc<AtomicUsize>);

    #[async_trait]
    impl ChainStage for Reject {
        async fn request(
            &self,
            _ctx: &mut CallContext,
            _request: NetworkServiceRequest,
            _next: Next<'_>,
        ) -> MeshResult<Connection> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(MeshError::invalid("rejected"))
        }

        async fn close(
            &self,
            _ctx: &mut CallContext,
            _connection: Connection,
            _next: Next<'_>,
        ) -> MeshResult<()> {
            Ok(())
        }

        fn name(&self) -> &'static str {
            "reject"
        }
    }

    fn recording(label: &'static str, journal: &Journal) -> Recording {
        Recording {
            label,
            journal: journal.clone(),
        }
    }

    fn request() -> NetworkServiceRequest {
        NetworkServiceRequest::new(Connection::new("1", "my-service"))
    }

    #[tokio::test]
    async fn test_stages_run_in_order_for_request_and_close() {
        let journal = Journal::default();
        let chain = Chain::builder("test")
            .stage(recording("a", &journal))
            .stage(recording("b", &journal))
            .stage(recording("c", &journal))
            .build();

        let conn = chain
            .request(&mut CallContext::new(), request())
            .await
            .unwrap();
        assert_eq!(conn.id, "1");
        chain.close(&mut CallContext::new(), conn).await.unwrap();

        assert_eq!(
            journal.entries(),
            vec![
                "request:a", "request:b", "request:c", "close:a", "close:b", "close:c"
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_chain_echoes_connection() {
        let chain = Chain::builder("empty").build();
        let conn = chain
            .request(&mut CallContext::new(), request())
            .await
            .unwrap();
        assert_eq!(conn, request().connection);
        assert!(chain.close(&mut CallContext::new(), conn).await.is_ok());
    }

    #[tokio::test]
    async fn test_failure_short_circuits() {
        let journal = Journal::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = Chain::builder("test")
            .stage(recording("a", &journal))
            .stage(Reject(calls.clone()))
            .stage(recording("never", &journal))
            .build();

        let err = chain
            .request(&mut CallContext::new(), request())
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::InvalidRequest { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(journal.entries(), vec!["request:a"]);
    }

    #[tokio::test]
    async fn test_established_tail_closed_when_stage_fails_afterwards() {
        let journal = Journal::default();
        let chain = Chain::builder("test")
            .stage(recording("head", &journal))
            .stage(FailAfterNext)
            .stage(recording("tail", &journal))
            .stage(recording("leaf", &journal))
            .build();

        let err = chain
            .request(&mut CallContext::new(), request())
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Internal { .. }));
        assert_eq!(
            journal.entries(),
            vec![
                "request:head",
                "request:tail",
                "request:leaf",
                "close:tail",
                "close:leaf"
            ]
        );
    }

    #[tokio::test]
    async fn test_invalid_connections_rejected_before_stages() {
        let journal = Journal::default();
        let chain = Chain::builder("test")
            .stage(recording("a", &journal))
            .build();

        let err = chain
            .request(
                &mut CallContext::new(),
                NetworkServiceRequest::new(Connection::new("", "svc")),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::InvalidRequest { .. }));

        let err = chain
            .close(&mut CallContext::new(), Connection::new("1", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::InvalidRequest { .. }));
        assert!(journal.entries().is_empty());
    }

    #[tokio::test]
    async fn test_path_index_out_of_range_rejected() {
        let journal = Journal::default();
        let chain = Chain::builder("test")
            .stage(recording("a", &journal))
            .build();

        let mut conn = Connection::new("1", "my-service");
        conn.path.path_segments.push(PathSegment {
            name: "nsmgr".to_string(),
            id: "seg-1".to_string(),
            token: String::new(),
            expires: chrono::Utc::now(),
        });
        conn.path.index = 1;

        let err = chain
            .request(&mut CallContext::new(), NetworkServiceRequest::new(conn.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::InvalidRequest { .. }));
        let err = chain
            .close(&mut CallContext::new(), conn.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::InvalidRequest { .. }));
        assert!(journal.entries().is_empty());

        conn.path.index = 0;
        chain
            .request(&mut CallContext::new(), NetworkServiceRequest::new(conn))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let ctx_token = tokio_util::sync::CancellationToken::new();
        ctx_token.cancel();
        let chain = Chain::builder("test").build();
        let err = chain
            .request(&mut CallContext::new().with_cancellation(ctx_token), request())
            .await
            .unwrap_err();
        assert_eq!(err, MeshError::Cancelled);
    }

    #[test]
    fn test_stage_names() {
        let journal = Journal::default();
        let chain = Chain::builder("test")
            .stage(recording("a", &journal))
            .stage(FailAfterNext)
            .build();
        assert_eq!(chain.stage_names(), vec!["a", "fail_after_next"]);
    }
}
