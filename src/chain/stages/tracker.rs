//! Tracks which connections are established through this hop.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::chain::{ChainStage, Next};
use crate::core::{CallContext, ConnectionPhase, MeshResult};
use crate::protocols::{Connection, NetworkServiceRequest};

#[derive(Debug, Clone)]
pub struct TrackedConnection {
    /// Connection as last returned downstream of this hop.
    pub connection: Connection,
    pub established_at: DateTime<Utc>,
    pub refreshed_at: Option<DateTime<Utc>>,
}

/// Makes close idempotent: only connections established through this hop are
/// relayed downstream, and each of them at most once.
///
/// A re-request for an established id that arrives without a path is sent with
/// the path last returned for it, so the hops below refresh their segments
/// instead of building a second route.
#[derive(Debug, Default)]
pub struct ConnectionTrackerStage {
    connections: DashMap<String, TrackedConnection>,
}

impl ConnectionTrackerStage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_established(&self, hop_key: &str) -> bool {
        self.connections.contains_key(hop_key)
    }

    pub fn get(&self, hop_key: &str) -> Option<TrackedConnection> {
        self.connections.get(hop_key).map(|tracked| tracked.value().clone())
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[async_trait]
impl ChainStage for ConnectionTrackerStage {
    async fn request(
        &self,
        ctx: &mut CallContext,
        mut request: NetworkServiceRequest,
        next: Next<'_>,
    ) -> MeshResult<Connection> {
        let key = ctx.hop_key(&request.connection);
        let established_at = match self.connections.get(&key) {
            Some(tracked) => {
                let previous = &tracked.connection;
                if request.connection.path.is_empty() {
                    request.connection.path = previous.path.clone();
                }
                if request.connection.network_service_endpoint_name.is_empty() {
                    request.connection.network_service_endpoint_name =
                        previous.network_service_endpoint_name.clone();
                }
                Some(tracked.established_at)
            }
            None => None,
        };

        match next.request(ctx, request).await {
            Ok(connection) => {
                let now = Utc::now();
                self.connections.insert(
                    key,
                    TrackedConnection {
                        connection: connection.clone(),
                        established_at: established_at.unwrap_or(now),
                        refreshed_at: established_at.map(|_| now),
                    },
                );
                debug!(
                    connection_id = %connection.id,
                    phase = %ConnectionPhase::Established,
                    refreshed = established_at.is_some(),
                    established_at = ?established_at,
                    "Connection established"
                );
                Ok(connection)
            }
            Err(err) => {
                debug!(
                    phase = %ConnectionPhase::from_error(&err),
                    error_kind = err.kind(),
                    "Request failed"
                );
                Err(err)
            }
        }
    }

    async fn close(
        &self,
        ctx: &mut CallContext,
        connection: Connection,
        next: Next<'_>,
    ) -> MeshResult<()> {
        let key = ctx.hop_key(&connection);
        // Removed before relaying so a failed close cannot resurrect it.
        let Some((_, tracked)) = self.connections.remove(&key) else {
            debug!(connection_id = %connection.id, "Close of unknown or closed connection");
            return Ok(());
        };

        let tracked = &tracked.connection;
        debug!(
            connection_id = %tracked.id,
            network_service = %tracked.network_service,
            phase = %ConnectionPhase::Closing,
            "Closing"
        );
        match next.close(ctx, connection).await {
            Ok(()) => {
                debug!(connection_id = %tracked.id, phase = %ConnectionPhase::Closed, "Closed");
                Ok(())
            }
            Err(err) => {
                warn!(
                    connection_id = %tracked.id,
                    network_service = %tracked.network_service,
                    error = %err,
                    "Downstream close failed, connection dropped locally"
                );
                Err(err)
            }
        }
    }

    fn name(&self) -> &'static str {
        "tracker"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::chain::stages::UpdatePathStage;
    use crate::chain::Chain;
    use crate::core::MeshError;
    use crate::credentials::JwtCredentialSource;

    /// Counts closes that reach the end of the chain; optionally fails them.
    struct Sink {
        closes: Arc<AtomicUsize>,
        fail_close: bool,
        fail_request: bool,
    }

    #[async_trait]
    impl ChainStage for Sink {
        async fn request(
            &self,
            ctx: &mut CallContext,
            request: NetworkServiceRequest,
            next: Next<'_>,
        ) -> MeshResult<Connection> {
            if self.fail_request {
                return Err(MeshError::dial("http://nowhere", "refused"));
            }
            next.request(ctx, request).await
        }

        async fn close(
            &self,
            _ctx: &mut CallContext,
            _connection: Connection,
            _next: Next<'_>,
        ) -> MeshResult<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail_close {
                Err(MeshError::dial("http://nowhere", "refused"))
            } else {
                Ok(())
            }
        }

        fn name(&self) -> &'static str {
            "sink"
        }
    }

    fn chain(
        tracker: Arc<ConnectionTrackerStage>,
        fail_request: bool,
        fail_close: bool,
    ) -> (Chain, Arc<AtomicUsize>) {
        let closes = Arc::new(AtomicUsize::new(0));
        let chain = Chain::builder("t")
            .shared_stage(tracker)
            .stage(Sink {
                closes: closes.clone(),
                fail_close,
                fail_request,
            })
            .build();
        (chain, closes)
    }

    fn request() -> NetworkServiceRequest {
        NetworkServiceRequest::new(Connection::new("1", "my-service"))
    }

    #[tokio::test]
    async fn test_double_close_relays_once() {
        let tracker = Arc::new(ConnectionTrackerStage::new());
        let (chain, closes) = chain(tracker.clone(), false, false);

        let conn = chain.request(&mut CallContext::new(), request()).await.unwrap();
        assert!(tracker.is_established("1"));

        chain.close(&mut CallContext::new(), conn.clone()).await.unwrap();
        chain.close(&mut CallContext::new(), conn).await.unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_failed_request_leaves_nothing() {
        let tracker = Arc::new(ConnectionTrackerStage::new());
        let (chain, closes) = chain(tracker.clone(), true, false);

        assert!(chain.request(&mut CallContext::new(), request()).await.is_err());
        assert!(tracker.is_empty());

        chain
            .close(&mut CallContext::new(), request().connection)
            .await
            .unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_close_not_resurrected() {
        let tracker = Arc::new(ConnectionTrackerStage::new());
        let (chain, closes) = chain(tracker.clone(), false, true);

        let conn = chain.request(&mut CallContext::new(), request()).await.unwrap();
        assert!(chain.close(&mut CallContext::new(), conn.clone()).await.is_err());
        assert!(tracker.is_empty());

        chain.close(&mut CallContext::new(), conn).await.unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rerequest_keeps_one_entry() {
        let tracker = Arc::new(ConnectionTrackerStage::new());
        let (chain, _) = chain(tracker.clone(), false, false);

        let conn = chain.request(&mut CallContext::new(), request()).await.unwrap();
        chain
            .request(&mut CallContext::new(), NetworkServiceRequest::new(conn))
            .await
            .unwrap();
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test]
    async fn test_rerequest_without_path_reuses_route() {
        let creds = Arc::new(JwtCredentialSource::new(
            b"secret",
            "test.mesh",
            Duration::from_secs(60),
        ));
        let tracker = Arc::new(ConnectionTrackerStage::new());
        let chain = Chain::builder("nsc")
            .shared_stage(tracker.clone())
            .stage(UpdatePathStage::new("nsmgr", creds))
            .build();

        let first = chain.request(&mut CallContext::new(), request()).await.unwrap();
        let second = chain.request(&mut CallContext::new(), request()).await.unwrap();

        assert_eq!(second.path.len(), 1);
        assert_eq!(second.path.path_segments[0].id, first.path.path_segments[0].id);
        assert_eq!(tracker.len(), 1);

        let tracked = tracker.get("1").unwrap();
        assert!(tracked.refreshed_at.is_some());
        assert_eq!(tracked.connection.path, second.path);
    }
}
