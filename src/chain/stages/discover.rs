use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::chain::{ChainStage, Next};
use crate::core::{CallContext, Discovered, MeshError, MeshResult};
use crate::protocols::{Connection, NetworkServiceEndpoint, NetworkServiceRequest};
use crate::registry::RegistryClient;

const REGISTRY_ADDRESS: &str = "registry";

/// Resolves the requested network service to candidate endpoints.
///
/// With a forwarder service configured, a request whose path has not yet passed
/// through a forwarder is routed to the forwarders first.
pub struct DiscoverStage {
    registry: Arc<dyn RegistryClient>,
    forwarder_service: Option<String>,
}

impl DiscoverStage {
    pub fn new(registry: Arc<dyn RegistryClient>) -> Self {
        Self {
            registry,
            forwarder_service: None,
        }
    }

    pub fn with_forwarder_service(mut self, forwarder_service: Option<String>) -> Self {
        self.forwarder_service = forwarder_service;
        self
    }

    /// Registry lookups share the call's deadline.
    async fn bounded_discover(
        &self,
        ctx: &CallContext,
        connection: &Connection,
    ) -> MeshResult<Discovered> {
        let Some(remaining) = ctx.remaining() else {
            return self.discover(ctx, connection).await;
        };
        match tokio::time::timeout(remaining, self.discover(ctx, connection)).await {
            Ok(discovered) => discovered,
            Err(_) => Err(MeshError::Timeout {
                address: REGISTRY_ADDRESS.to_string(),
                timeout_ms: remaining.as_millis() as u64,
            }),
        }
    }

    async fn discover(&self, ctx: &CallContext, connection: &Connection) -> MeshResult<Discovered> {
        if let Some(discovered) = self.interpose(ctx, connection).await? {
            return Ok(discovered);
        }

        let service = &connection.network_service;

        if !connection.network_service_endpoint_name.is_empty() {
            let name = &connection.network_service_endpoint_name;
            let endpoint = self.registry.find_endpoint(name).await?.ok_or_else(|| {
                MeshError::Discovery {
                    network_service: service.clone(),
                    reason: format!("endpoint {} is not registered", name),
                }
            })?;
            if !endpoint.serves(service) {
                return Err(MeshError::Discovery {
                    network_service: service.clone(),
                    reason: format!("endpoint {} does not serve it", name),
                });
            }
            return Ok(Discovered {
                network_service: service.clone(),
                endpoints: vec![endpoint],
                interposed: false,
            });
        }

        let endpoints = self.registry.find_endpoints(service).await?;
        if endpoints.is_empty() {
            return Err(MeshError::Discovery {
                network_service: service.clone(),
                reason: "no endpoints registered".to_string(),
            });
        }
        Ok(Discovered {
            network_service: service.clone(),
            endpoints,
            interposed: false,
        })
    }

    async fn interpose(
        &self,
        ctx: &CallContext,
        connection: &Connection,
    ) -> MeshResult<Option<Discovered>> {
        let Some(forwarder_service) = &self.forwarder_service else {
            return Ok(None);
        };
        if &connection.network_service == forwarder_service {
            return Ok(None);
        }

        let forwarders = self.registry.find_endpoints(forwarder_service).await?;
        if forwarders.is_empty() {
            debug!(forwarder_service = %forwarder_service, "No forwarders registered, routing directly");
            return Ok(None);
        }
        if passed_forwarder(ctx, connection, &forwarders) {
            return Ok(None);
        }

        Ok(Some(Discovered {
            network_service: forwarder_service.clone(),
            endpoints: forwarders,
            interposed: true,
        }))
    }
}

/// Whether any hop before this one on the path is a forwarder.
fn passed_forwarder(
    ctx: &CallContext,
    connection: &Connection,
    forwarders: &[NetworkServiceEndpoint],
) -> bool {
    let segments = &connection.path.path_segments;
    let upstream = ctx
        .hop()
        .map(|hop| hop.index.min(segments.len()))
        .unwrap_or(segments.len());

    segments[..upstream]
        .iter()
        .any(|segment| forwarders.iter().any(|f| f.name == segment.name))
}

#[async_trait]
impl ChainStage for DiscoverStage {
    async fn request(
        &self,
        ctx: &mut CallContext,
        request: NetworkServiceRequest,
        next: Next<'_>,
    ) -> MeshResult<Connection> {
        let lookup = self.bounded_discover(ctx, &request.connection);
        let discovered = tokio::select! {
            biased;
            _ = ctx.cancellation().cancelled() => return Err(MeshError::Cancelled),
            discovered = lookup => discovered?,
        };
        debug!(
            network_service = %discovered.network_service,
            candidates = discovered.endpoints.len(),
            interposed = discovered.interposed,
            "Discovered candidates"
        );

        ctx.set_discovered(discovered);
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
        "discover"
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::chain::Chain;
    use crate::core::path;
    use crate::credentials::HopToken;
    use crate::protocols::NetworkService;
    use crate::registry::MemoryRegistry;

    /// Captures what discovery handed to the next stage.
    #[derive(Default)]
    struct Capture(parking_lot::Mutex<Option<Discovered>>);

    #[async_trait]
    impl ChainStage for Arc<Capture> {
        async fn request(
            &self,
            ctx: &mut CallContext,
            request: NetworkServiceRequest,
            _next: Next<'_>,
        ) -> MeshResult<Connection> {
            *self.0.lock() = ctx.take_discovered();
            Ok(request.connection)
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
            "capture"
        }
    }

    async fn registry() -> Arc<MemoryRegistry> {
        let registry = Arc::new(MemoryRegistry::new());
        for (name, service) in [
            ("nse-1", "my-service"),
            ("nse-2", "my-service"),
            ("cross-nse", "forwarder"),
        ] {
            registry
                .register_endpoint(
                    NetworkServiceEndpoint::new(name, format!("http://{}", name)).serving(service),
                )
                .await
                .unwrap();
        }
        registry
    }

    fn chain(stage: DiscoverStage) -> (Chain, Arc<Capture>) {
        let capture = Arc::new(Capture::default());
        let chain = Chain::builder("t").stage(stage).stage(capture.clone()).build();
        (chain, capture)
    }

    fn names(discovered: &Discovered) -> Vec<&str> {
        discovered.endpoints.iter().map(|e| e.name.as_str()).collect()
    }

    #[tokio::test]
    async fn test_candidates_in_registration_order() {
        let (chain, capture) = chain(DiscoverStage::new(registry().await));
        chain
            .request(
                &mut CallContext::new(),
                NetworkServiceRequest::new(Connection::new("1", "my-service")),
            )
            .await
            .unwrap();

        let discovered = capture.0.lock().clone().unwrap();
        assert_eq!(names(&discovered), vec!["nse-1", "nse-2"]);
        assert!(!discovered.interposed);
    }

    #[tokio::test]
    async fn test_unknown_service_is_discovery_error() {
        let (chain, capture) = chain(DiscoverStage::new(registry().await));
        let err = chain
            .request(
                &mut CallContext::new(),
                NetworkServiceRequest::new(Connection::new("1", "nope")),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Discovery { .. }));
        assert!(capture.0.lock().is_none());
    }

    #[tokio::test]
    async fn test_pinned_endpoint() {
        let (chain, capture) = chain(DiscoverStage::new(registry().await));
        let mut conn = Connection::new("1", "my-service");
        conn.network_service_endpoint_name = "nse-2".to_string();
        chain
            .request(&mut CallContext::new(), NetworkServiceRequest::new(conn))
            .await
            .unwrap();
        assert_eq!(names(&capture.0.lock().clone().unwrap()), vec!["nse-2"]);

        let mut conn = Connection::new("1", "my-service");
        conn.network_service_endpoint_name = "gone".to_string();
        let err = chain
            .request(&mut CallContext::new(), NetworkServiceRequest::new(conn))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Discovery { .. }));
    }

    #[tokio::test]
    async fn test_forwarder_interposed_until_passed() {
        let stage =
            DiscoverStage::new(registry().await).with_forwarder_service(Some("forwarder".into()));
        let (chain, capture) = chain(stage);
        let token = || HopToken {
            token: String::new(),
            expires: chrono::Utc::now(),
        };

        // First pass through the manager: no forwarder upstream.
        let mut conn = Connection::new("1", "my-service");
        let mut ctx = CallContext::new();
        ctx.set_hop(Some(path::enter_request(&mut conn.path, "nsmgr", token())));
        chain
            .request(&mut ctx, NetworkServiceRequest::new(conn.clone()))
            .await
            .unwrap();
        let discovered = capture.0.lock().clone().unwrap();
        assert!(discovered.interposed);
        assert_eq!(discovered.network_service, "forwarder");
        assert_eq!(names(&discovered), vec!["cross-nse"]);

        // Second pass: the forwarder is upstream now.
        path::enter_request(&mut conn.path, "cross-nse", token());
        let mut ctx = CallContext::new();
        ctx.set_hop(Some(path::enter_request(&mut conn.path, "nsmgr", token())));
        chain
            .request(&mut ctx, NetworkServiceRequest::new(conn))
            .await
            .unwrap();
        let discovered = capture.0.lock().clone().unwrap();
        assert!(!discovered.interposed);
        assert_eq!(names(&discovered), vec!["nse-1", "nse-2"]);
    }

    #[tokio::test]
    async fn test_cancelled_discovery() {
        let token = CancellationToken::new();
        token.cancel();
        let stage = DiscoverStage::new(registry().await);
        let mut ctx = CallContext::new()
            .with_cancellation(token)
            .with_timeout(Duration::from_secs(1));

        let err = stage
            .request(
                &mut ctx,
                NetworkServiceRequest::new(Connection::new("1", "my-service")),
                Next::new(&[]),
            )
            .await
            .unwrap_err();
        assert_eq!(err, MeshError::Cancelled);
        assert!(ctx.take_discovered().is_none());
    }

    /// Registry that answers every lookup after a fixed delay.
    struct SlowRegistry {
        delay: Duration,
        inner: MemoryRegistry,
    }

    #[async_trait]
    impl RegistryClient for SlowRegistry {
        async fn register_network_service(
            &self,
            service: NetworkService,
        ) -> MeshResult<NetworkService> {
            self.inner.register_network_service(service).await
        }

        async fn register_endpoint(
            &self,
            endpoint: NetworkServiceEndpoint,
        ) -> MeshResult<NetworkServiceEndpoint> {
            self.inner.register_endpoint(endpoint).await
        }

        async fn unregister_endpoint(&self, name: &str) -> MeshResult<bool> {
            self.inner.unregister_endpoint(name).await
        }

        async fn find_endpoints(
            &self,
            network_service: &str,
        ) -> MeshResult<Vec<NetworkServiceEndpoint>> {
            tokio::time::sleep(self.delay).await;
            self.inner.find_endpoints(network_service).await
        }

        async fn find_endpoint(&self, name: &str) -> MeshResult<Option<NetworkServiceEndpoint>> {
            tokio::time::sleep(self.delay).await;
            self.inner.find_endpoint(name).await
        }
    }

    #[tokio::test]
    async fn test_slow_registry_bounded_by_deadline() {
        let registry = SlowRegistry {
            delay: Duration::from_secs(2),
            inner: MemoryRegistry::new(),
        };
        registry
            .register_endpoint(
                NetworkServiceEndpoint::new("nse-1", "http://nse-1").serving("my-service"),
            )
            .await
            .unwrap();
        let (chain, capture) = chain(DiscoverStage::new(Arc::new(registry)));

        let started = std::time::Instant::now();
        let err = chain
            .request(
                &mut CallContext::new().with_timeout(Duration::from_millis(50)),
                NetworkServiceRequest::new(Connection::new("1", "my-service")),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, MeshError::Timeout { .. }), "{:?}", err);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(capture.0.lock().is_none());
    }
}
