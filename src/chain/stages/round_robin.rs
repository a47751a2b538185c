//! Round-robin candidate selection with bounded failover

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::chain::{ChainStage, Next};
use crate::core::{CallContext, MeshError, MeshResult};
use crate::protocols::{Connection, NetworkServiceEndpoint, NetworkServiceRequest};

#[derive(Debug, Clone)]
struct Selection {
    endpoint: String,
    url: String,
}

/// Picks a candidate per request, rotating per network service.
///
/// Each service has its own cursor, advanced once per fresh request. Starting at
/// the cursor, candidates are tried in order with wrap-around, each at most once;
/// only dial and timeout failures against a candidate move on to the next one.
/// A re-request for an established hop tries its earlier selection first.
#[derive(Debug, Default)]
pub struct RoundRobinStage {
    cursors: DashMap<String, Arc<AtomicUsize>>,
    selections: DashMap<String, Selection>,
}

impl RoundRobinStage {
    pub fn new() -> Self {
        Self::default()
    }

    fn cursor(&self, network_service: &str) -> Arc<AtomicUsize> {
        if let Some(cursor) = self.cursors.get(network_service) {
            return Arc::clone(cursor.value());
        }
        self.cursors
            .entry(network_service.to_string())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .value()
            .clone()
    }

    /// Candidate indices in the order they will be attempted.
    fn attempt_order(
        &self,
        network_service: &str,
        endpoints: &[NetworkServiceEndpoint],
        sticky: Option<&str>,
    ) -> Vec<usize> {
        let n = endpoints.len();
        let sticky = sticky.and_then(|name| endpoints.iter().position(|e| e.name == name));

        let cursor = self.cursor(network_service);
        let start = match sticky {
            Some(_) => cursor.load(Ordering::Relaxed) % n,
            None => cursor.fetch_add(1, Ordering::Relaxed) % n,
        };

        let mut order: Vec<usize> = (0..n).map(|i| (start + i) % n).collect();
        if let Some(index) = sticky {
            order.retain(|&i| i != index);
            order.insert(0, index);
        }
        order
    }

    pub fn selected_endpoint(&self, hop_key: &str) -> Option<String> {
        self.selections.get(hop_key).map(|s| s.endpoint.clone())
    }
}

#[async_trait]
impl ChainStage for RoundRobinStage {
    async fn request(
        &self,
        ctx: &mut CallContext,
        request: NetworkServiceRequest,
        next: Next<'_>,
    ) -> MeshResult<Connection> {
        let network_service = request.connection.network_service.clone();
        let discovered = ctx.take_discovered().ok_or_else(|| MeshError::Discovery {
            network_service: network_service.clone(),
            reason: "no candidates were discovered".to_string(),
        })?;
        if discovered.endpoints.is_empty() {
            return Err(MeshError::Discovery {
                network_service,
                reason: "no endpoints registered".to_string(),
            });
        }

        let key = ctx.hop_key(&request.connection);
        let previous = self.selections.get(&key).map(|s| s.endpoint.clone());
        let order = self.attempt_order(
            &discovered.network_service,
            &discovered.endpoints,
            previous.as_deref(),
        );

        let mut last_failure: Option<(String, MeshError)> = None;
        for (attempt, index) in order.iter().enumerate() {
            let candidate = &discovered.endpoints[*index];
            ctx.ensure_live(&candidate.url)?;

            let mut attempt_request = request.clone();
            if !discovered.interposed {
                attempt_request.connection.network_service_endpoint_name = candidate.name.clone();
            }
            ctx.set_target(Some(candidate.url.clone()));

            debug!(
                network_service = %discovered.network_service,
                candidate = %candidate.name,
                attempt = attempt + 1,
                "Trying candidate"
            );

            match next.request(ctx, attempt_request).await {
                Ok(connection) => {
                    self.selections.insert(
                        key,
                        Selection {
                            endpoint: candidate.name.clone(),
                            url: candidate.url.clone(),
                        },
                    );
                    return Ok(connection);
                }
                Err(err) if err.is_retryable_for(ctx.dialed()) => {
                    warn!(
                        network_service = %discovered.network_service,
                        candidate = %candidate.name,
                        address = %candidate.url,
                        error = %err,
                        "Candidate unreachable, trying next"
                    );
                    last_failure = Some((candidate.url.clone(), err));
                }
                Err(err) => return Err(err),
            }
        }

        let (last_address, last_error) = last_failure.ok_or_else(|| {
            MeshError::internal("selection finished without attempting a candidate")
        })?;
        Err(MeshError::NoReachableEndpoint {
            network_service: discovered.network_service,
            attempts: order.len(),
            last_address,
            last_error: Box::new(last_error),
        })
    }

    async fn close(
        &self,
        ctx: &mut CallContext,
        connection: Connection,
        next: Next<'_>,
    ) -> MeshResult<()> {
        let key = ctx.hop_key(&connection);
        match self.selections.remove(&key) {
            Some((_, selection)) => {
                debug!(candidate = %selection.endpoint, "Closing through selected candidate");
                ctx.set_target(Some(selection.url));
            }
            None => {
                debug!(connection_id = %connection.id, "No selection recorded for close");
                ctx.set_target(None);
            }
        }
        next.close(ctx, connection).await
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::chain::Chain;
    use crate::core::Discovered;

    /// Stand-in for discovery: always offers the same candidates.
    struct Offer(Vec<NetworkServiceEndpoint>);

    #[async_trait]
    impl ChainStage for Offer {
        async fn request(
            &self,
            ctx: &mut CallContext,
            request: NetworkServiceRequest,
            next: Next<'_>,
        ) -> MeshResult<Connection> {
            ctx.set_discovered(Discovered {
                network_service: request.connection.network_service.clone(),
                endpoints: self.0.clone(),
                interposed: false,
            });
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
            "offer"
        }
    }

    /// Stand-in for forwarding: fails per address as configured and records hits.
    #[derive(Default)]
    struct Target {
        failures: HashMap<String, MeshError>,
        hits: Mutex<Vec<String>>,
        closes: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChainStage for Arc<Target> {
        async fn request(
            &self,
            ctx: &mut CallContext,
            request: NetworkServiceRequest,
            _next: Next<'_>,
        ) -> MeshResult<Connection> {
            let address = ctx.target().unwrap_or_default().to_string();
            ctx.set_dialed(address.clone());
            self.hits.lock().push(address.clone());
            match self.failures.get(&address) {
                Some(err) => Err(err.clone()),
                None => Ok(request.connection),
            }
        }

        async fn close(
            &self,
            ctx: &mut CallContext,
            _connection: Connection,
            _next: Next<'_>,
        ) -> MeshResult<()> {
            if let Some(address) = ctx.target() {
                self.closes.lock().push(address.to_string());
            }
            Ok(())
        }

        fn name(&self) -> &'static str {
            "target"
        }
    }

    fn endpoints(n: usize) -> Vec<NetworkServiceEndpoint> {
        (0..n)
            .map(|i| {
                NetworkServiceEndpoint::new(format!("nse-{}", i), format!("http://nse-{}", i))
                    .serving("my-service")
            })
            .collect()
    }

    fn chain(n: usize, target: Arc<Target>) -> Chain {
        Chain::builder("t")
            .stage(Offer(endpoints(n)))
            .stage(RoundRobinStage::new())
            .stage(target)
            .build()
    }

    fn request(id: &str) -> NetworkServiceRequest {
        NetworkServiceRequest::new(Connection::new(id, "my-service"))
    }

    #[tokio::test]
    async fn test_distribution_is_fair_and_alternating() {
        let target = Arc::new(Target::default());
        let chain = chain(3, target.clone());

        for i in 0..10 {
            chain
                .request(&mut CallContext::new(), request(&i.to_string()))
                .await
                .unwrap();
        }

        let hits = target.hits.lock().clone();
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for hit in &hits {
            *counts.entry(hit.as_str()).or_default() += 1;
        }
        // ceil(10 / 3) = 4
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|&c| c <= 4), "{:?}", counts);
        for pair in hits.windows(2) {
            assert_ne!(pair[0], pair[1]);
        }
    }

    #[tokio::test]
    async fn test_sets_endpoint_name() {
        let target = Arc::new(Target::default());
        let conn = chain(2, target)
            .request(&mut CallContext::new(), request("1"))
            .await
            .unwrap();
        assert_eq!(conn.network_service_endpoint_name, "nse-0");
    }

    #[tokio::test]
    async fn test_unreachable_candidate_absorbed() {
        let mut target = Target::default();
        target.failures.insert(
            "http://nse-0".to_string(),
            MeshError::dial("http://nse-0", "connection refused"),
        );
        let target = Arc::new(target);

        let conn = chain(2, target.clone())
            .request(&mut CallContext::new(), request("1"))
            .await
            .unwrap();

        assert_eq!(conn.network_service_endpoint_name, "nse-1");
        assert_eq!(
            target.hits.lock().clone(),
            vec!["http://nse-0", "http://nse-1"]
        );
    }

    #[tokio::test]
    async fn test_all_unreachable() {
        let mut target = Target::default();
        for i in 0..3 {
            let address = format!("http://nse-{}", i);
            target
                .failures
                .insert(address.clone(), MeshError::dial(address, "refused"));
        }
        let target = Arc::new(target);

        let err = chain(3, target.clone())
            .request(&mut CallContext::new(), request("1"))
            .await
            .unwrap_err();

        match err {
            MeshError::NoReachableEndpoint {
                attempts,
                last_address,
                last_error,
                ..
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(last_address, "http://nse-2");
                assert!(matches!(*last_error, MeshError::Dial { .. }));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(target.hits.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_downstream_failure_not_retried() {
        let mut target = Target::default();
        // Reported by a hop further away: the address is not the one dialed here.
        target.failures.insert(
            "http://nse-0".to_string(),
            MeshError::dial("http://far-away", "refused"),
        );
        let target = Arc::new(target);

        let err = chain(2, target.clone())
            .request(&mut CallContext::new(), request("1"))
            .await
            .unwrap_err();

        assert_eq!(err, MeshError::dial("http://far-away", "refused"));
        assert_eq!(target.hits.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_rerequest_sticks_and_close_uses_selection() {
        let target = Arc::new(Target::default());
        let chain = chain(3, target.clone());

        let conn = chain
            .request(&mut CallContext::new(), request("1"))
            .await
            .unwrap();
        // Another request moves the cursor on.
        chain
            .request(&mut CallContext::new(), request("2"))
            .await
            .unwrap();
        let again = chain
            .request(&mut CallContext::new(), NetworkServiceRequest::new(conn.clone()))
            .await
            .unwrap();
        assert_eq!(
            again.network_service_endpoint_name,
            conn.network_service_endpoint_name
        );

        chain.close(&mut CallContext::new(), conn).await.unwrap();
        assert_eq!(target.closes.lock().clone(), vec!["http://nse-0"]);
    }

    #[tokio::test]
    async fn test_expired_deadline_stops_attempts() {
        let target = Arc::new(Target::default());
        let mut ctx = CallContext::new().with_timeout(Duration::ZERO);
        let err = chain(2, target.clone())
            .request(&mut ctx, request("1"))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Timeout { .. }));
        assert!(target.hits.lock().is_empty());
    }
}
