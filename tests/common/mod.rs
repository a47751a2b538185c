// Helpers shared by the integration tests
#![allow(dead_code)]

pub mod mock_endpoint;

use std::{sync::Arc, time::Duration};

use mesh_router::{
    credentials::JwtCredentialSource,
    node::{Client, Node},
    protocols::NetworkServiceEndpoint,
    registry::{HttpRegistryClient, RegistryClient},
    server,
};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};

pub const TRUST_DOMAIN: &str = "test.mesh";

pub fn credentials() -> Arc<JwtCredentialSource> {
    Arc::new(JwtCredentialSource::new(
        b"integration-secret",
        TRUST_DOMAIN,
        Duration::from_secs(300),
    ))
}

pub fn identity(name: &str) -> String {
    format!("spiffe://{}/{}", TRUST_DOMAIN, name)
}

/// Reserve a local port and return its listener and URL.
pub async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    (listener, url)
}

/// URL of a port nothing is listening on.
pub fn closed_port_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{}", port)
}

/// A node served over HTTP for the duration of a test.
pub struct RunningNode {
    pub url: String,
    pub node: Arc<Node>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl RunningNode {
    pub async fn start(listener: TcpListener, url: String, node: Node) -> Self {
        let node = Arc::new(node);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let serve_node = node.clone();
        let handle = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            if let Err(e) = server::serve(listener, serve_node, shutdown).await {
                eprintln!("Server error: {}", e);
            }
        });
        Self {
            url,
            node,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for RunningNode {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

pub fn registry_client(manager_url: &str) -> HttpRegistryClient {
    HttpRegistryClient::new(manager_url, Duration::from_secs(2)).unwrap()
}

pub async fn register(manager_url: &str, endpoint: NetworkServiceEndpoint) {
    server::register_with_retry(&registry_client(manager_url), &endpoint)
        .await
        .unwrap();
}

pub async fn start_manager(forwarder_service: Option<&str>) -> RunningNode {
    let (listener, url) = bind().await;
    let node = Node::builder("nsmgr", credentials())
        .manager(
            Arc::new(mesh_router::registry::MemoryRegistry::new()),
            forwarder_service.map(str::to_string),
        )
        .build()
        .unwrap();
    RunningNode::start(listener, url, node).await
}

/// Start an endpoint and register it with the manager.
pub async fn start_endpoint(name: &str, manager_url: &str, services: &[&str]) -> RunningNode {
    let (listener, url) = bind().await;
    let node = Node::builder(name, credentials())
        .endpoint(
            [("perform".to_string(), "ok".to_string())].into(),
            Vec::new(),
        )
        .build()
        .unwrap();
    let running = RunningNode::start(listener, url.clone(), node).await;

    let endpoint = services
        .iter()
        .fold(NetworkServiceEndpoint::new(name, url), |ep, s| ep.serving(*s));
    register(manager_url, endpoint).await;
    running
}

pub async fn start_forwarder(name: &str, manager_url: &str) -> RunningNode {
    let (listener, url) = bind().await;
    let node = Node::builder(name, credentials())
        .cross_connect(Arc::new(registry_client(manager_url)), manager_url)
        .build()
        .unwrap();
    let running = RunningNode::start(listener, url.clone(), node).await;
    register(
        manager_url,
        NetworkServiceEndpoint::new(name, url).serving("forwarder"),
    )
    .await;
    running
}

pub fn client(manager_url: &str) -> Client {
    Client::builder("nsc-1", credentials())
        .connect_to(manager_url)
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

pub async fn registered(manager_url: &str, service: &str) -> Vec<NetworkServiceEndpoint> {
    registry_client(manager_url)
        .find_endpoints(service)
        .await
        .unwrap()
}
