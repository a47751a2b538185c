// Endpoint stand-in with scripted behavior
#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::post, Json, Router};
use mesh_router::{
    protocols::{Connection, NetworkServiceRequest},
    transport::{CLOSE_PATH, REQUEST_PATH},
};
use tokio::sync::oneshot;

#[derive(Clone)]
pub struct MockEndpointConfig {
    pub response_delay: Duration,
}

#[derive(Clone)]
struct MockState {
    config: MockEndpointConfig,
    requests: Arc<AtomicUsize>,
}

pub struct MockEndpoint {
    pub url: String,
    requests: Arc<AtomicUsize>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl MockEndpoint {
    pub async fn start(config: MockEndpointConfig) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(AtomicUsize::new(0));

        let app = Router::new()
            .route(REQUEST_PATH, post(request_handler))
            .route(CLOSE_PATH, post(close_handler))
            .with_state(MockState {
                config,
                requests: requests.clone(),
            });

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                eprintln!("Mock endpoint error: {}", e);
            }
        });

        Self {
            url,
            requests,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Drop for MockEndpoint {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn request_handler(
    State(state): State<MockState>,
    Json(request): Json<NetworkServiceRequest>,
) -> impl IntoResponse {
    state.requests.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(state.config.response_delay).await;
    Json::<Connection>(request.connection)
}

async fn close_handler(Json(_connection): Json<Connection>) -> impl IntoResponse {
    StatusCode::NO_CONTENT
}
