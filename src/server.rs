use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use http::{header::AUTHORIZATION, HeaderMap, StatusCode};
use rand::Rng;
use rustls::crypto::ring;
use serde_json::json;
use tokio::{net::TcpListener, signal, spawn};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::config::{NodeConfig, NodeRole};
use crate::core::{CallContext, MeshError};
use crate::credentials::{CredentialSource, JwtCredentialSource, TlsIdentity};
use crate::node::Node;
use crate::observability::{init_logging, parse_level, LoggingConfig};
use crate::protocols::{
    Connection, EndpointQuery, NetworkService, NetworkServiceEndpoint, NetworkServiceRequest,
};
use crate::registry::{HttpRegistryClient, MemoryRegistry, RegistryClient};
use crate::transport::{ErrorBody, HttpDialer, CLOSE_PATH, DEADLINE_HEADER, REQUEST_PATH};

const REGISTRATION_ATTEMPTS: u32 = 10;
const REGISTRATION_BASE_BACKOFF_MS: u64 = 200;
const REGISTRATION_MAX_BACKOFF_MS: u64 = 5_000;

#[derive(Clone)]
pub struct AppState {
    pub node: Arc<Node>,
}

/// Map an error to the status it is answered with. The body always carries the
/// error itself.
fn status_for(error: &MeshError) -> StatusCode {
    match error {
        MeshError::Authorization { .. } => StatusCode::FORBIDDEN,
        MeshError::Credential { .. } => StatusCode::UNAUTHORIZED,
        MeshError::Discovery { .. } => StatusCode::NOT_FOUND,
        MeshError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
        MeshError::NoSupportedMechanism { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        MeshError::Dial { .. } | MeshError::Registry { .. } => StatusCode::BAD_GATEWAY,
        MeshError::NoReachableEndpoint { .. } | MeshError::Cancelled => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        MeshError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        MeshError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: MeshError) -> Response {
    let status = status_for(&error);
    if status.is_server_error() {
        warn!(kind = error.kind(), error = %error, "Call failed");
    } else {
        debug!(kind = error.kind(), error = %error, "Call rejected");
    }
    (status, Json(ErrorBody { error })).into_response()
}

/// Registry rejections are the caller's fault on the registry routes.
fn registry_error_response(error: MeshError) -> Response {
    match error {
        MeshError::Registry { .. } => {
            debug!(error = %error, "Registration rejected");
            (StatusCode::BAD_REQUEST, Json(ErrorBody { error })).into_response()
        }
        other => error_response(other),
    }
}

/// Build the call context for an inbound RPC from its headers.
fn call_context(node: &Node, headers: &HeaderMap) -> CallContext {
    let mut timeout = node.request_timeout();
    if let Some(ms) = headers
        .get(DEADLINE_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    {
        timeout = timeout.min(Duration::from_millis(ms));
    }

    let mut ctx = CallContext::new().with_timeout(timeout);
    if let Some(token) = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        ctx = ctx.with_caller_token(token.trim());
    }
    ctx
}

async fn health(State(state): State<AppState>) -> Response {
    Json(json!({
        "status": "ok",
        "name": state.node.name(),
        "connections": state.node.established_connections(),
    }))
    .into_response()
}

async fn network_service_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<NetworkServiceRequest>,
) -> Response {
    let mut ctx = call_context(&state.node, &headers);
    match state.node.request(&mut ctx, request).await {
        Ok(connection) => Json(connection).into_response(),
        Err(e) => error_response(e),
    }
}

async fn network_service_close(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(connection): Json<Connection>,
) -> Response {
    let mut ctx = call_context(&state.node, &headers);
    match state.node.close(&mut ctx, connection).await {
        Ok(()) => Json(json!({})).into_response(),
        Err(e) => error_response(e),
    }
}

async fn register_network_service(
    State(registry): State<Arc<MemoryRegistry>>,
    Json(service): Json<NetworkService>,
) -> Response {
    match registry.register_network_service(service).await {
        Ok(service) => Json(service).into_response(),
        Err(e) => registry_error_response(e),
    }
}

async fn register_endpoint(
    State(registry): State<Arc<MemoryRegistry>>,
    Json(endpoint): Json<NetworkServiceEndpoint>,
) -> Response {
    match registry.register_endpoint(endpoint).await {
        Ok(endpoint) => Json(endpoint).into_response(),
        Err(e) => registry_error_response(e),
    }
}

async fn find_endpoints(
    State(registry): State<Arc<MemoryRegistry>>,
    Query(query): Query<EndpointQuery>,
) -> Response {
    match registry.find_endpoints(&query.network_service).await {
        Ok(endpoints) => Json(endpoints).into_response(),
        Err(e) => registry_error_response(e),
    }
}

async fn get_endpoint(
    State(registry): State<Arc<MemoryRegistry>>,
    Path(name): Path<String>,
) -> Response {
    match registry.find_endpoint(&name).await {
        Ok(Some(endpoint)) => Json(endpoint).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => registry_error_response(e),
    }
}

async fn delete_endpoint(
    State(registry): State<Arc<MemoryRegistry>>,
    Path(name): Path<String>,
) -> Response {
    match registry.unregister_endpoint(&name).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => registry_error_response(e),
    }
}

fn registry_routes(registry: Arc<MemoryRegistry>) -> Router {
    Router::new()
        .route("/v1/registry/network-services", post(register_network_service))
        .route(
            "/v1/registry/endpoints",
            post(register_endpoint).get(find_endpoints),
        )
        .route(
            "/v1/registry/endpoints/{name}",
            get(get_endpoint).delete(delete_endpoint),
        )
        .with_state(registry)
}

pub fn build_app(node: Arc<Node>) -> Router {
    let registry = node.registry().cloned();
    let app_state = AppState { node };

    let app = Router::new()
        .route("/health", get(health))
        .route(REQUEST_PATH, post(network_service_request))
        .route(CLOSE_PATH, post(network_service_close))
        .with_state(app_state);

    let app = match registry {
        Some(registry) => app.merge(registry_routes(registry)),
        None => app,
    };

    app.layer(TraceLayer::new_for_http())
}

/// Serve `node` on an already bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, node: Arc<Node>, shutdown: F) -> std::io::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let app = build_app(node.clone());
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;
    node.shutdown();
    result
}

pub fn build_credentials(config: &NodeConfig) -> anyhow::Result<Arc<JwtCredentialSource>> {
    let secret = config
        .token
        .secret
        .as_deref()
        .context("token secret is required")?;
    let mut credentials = JwtCredentialSource::new(
        secret.as_bytes(),
        config.token.trust_domain.clone(),
        config.token.lifetime(),
    );
    if let Some(tls) = &config.tls {
        let identity = TlsIdentity::load(&tls.cert_path, &tls.key_path, &tls.ca_cert_paths)?;
        credentials = credentials.with_tls_identity(identity);
    }
    Ok(Arc::new(credentials))
}

/// Assemble the node described by `config`.
pub fn build_node(
    config: &NodeConfig,
    credentials: Arc<dyn CredentialSource>,
) -> anyhow::Result<Node> {
    let dialer = Arc::new(HttpDialer::new(
        &config.forwarding,
        credentials.certificate(),
    )?);

    let builder = Node::builder(config.name.clone(), credentials)
        .authorize(config.authorization.clone())
        .forwarding(config.forwarding.clone())
        .request_timeout(config.request_timeout())
        .dialer(dialer.clone());

    let builder = match &config.role {
        NodeRole::Manager { forwarder_service } => {
            builder.manager(Arc::new(MemoryRegistry::new()), forwarder_service.clone())
        }
        NodeRole::Endpoint {
            extra_context,
            mechanisms,
            ..
        } => builder.endpoint(extra_context.clone(), mechanisms.clone()),
        NodeRole::CrossConnect {
            registry_url,
            connect_to,
            ..
        } => {
            let registry =
                HttpRegistryClient::with_client(registry_url, dialer.http_client().clone())?;
            builder.cross_connect(Arc::new(registry), connect_to.clone())
        }
    };

    Ok(builder.build()?)
}

/// Registration this node performs against its manager's registry, if any.
fn registration(config: &NodeConfig) -> Option<(String, NetworkServiceEndpoint)> {
    let (registry_url, services) = match &config.role {
        NodeRole::Manager { .. } => return None,
        NodeRole::Endpoint {
            registry_url,
            network_services,
            ..
        }
        | NodeRole::CrossConnect {
            registry_url,
            network_services,
            ..
        } => (registry_url.clone(), network_services.clone()),
    };
    let endpoint = services.into_iter().fold(
        NetworkServiceEndpoint::new(config.name.clone(), config.advertise_url()),
        |endpoint, service| endpoint.serving(service),
    );
    Some((registry_url, endpoint))
}

fn registration_backoff(attempt: u32) -> Duration {
    let exp = REGISTRATION_BASE_BACKOFF_MS.saturating_mul(1u64 << attempt.min(16));
    let capped = exp.min(REGISTRATION_MAX_BACKOFF_MS);
    let jitter = rand::rng().random_range(0..=capped / 4);
    Duration::from_millis(capped + jitter)
}

/// Register services and the endpoint, retrying while the manager is unreachable.
pub async fn register_with_retry(
    registry: &dyn RegistryClient,
    endpoint: &NetworkServiceEndpoint,
) -> anyhow::Result<()> {
    let mut attempt = 0;
    loop {
        let result = async {
            for service in &endpoint.network_service_names {
                registry
                    .register_network_service(NetworkService::new(service.clone()))
                    .await?;
            }
            registry.register_endpoint(endpoint.clone()).await
        }
        .await;

        match result {
            Ok(_) => {
                info!(
                    endpoint = %endpoint.name,
                    services = ?endpoint.network_service_names,
                    "Registered endpoint"
                );
                return Ok(());
            }
            Err(e) if attempt + 1 < REGISTRATION_ATTEMPTS => {
                let backoff = registration_backoff(attempt);
                warn!(
                    endpoint = %endpoint.name,
                    attempt = attempt + 1,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Registration failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to register {}", endpoint.name));
            }
        }
    }
}

pub async fn startup(config: NodeConfig) -> anyhow::Result<()> {
    config.validate()?;

    let _log_guard = init_logging(LoggingConfig {
        level: config
            .log_level
            .as_deref()
            .map(parse_level)
            .unwrap_or(tracing::Level::INFO),
        json_format: config.log_json,
        log_dir: config.log_dir.clone(),
        colorize: !config.log_json,
        log_file_name: config.name.clone(),
        log_targets: None,
    });

    let credentials = build_credentials(&config)?;
    let node = Arc::new(build_node(&config, credentials.clone())?);
    info!(
        node = %node.name(),
        role = ?config.role,
        advertise_url = %config.advertise_url(),
        "Starting mesh node"
    );

    let registered = match registration(&config) {
        Some((registry_url, endpoint)) => {
            let client = HttpDialer::new(&config.forwarding, credentials.certificate())?;
            let registry = Arc::new(HttpRegistryClient::with_client(
                &registry_url,
                client.http_client().clone(),
            )?);
            let task_registry = registry.clone();
            let task_endpoint = endpoint.clone();
            spawn(async move {
                if let Err(e) = register_with_retry(task_registry.as_ref(), &task_endpoint).await {
                    error!(error = %format!("{e:#}"), "Giving up on registration");
                }
            });
            Some((registry, endpoint))
        }
        None => None,
    };

    let app = build_app(node.clone());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("invalid address {}:{}", config.host, config.port))?;
    info!("Listening on {}", addr);

    let handle = axum_server::Handle::new();
    let handle_clone = handle.clone();
    let grace_period = Duration::from_secs(config.shutdown_grace_period_secs);
    spawn(async move {
        shutdown_signal().await;
        handle_clone.graceful_shutdown(Some(grace_period));
    });

    if let Some(tls) = &config.tls {
        info!("TLS enabled");
        ring::default_provider()
            .install_default()
            .map_err(|e| anyhow::anyhow!("failed to install rustls ring provider: {e:?}"))?;

        let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
            &tls.cert_path,
            &tls.key_path,
        )
        .await
        .context("failed to create TLS config")?;

        axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await?;
    } else {
        axum_server::bind(addr)
            .handle(handle)
            .serve(app.into_make_service())
            .await?;
    }

    if let Some((registry, endpoint)) = registered {
        match registry.unregister_endpoint(&endpoint.name).await {
            Ok(_) => info!(endpoint = %endpoint.name, "Unregistered endpoint"),
            Err(e) => warn!(endpoint = %endpoint.name, error = %e, "Failed to unregister"),
        }
    }
    node.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }
}
