//! HTTP/JSON transport built on reqwest.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;
use url::Url;

use super::{
    CallMetadata, Dialer, ErrorBody, NetworkServiceClient, CLOSE_PATH, DEADLINE_HEADER,
    REQUEST_PATH,
};
use crate::config::ForwardingConfig;
use crate::core::{MeshError, MeshResult};
use crate::credentials::TlsIdentity;
use crate::protocols::{Connection, NetworkServiceRequest};

/// Creates [`HttpNetworkServiceClient`]s sharing one reqwest connection pool.
#[derive(Debug, Clone)]
pub struct HttpDialer {
    client: Client,
    dial_timeout: Duration,
}

impl HttpDialer {
    pub fn new(config: &ForwardingConfig, identity: Option<&TlsIdentity>) -> MeshResult<Self> {
        let client = build_client(config, identity)?;
        Ok(Self {
            client,
            dial_timeout: config.dial_timeout(),
        })
    }

    /// The underlying reqwest client, for other outbound calls that should share
    /// its TLS configuration.
    pub fn http_client(&self) -> &Client {
        &self.client
    }
}

pub(crate) fn build_client(
    config: &ForwardingConfig,
    identity: Option<&TlsIdentity>,
) -> MeshResult<Client> {
    let mut builder = Client::builder()
        .pool_idle_timeout(Some(Duration::from_secs(config.pool_idle_timeout_secs)))
        .connect_timeout(config.dial_timeout())
        .tcp_nodelay(true)
        .tcp_keepalive(Some(Duration::from_secs(30)));

    if let Some(identity) = identity {
        let client_identity = reqwest::Identity::from_pem(&identity.client_identity_pem())
            .map_err(|e| MeshError::Credential {
                reason: format!("failed to create client identity: {}", e),
            })?;
        builder = builder.use_rustls_tls().identity(client_identity);
        for ca in &identity.ca_certs_pem {
            let cert = reqwest::Certificate::from_pem(ca).map_err(|e| MeshError::Credential {
                reason: format!("failed to add CA certificate: {}", e),
            })?;
            builder = builder.add_root_certificate(cert);
        }
        debug!(
            ca_certificates = identity.ca_certs_pem.len(),
            "mTLS client authentication enabled"
        );
    }

    builder
        .build()
        .map_err(|e| MeshError::internal(format!("failed to create HTTP client: {}", e)))
}

#[async_trait]
impl Dialer for HttpDialer {
    async fn dial(&self, address: &str) -> MeshResult<Arc<dyn NetworkServiceClient>> {
        let base = Url::parse(address).map_err(|e| MeshError::dial(address, e))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(MeshError::dial(
                address,
                format!("unsupported scheme {}", base.scheme()),
            ));
        }
        Ok(Arc::new(HttpNetworkServiceClient {
            address: address.to_string(),
            request_url: base
                .join(REQUEST_PATH)
                .map_err(|e| MeshError::dial(address, e))?,
            close_url: base
                .join(CLOSE_PATH)
                .map_err(|e| MeshError::dial(address, e))?,
            client: self.client.clone(),
            dial_timeout: self.dial_timeout,
        }))
    }
}

#[derive(Debug)]
pub struct HttpNetworkServiceClient {
    address: String,
    request_url: Url,
    close_url: Url,
    client: Client,
    dial_timeout: Duration,
}

impl HttpNetworkServiceClient {
    async fn post<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        url: &Url,
        body: &B,
        metadata: &CallMetadata,
    ) -> MeshResult<T> {
        let mut request = self.client.post(url.clone()).json(body);
        if let Some(token) = &metadata.token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        if let Some(deadline) = metadata.deadline {
            request = request.header(DEADLINE_HEADER, deadline.as_millis().to_string());
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        self.decode(response).await
    }

    async fn decode<T: DeserializeOwned>(&self, response: Response) -> MeshResult<T> {
        let status = response.status();
        let body = response.bytes().await.map_err(|e| self.transport_error(e))?;

        if status.is_success() {
            // Close answers 204 with no body.
            let payload: &[u8] = if body.is_empty() { b"null" } else { &body };
            return serde_json::from_slice(payload).map_err(|e| {
                MeshError::internal(format!("invalid response from {}: {}", self.address, e))
            });
        }

        // Errors raised downstream come back verbatim.
        match serde_json::from_slice::<ErrorBody>(&body) {
            Ok(ErrorBody { error }) => Err(error),
            Err(_) => Err(MeshError::internal(format!(
                "{} returned {}: {}",
                self.address,
                status,
                String::from_utf8_lossy(&body)
            ))),
        }
    }

    fn transport_error(&self, e: reqwest::Error) -> MeshError {
        if e.is_timeout() {
            MeshError::Timeout {
                address: self.address.clone(),
                timeout_ms: self.dial_timeout.as_millis() as u64,
            }
        } else if e.is_connect() {
            MeshError::dial(&self.address, e)
        } else {
            MeshError::internal(format!("transport failure talking to {}: {}", self.address, e))
        }
    }
}

#[async_trait]
impl NetworkServiceClient for HttpNetworkServiceClient {
    async fn request(
        &self,
        request: &NetworkServiceRequest,
        metadata: &CallMetadata,
    ) -> MeshResult<Connection> {
        self.post(&self.request_url, request, metadata).await
    }

    async fn close(&self, connection: &Connection, metadata: &CallMetadata) -> MeshResult<()> {
        let _: serde_json::Value = self.post(&self.close_url, connection, metadata).await?;
        Ok(())
    }

    fn address(&self) -> &str {
        &self.address
    }
}
