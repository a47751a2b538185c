use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::chain::stages::{ConnectStage, ConnectionTrackerStage};
use crate::chain::Chain;
use crate::config::ForwardingConfig;
use crate::core::{CallContext, MeshError, MeshResult};
use crate::credentials::CredentialSource;
use crate::protocols::{Connection, NetworkServiceRequest};
use crate::transport::{ClientPool, Dialer, HttpDialer};

/// Requesting side of the mesh.
///
/// Does not appear on connection paths; it forwards every call to the node it
/// is attached to.
pub struct Client {
    name: String,
    chain: Chain,
    pool: Arc<ClientPool>,
    timeout: Duration,
}

impl Client {
    pub fn builder(name: impl Into<String>, credentials: Arc<dyn CredentialSource>) -> ClientBuilder {
        ClientBuilder {
            name: name.into(),
            credentials,
            connect_to: None,
            forwarding: ForwardingConfig::default(),
            dialer: None,
            timeout: Duration::from_secs(5),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request with the client's default timeout.
    pub async fn request(&self, request: NetworkServiceRequest) -> MeshResult<Connection> {
        let mut ctx = CallContext::new().with_timeout(self.timeout);
        self.chain.request(&mut ctx, request).await
    }

    pub async fn request_with(
        &self,
        ctx: &mut CallContext,
        request: NetworkServiceRequest,
    ) -> MeshResult<Connection> {
        self.chain.request(ctx, request).await
    }

    pub async fn close(&self, connection: Connection) -> MeshResult<()> {
        let mut ctx = CallContext::new().with_timeout(self.timeout);
        self.chain.close(&mut ctx, connection).await
    }

    pub async fn close_with(&self, ctx: &mut CallContext, connection: Connection) -> MeshResult<()> {
        self.chain.close(ctx, connection).await
    }

    pub fn shutdown(&self) {
        self.pool.close_all();
    }
}

pub struct ClientBuilder {
    name: String,
    credentials: Arc<dyn CredentialSource>,
    connect_to: Option<String>,
    forwarding: ForwardingConfig,
    dialer: Option<Arc<dyn Dialer>>,
    timeout: Duration,
}

impl ClientBuilder {
    pub fn connect_to(mut self, address: impl Into<String>) -> Self {
        self.connect_to = Some(address.into());
        self
    }

    pub fn forwarding(mut self, forwarding: ForwardingConfig) -> Self {
        self.forwarding = forwarding;
        self
    }

    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// Default overall timeout for `request` and `close`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> MeshResult<Client> {
        let connect_to = self
            .connect_to
            .ok_or_else(|| MeshError::invalid("client needs an address to connect to"))?;
        let dialer: Arc<dyn Dialer> = match self.dialer {
            Some(dialer) => dialer,
            None => Arc::new(HttpDialer::new(
                &self.forwarding,
                self.credentials.certificate(),
            )?),
        };
        let pool = Arc::new(ClientPool::new(dialer));

        let chain = Chain::builder(self.name.clone())
            .stage(ConnectionTrackerStage::new())
            .stage(
                ConnectStage::new(
                    self.name.clone(),
                    pool.clone(),
                    self.credentials,
                    self.forwarding.call_timeout(),
                )
                .connect_to(connect_to.clone()),
            )
            .build();

        info!(client = %self.name, connect_to = %connect_to, "Built client");
        Ok(Client {
            name: self.name,
            chain,
            pool,
            timeout: self.timeout,
        })
    }
}
