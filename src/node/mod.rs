//! Mesh nodes
//!
//! A [`Node`] owns the chain it runs for inbound calls and the resources that chain
//! shares across calls (client pool, connection tracker, hosted registry). The
//! chain is assembled once from the node's role.

mod client;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

pub use client::{Client, ClientBuilder};

use crate::chain::stages::{
    AuthorizeStage, ConnectStage, ConnectionTrackerStage, DiscoverStage, RoundRobinStage,
    SelectMechanismStage, SetExtraContextStage, UpdatePathStage,
};
use crate::chain::Chain;
use crate::config::{AuthorizePolicy, ForwardingConfig};
use crate::core::{CallContext, MeshResult};
use crate::credentials::CredentialSource;
use crate::protocols::{Connection, NetworkServiceRequest};
use crate::registry::{MemoryRegistry, RegistryClient};
use crate::transport::{ClientPool, Dialer, HttpDialer};

pub struct Node {
    name: String,
    chain: Chain,
    pool: Arc<ClientPool>,
    tracker: Arc<ConnectionTrackerStage>,
    registry: Option<Arc<MemoryRegistry>>,
    request_timeout: Duration,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("chain", &self.chain)
            .field("hosts_registry", &self.registry.is_some())
            .finish()
    }
}

impl Node {
    pub fn builder(name: impl Into<String>, credentials: Arc<dyn CredentialSource>) -> NodeBuilder {
        NodeBuilder {
            name: name.into(),
            credentials,
            policy: AuthorizePolicy::Any,
            forwarding: ForwardingConfig::default(),
            dialer: None,
            role: Role::Endpoint {
                extra_context: BTreeMap::new(),
                mechanisms: Vec::new(),
            },
            request_timeout: Duration::from_secs(60),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    /// Registry hosted by this node, if it is a manager.
    pub fn registry(&self) -> Option<&Arc<MemoryRegistry>> {
        self.registry.as_ref()
    }

    /// Upper bound applied to inbound calls that carry no deadline of their own.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn established_connections(&self) -> usize {
        self.tracker.len()
    }

    pub async fn request(
        &self,
        ctx: &mut CallContext,
        request: NetworkServiceRequest,
    ) -> MeshResult<Connection> {
        self.chain.request(ctx, request).await
    }

    pub async fn close(&self, ctx: &mut CallContext, connection: Connection) -> MeshResult<()> {
        self.chain.close(ctx, connection).await
    }

    pub fn shutdown(&self) {
        info!(node = %self.name, "Shutting down node");
        self.pool.close_all();
    }
}

enum Role {
    Endpoint {
        extra_context: BTreeMap<String, String>,
        mechanisms: Vec<String>,
    },
    Manager {
        registry: Arc<MemoryRegistry>,
        forwarder_service: Option<String>,
    },
    CrossConnect {
        registry: Arc<dyn RegistryClient>,
        connect_to: String,
    },
}

pub struct NodeBuilder {
    name: String,
    credentials: Arc<dyn CredentialSource>,
    policy: AuthorizePolicy,
    forwarding: ForwardingConfig,
    dialer: Option<Arc<dyn Dialer>>,
    role: Role,
    request_timeout: Duration,
}

impl NodeBuilder {
    pub fn authorize(mut self, policy: AuthorizePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn forwarding(mut self, forwarding: ForwardingConfig) -> Self {
        self.forwarding = forwarding;
        self
    }

    /// Replace the HTTP dialer used for outbound calls.
    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Terminal endpoint. `mechanisms` lists accepted mechanism types, empty for any.
    pub fn endpoint(
        mut self,
        extra_context: BTreeMap<String, String>,
        mechanisms: Vec<String>,
    ) -> Self {
        self.role = Role::Endpoint {
            extra_context,
            mechanisms,
        };
        self
    }

    /// Manager hosting `registry` and routing to the endpoints registered in it.
    pub fn manager(
        mut self,
        registry: Arc<MemoryRegistry>,
        forwarder_service: Option<String>,
    ) -> Self {
        self.role = Role::Manager {
            registry,
            forwarder_service,
        };
        self
    }

    /// Forwarder that discovers through `registry` and re-enters the mesh at
    /// `connect_to`.
    pub fn cross_connect(
        mut self,
        registry: Arc<dyn RegistryClient>,
        connect_to: impl Into<String>,
    ) -> Self {
        self.role = Role::CrossConnect {
            registry,
            connect_to: connect_to.into(),
        };
        self
    }

    pub fn build(self) -> MeshResult<Node> {
        let dialer: Arc<dyn Dialer> = match self.dialer {
            Some(dialer) => dialer,
            None => Arc::new(HttpDialer::new(
                &self.forwarding,
                self.credentials.certificate(),
            )?),
        };
        let pool = Arc::new(ClientPool::new(dialer));
        let tracker = Arc::new(ConnectionTrackerStage::new());

        let builder = Chain::builder(self.name.clone())
            .stage(UpdatePathStage::new(
                self.name.clone(),
                self.credentials.clone(),
            ))
            .stage(AuthorizeStage::new(self.policy, self.credentials.clone()))
            .shared_stage(tracker.clone());

        let connect = ConnectStage::new(
            self.name.clone(),
            pool.clone(),
            self.credentials.clone(),
            self.forwarding.call_timeout(),
        );

        let (chain, registry) = match self.role {
            Role::Endpoint {
                extra_context,
                mechanisms,
            } => {
                let builder = if extra_context.is_empty() {
                    builder
                } else {
                    builder.stage(SetExtraContextStage::new(extra_context))
                };
                (builder.stage(SelectMechanismStage::new(mechanisms)).build(), None)
            }
            Role::Manager {
                registry,
                forwarder_service,
            } => {
                let chain = builder
                    .stage(
                        DiscoverStage::new(registry.clone())
                            .with_forwarder_service(forwarder_service),
                    )
                    .stage(RoundRobinStage::new())
                    .stage(connect)
                    .build();
                (chain, Some(registry))
            }
            Role::CrossConnect {
                registry,
                connect_to,
            } => {
                let chain = builder
                    .stage(DiscoverStage::new(registry))
                    .stage(RoundRobinStage::new())
                    .stage(connect.connect_to(connect_to))
                    .build();
                (chain, None)
            }
        };

        info!(node = %self.name, stages = ?chain.stage_names(), "Built node chain");

        Ok(Node {
            name: self.name,
            chain,
            pool,
            tracker,
            registry,
            request_timeout: self.request_timeout,
        })
    }
}
