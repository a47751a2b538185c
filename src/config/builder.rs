use std::path::PathBuf;

use super::{
    AllowRule, AuthorizePolicy, ConfigResult, ForwardingConfig, NodeConfig, NodeRole, TlsConfig,
    TokenConfig,
};

/// Builder for NodeConfig that wraps the config itself
#[derive(Debug, Clone)]
pub struct NodeConfigBuilder {
    config: NodeConfig,
}

impl NodeConfigBuilder {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            config: NodeConfig {
                name: name.into(),
                host: "0.0.0.0".to_string(),
                port: 5001,
                advertise_url: None,
                role: NodeRole::default(),
                authorization: AuthorizePolicy::Any,
                forwarding: ForwardingConfig::default(),
                token: TokenConfig::default(),
                tls: None,
                log_level: None,
                log_dir: None,
                log_json: false,
                request_timeout_secs: 60,
                shutdown_grace_period_secs: 10,
            },
        }
    }

    pub fn from_config(config: NodeConfig) -> Self {
        Self { config }
    }

    // ==================== Role ====================

    pub fn manager(mut self) -> Self {
        self.config.role = NodeRole::Manager {
            forwarder_service: None,
        };
        self
    }

    pub fn manager_with_forwarder<S: Into<String>>(mut self, forwarder_service: S) -> Self {
        self.config.role = NodeRole::Manager {
            forwarder_service: Some(forwarder_service.into()),
        };
        self
    }

    pub fn endpoint<U: Into<String>, S: Into<String>>(
        mut self,
        registry_url: U,
        network_services: Vec<S>,
    ) -> Self {
        self.config.role = NodeRole::Endpoint {
            registry_url: registry_url.into(),
            network_services: network_services.into_iter().map(Into::into).collect(),
            extra_context: Default::default(),
            mechanisms: Vec::new(),
        };
        self
    }

    pub fn cross_connect<U: Into<String>, C: Into<String>, S: Into<String>>(
        mut self,
        registry_url: U,
        connect_to: C,
        network_services: Vec<S>,
    ) -> Self {
        self.config.role = NodeRole::CrossConnect {
            registry_url: registry_url.into(),
            connect_to: connect_to.into(),
            network_services: network_services.into_iter().map(Into::into).collect(),
        };
        self
    }

    /// Only meaningful for endpoints.
    pub fn extra_context<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        if let NodeRole::Endpoint { extra_context, .. } = &mut self.config.role {
            extra_context.insert(key.into(), value.into());
        }
        self
    }

    /// Only meaningful for endpoints.
    pub fn mechanisms<S: Into<String>>(mut self, types: Vec<S>) -> Self {
        if let NodeRole::Endpoint { mechanisms, .. } = &mut self.config.role {
            *mechanisms = types.into_iter().map(Into::into).collect();
        }
        self
    }

    // ==================== Listener ====================

    pub fn host<S: Into<String>>(mut self, host: S) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn advertise_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.advertise_url = Some(url.into());
        self
    }

    pub fn request_timeout_secs(mut self, timeout: u64) -> Self {
        self.config.request_timeout_secs = timeout;
        self
    }

    pub fn shutdown_grace_period_secs(mut self, secs: u64) -> Self {
        self.config.shutdown_grace_period_secs = secs;
        self
    }

    // ==================== Authorization ====================

    pub fn authorize_any(mut self) -> Self {
        self.config.authorization = AuthorizePolicy::Any;
        self
    }

    /// Switches to an allow-list policy and appends a rule.
    pub fn allow<I: Into<String>, S: Into<String>>(
        mut self,
        identity: I,
        network_services: Vec<S>,
    ) -> Self {
        let rule = AllowRule {
            identity: identity.into(),
            network_services: network_services.into_iter().map(Into::into).collect(),
        };
        match &mut self.config.authorization {
            AuthorizePolicy::AllowList { rules } => rules.push(rule),
            AuthorizePolicy::Any => {
                self.config.authorization = AuthorizePolicy::AllowList { rules: vec![rule] }
            }
        }
        self
    }

    // ==================== Forwarding ====================

    pub fn forwarding_config(mut self, forwarding: ForwardingConfig) -> Self {
        self.config.forwarding = forwarding;
        self
    }

    pub fn dial_timeout_ms(mut self, timeout: u64) -> Self {
        self.config.forwarding.dial_timeout_ms = timeout;
        self
    }

    pub fn call_timeout_ms(mut self, timeout: u64) -> Self {
        self.config.forwarding.call_timeout_ms = timeout;
        self
    }

    // ==================== Credentials ====================

    pub fn token_secret<S: Into<String>>(mut self, secret: S) -> Self {
        self.config.token.secret = Some(secret.into());
        self
    }

    pub fn trust_domain<S: Into<String>>(mut self, domain: S) -> Self {
        self.config.token.trust_domain = domain.into();
        self
    }

    pub fn token_lifetime_secs(mut self, secs: u64) -> Self {
        self.config.token.lifetime_secs = secs;
        self
    }

    pub fn tls<P: Into<PathBuf>>(mut self, cert_path: P, key_path: P, ca_cert_paths: Vec<P>) -> Self {
        self.config.tls = Some(TlsConfig {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            ca_cert_paths: ca_cert_paths.into_iter().map(Into::into).collect(),
        });
        self
    }

    // ==================== Logging ====================

    pub fn log_level<S: Into<String>>(mut self, level: S) -> Self {
        self.config.log_level = Some(level.into());
        self
    }

    pub fn log_dir<S: Into<String>>(mut self, dir: S) -> Self {
        self.config.log_dir = Some(dir.into());
        self
    }

    pub fn log_json(mut self, enabled: bool) -> Self {
        self.config.log_json = enabled;
        self
    }

    pub fn build(self) -> ConfigResult<NodeConfig> {
        self.config.validate()?;
        Ok(self.config)
    }

    pub fn build_unchecked(self) -> NodeConfig {
        self.config
    }
}
