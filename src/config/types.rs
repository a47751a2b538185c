use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{ConfigError, ConfigResult};

/// Configuration for one mesh node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Hop name, recorded in every path segment this node appends
    pub name: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Address other nodes use to reach this one. Defaults to `http://host:port`.
    #[serde(default)]
    pub advertise_url: Option<String>,
    pub role: NodeRole,
    #[serde(default)]
    pub authorization: AuthorizePolicy,
    #[serde(default)]
    pub forwarding: ForwardingConfig,
    #[serde(default)]
    pub token: TokenConfig,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub log_dir: Option<String>,
    #[serde(default)]
    pub log_json: bool,
    /// Upper bound on a whole request when the caller sends no deadline
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_shutdown_grace_period_secs")]
    pub shutdown_grace_period_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5001
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_shutdown_grace_period_secs() -> u64 {
    10
}

impl NodeConfig {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Load {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let config: NodeConfig = serde_yaml::from_str(&raw).map_err(|e| ConfigError::Load {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn advertise_url(&self) -> String {
        match &self.advertise_url {
            Some(url) => url.clone(),
            None => {
                let scheme = if self.tls.is_some() { "https" } else { "http" };
                format!("{}://{}:{}", scheme, self.host, self.port)
            }
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// What a node does with the requests it receives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeRole {
    /// Hosts the registry and routes requests to registered endpoints
    Manager {
        /// Service whose endpoints are interposed in front of every other service
        #[serde(default)]
        forwarder_service: Option<String>,
    },
    /// Terminal endpoint serving network services
    Endpoint {
        registry_url: String,
        network_services: Vec<String>,
        #[serde(default)]
        extra_context: BTreeMap<String, String>,
        /// Mechanism types accepted; empty accepts any
        #[serde(default)]
        mechanisms: Vec<String>,
    },
    /// Forwarder that re-enters the mesh through its manager
    CrossConnect {
        registry_url: String,
        connect_to: String,
        network_services: Vec<String>,
    },
}

impl Default for NodeRole {
    fn default() -> Self {
        NodeRole::Manager {
            forwarder_service: None,
        }
    }
}

/// Which callers may request which network services
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum AuthorizePolicy {
    #[default]
    Any,
    AllowList { rules: Vec<AllowRule> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllowRule {
    pub identity: String,
    /// Service names, `*` matches any
    pub network_services: Vec<String>,
}

impl AuthorizePolicy {
    pub fn allows(&self, identity: &str, network_service: &str) -> bool {
        match self {
            AuthorizePolicy::Any => true,
            AuthorizePolicy::AllowList { rules } => rules.iter().any(|rule| {
                rule.identity == identity
                    && rule
                        .network_services
                        .iter()
                        .any(|s| s == "*" || s == network_service)
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardingConfig {
    /// Connect timeout for one dial attempt
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    /// Timeout for one forwarded call, independent of the overall deadline
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_pool_idle_timeout_secs")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            dial_timeout_ms: default_dial_timeout_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            pool_idle_timeout_secs: default_pool_idle_timeout_secs(),
        }
    }
}

fn default_dial_timeout_ms() -> u64 {
    5_000
}

fn default_call_timeout_ms() -> u64 {
    15_000
}

fn default_pool_idle_timeout_secs() -> u64 {
    50
}

impl ForwardingConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Shared HS256 secret for the trust domain
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_trust_domain")]
    pub trust_domain: String,
    #[serde(default = "default_token_lifetime_secs")]
    pub lifetime_secs: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secret: None,
            trust_domain: default_trust_domain(),
            lifetime_secs: default_token_lifetime_secs(),
        }
    }
}

fn default_trust_domain() -> String {
    "mesh.local".to_string()
}

fn default_token_lifetime_secs() -> u64 {
    600
}

impl TokenConfig {
    pub fn lifetime(&self) -> Duration {
        Duration::from_secs(self.lifetime_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    #[serde(default)]
    pub ca_cert_paths: Vec<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_with_defaults() {
        let yaml = r#"
name: nse-1
port: 5003
role:
  kind: endpoint
  registry_url: http://127.0.0.1:5001
  network_services: [my-service]
  extra_context:
    perform: ok
token:
  secret: s3cret
"#;
        let config: NodeConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.name, "nse-1");
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.authorization, AuthorizePolicy::Any);
        assert_eq!(config.forwarding.dial_timeout(), Duration::from_secs(5));
        assert_eq!(config.token.trust_domain, "mesh.local");
        match &config.role {
            NodeRole::Endpoint { extra_context, .. } => {
                assert_eq!(extra_context.get("perform").map(String::as_str), Some("ok"));
            }
            other => panic!("unexpected role {:?}", other),
        }
        assert_eq!(config.advertise_url(), "http://0.0.0.0:5003");
    }

    #[test]
    fn test_allow_list_policy() {
        let yaml = r#"
policy: allow_list
rules:
  - identity: spiffe://mesh.local/nsc-1
    network_services: [my-service]
  - identity: spiffe://mesh.local/admin
    network_services: ["*"]
"#;
        let policy: AuthorizePolicy = serde_yaml::from_str(yaml).unwrap();
        assert!(policy.allows("spiffe://mesh.local/nsc-1", "my-service"));
        assert!(!policy.allows("spiffe://mesh.local/nsc-1", "other"));
        assert!(policy.allows("spiffe://mesh.local/admin", "anything"));
        assert!(!policy.allows("spiffe://mesh.local/nsc-2", "my-service"));
        assert!(AuthorizePolicy::Any.allows("anyone", "anything"));
    }
}
