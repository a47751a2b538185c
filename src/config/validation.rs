use url::Url;

use super::{
    AuthorizePolicy, ConfigError, ConfigResult, ForwardingConfig, NodeConfig, NodeRole,
    TokenConfig,
};

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

pub(crate) struct ConfigValidator;

impl ConfigValidator {
    pub(crate) fn validate(config: &NodeConfig) -> ConfigResult<()> {
        if config.name.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "name".to_string(),
            });
        }
        if let Some(url) = &config.advertise_url {
            Self::validate_url("advertise_url", url)?;
        }
        if config.request_timeout_secs == 0 {
            return Err(invalid(
                "request_timeout_secs",
                "0",
                "must be greater than zero",
            ));
        }
        if let Some(level) = &config.log_level {
            if !LOG_LEVELS.contains(&level.as_str()) {
                return Err(invalid(
                    "log_level",
                    level,
                    "expected one of trace, debug, info, warn, error",
                ));
            }
        }

        Self::validate_role(&config.role)?;
        Self::validate_authorization(&config.authorization)?;
        Self::validate_forwarding(&config.forwarding)?;
        Self::validate_token(&config.token)?;
        Ok(())
    }

    fn validate_role(role: &NodeRole) -> ConfigResult<()> {
        match role {
            NodeRole::Manager { forwarder_service } => {
                if forwarder_service.as_deref().is_some_and(str::is_empty) {
                    return Err(invalid(
                        "role.forwarder_service",
                        "",
                        "must not be empty when set",
                    ));
                }
            }
            NodeRole::Endpoint {
                registry_url,
                network_services,
                mechanisms,
                ..
            } => {
                Self::validate_url("role.registry_url", registry_url)?;
                Self::validate_services(network_services)?;
                if mechanisms.iter().any(|m| m.is_empty()) {
                    return Err(invalid(
                        "role.mechanisms",
                        &mechanisms.join(","),
                        "mechanism types must not be empty",
                    ));
                }
            }
            NodeRole::CrossConnect {
                registry_url,
                connect_to,
                network_services,
            } => {
                Self::validate_url("role.registry_url", registry_url)?;
                Self::validate_url("role.connect_to", connect_to)?;
                Self::validate_services(network_services)?;
            }
        }
        Ok(())
    }

    fn validate_services(services: &[String]) -> ConfigResult<()> {
        if services.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "role.network_services".to_string(),
            });
        }
        if services.iter().any(|s| s.trim().is_empty()) {
            return Err(invalid(
                "role.network_services",
                &services.join(","),
                "service names must not be empty",
            ));
        }
        Ok(())
    }

    fn validate_authorization(policy: &AuthorizePolicy) -> ConfigResult<()> {
        if let AuthorizePolicy::AllowList { rules } = policy {
            for rule in rules {
                if rule.identity.is_empty() {
                    return Err(invalid(
                        "authorization.rules.identity",
                        "",
                        "identity must not be empty",
                    ));
                }
                if rule.network_services.is_empty() {
                    return Err(invalid(
                        "authorization.rules.network_services",
                        &rule.identity,
                        "rule grants no network service",
                    ));
                }
            }
        }
        Ok(())
    }

    fn validate_forwarding(forwarding: &ForwardingConfig) -> ConfigResult<()> {
        if forwarding.dial_timeout_ms == 0 {
            return Err(invalid(
                "forwarding.dial_timeout_ms",
                "0",
                "must be greater than zero",
            ));
        }
        if forwarding.call_timeout_ms == 0 {
            return Err(invalid(
                "forwarding.call_timeout_ms",
                "0",
                "must be greater than zero",
            ));
        }
        Ok(())
    }

    fn validate_token(token: &TokenConfig) -> ConfigResult<()> {
        match token.secret.as_deref() {
            None | Some("") => {
                return Err(ConfigError::MissingRequired {
                    field: "token.secret".to_string(),
                })
            }
            Some(_) => {}
        }
        if token.trust_domain.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "token.trust_domain".to_string(),
            });
        }
        if token.lifetime_secs == 0 {
            return Err(invalid(
                "token.lifetime_secs",
                "0",
                "must be greater than zero",
            ));
        }
        Ok(())
    }

    fn validate_url(field: &str, value: &str) -> ConfigResult<()> {
        let url = Url::parse(value).map_err(|e| invalid(field, value, &e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid(field, value, "scheme must be http or https"));
        }
        Ok(())
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

impl NodeConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        ConfigValidator::validate(self)
    }
}
