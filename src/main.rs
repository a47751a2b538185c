use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use mesh_router::{
    config::{NodeConfig, NodeConfigBuilder},
    server,
};

#[derive(Parser, Debug)]
#[command(name = "mesh-router", version)]
#[command(about = "Mesh request router - manager, endpoint and cross-connect nodes")]
#[command(long_about = r#"
Mesh request router

Usage:
  mesh-router --config node.yaml
  mesh-router manager [OPTIONS]
  mesh-router endpoint --registry-url URL --service NAME [OPTIONS]
  mesh-router cross-connect --registry-url URL --connect-to URL [OPTIONS]

Examples:
  # Manager hosting the registry, interposing forwarders
  mesh-router manager --name nsmgr --port 5001 --forwarder-service forwarder

  # Endpoint serving my-service
  mesh-router endpoint --name nse-1 --port 5003 \
    --registry-url http://127.0.0.1:5001 --service my-service \
    --extra-context perform=ok

  # Cross-connect forwarder
  mesh-router cross-connect --name forwarder-1 --port 5002 \
    --registry-url http://127.0.0.1:5001 --connect-to http://127.0.0.1:5001
"#)]
struct Cli {
    /// YAML node configuration; flags are ignored when given
    #[arg(long, short = 'c', env = "MESH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Host the registry and route requests
    Manager {
        #[command(flatten)]
        common: CommonArgs,

        /// Service whose endpoints are interposed in front of every other service
        #[arg(long)]
        forwarder_service: Option<String>,
    },
    /// Terminal endpoint serving one or more network services
    Endpoint {
        #[command(flatten)]
        common: CommonArgs,

        #[arg(long)]
        registry_url: String,

        #[arg(long = "service", required = true)]
        services: Vec<String>,

        /// key=value pair added to every connection's context
        #[arg(long = "extra-context", value_parser = parse_key_val)]
        extra_context: Vec<(String, String)>,

        /// Accepted mechanism type; repeat for several, omit to accept any
        #[arg(long = "mechanism")]
        mechanisms: Vec<String>,
    },
    /// Forwarder that re-enters the mesh through a manager
    CrossConnect {
        #[command(flatten)]
        common: CommonArgs,

        #[arg(long)]
        registry_url: String,

        #[arg(long)]
        connect_to: String,

        #[arg(long = "service", default_value = "forwarder")]
        services: Vec<String>,
    },
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Hop name recorded on connection paths
    #[arg(long)]
    name: String,

    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(long, default_value_t = 5001)]
    port: u16,

    #[arg(long)]
    advertise_url: Option<String>,

    #[arg(long, env = "MESH_TOKEN_SECRET", hide_env_values = true)]
    token_secret: String,

    #[arg(long, default_value = "mesh.local")]
    trust_domain: String,

    #[arg(long, default_value_t = 600)]
    token_lifetime_secs: u64,

    /// identity=service[,service...]; repeat for several rules. Omit to allow any caller.
    #[arg(long = "allow", value_parser = parse_allow_rule)]
    allow: Vec<(String, Vec<String>)>,

    #[arg(long, default_value_t = 5000)]
    dial_timeout_ms: u64,

    #[arg(long, default_value_t = 15000)]
    call_timeout_ms: u64,

    #[arg(long, default_value_t = 60)]
    request_timeout_secs: u64,

    #[arg(long, default_value_t = 10)]
    shutdown_grace_period_secs: u64,

    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    #[arg(long = "tls-ca")]
    tls_ca: Vec<PathBuf>,

    #[arg(long, default_value = "info")]
    log_level: String,

    #[arg(long)]
    log_dir: Option<String>,

    #[arg(long, default_value_t = false)]
    log_json: bool,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (k, v) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{s}'"))?;
    Ok((k.to_string(), v.to_string()))
}

fn parse_allow_rule(s: &str) -> Result<(String, Vec<String>), String> {
    let (identity, services) = s
        .split_once('=')
        .ok_or_else(|| format!("expected identity=service[,service], got '{s}'"))?;
    let services: Vec<String> = services
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if services.is_empty() {
        return Err(format!("no services in allow rule '{s}'"));
    }
    Ok((identity.to_string(), services))
}

impl CommonArgs {
    fn apply(self, builder: NodeConfigBuilder) -> NodeConfigBuilder {
        let mut builder = builder
            .host(self.host)
            .port(self.port)
            .token_secret(self.token_secret)
            .trust_domain(self.trust_domain)
            .token_lifetime_secs(self.token_lifetime_secs)
            .dial_timeout_ms(self.dial_timeout_ms)
            .call_timeout_ms(self.call_timeout_ms)
            .request_timeout_secs(self.request_timeout_secs)
            .shutdown_grace_period_secs(self.shutdown_grace_period_secs)
            .log_level(self.log_level)
            .log_json(self.log_json);

        if let Some(url) = self.advertise_url {
            builder = builder.advertise_url(url);
        }
        if let Some(dir) = self.log_dir {
            builder = builder.log_dir(dir);
        }
        for (identity, services) in self.allow {
            builder = builder.allow(identity, services);
        }
        if let (Some(cert), Some(key)) = (self.tls_cert, self.tls_key) {
            builder = builder.tls(cert, key, self.tls_ca);
        }
        builder
    }
}

impl Commands {
    fn to_node_config(self) -> anyhow::Result<NodeConfig> {
        let builder = match self {
            Commands::Manager {
                common,
                forwarder_service,
            } => {
                let builder = NodeConfigBuilder::new(common.name.clone());
                let builder = match forwarder_service {
                    Some(service) => builder.manager_with_forwarder(service),
                    None => builder.manager(),
                };
                common.apply(builder)
            }
            Commands::Endpoint {
                common,
                registry_url,
                services,
                extra_context,
                mechanisms,
            } => {
                let mut builder = NodeConfigBuilder::new(common.name.clone())
                    .endpoint(registry_url, services)
                    .mechanisms(mechanisms);
                for (k, v) in extra_context {
                    builder = builder.extra_context(k, v);
                }
                common.apply(builder)
            }
            Commands::CrossConnect {
                common,
                registry_url,
                connect_to,
                services,
            } => {
                let builder = NodeConfigBuilder::new(common.name.clone()).cross_connect(
                    registry_url,
                    connect_to,
                    services,
                );
                common.apply(builder)
            }
        };
        Ok(builder.build()?)
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match (cli.config, cli.command) {
        (Some(path), _) => NodeConfig::from_yaml_file(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        (None, Some(command)) => command.to_node_config()?,
        (None, None) => anyhow::bail!("either --config or a node subcommand is required"),
    };

    println!("Mesh router starting...");
    println!("Node: {} ({:?})", config.name, config.role);
    println!("Listening: {}:{}", config.host, config.port);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move { server::startup(config).await })?;
    Ok(())
}
