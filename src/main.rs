use clap::Parser;
use fluxgate::config::BootConfig;
use fluxgate::Gateway;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// fluxgate — dynamically-configurable HTTP API gateway
#[derive(Parser)]
#[command(name = "fluxgate", version, about)]
struct Cli {
    /// Path to an optional TOML boot configuration file
    #[arg(short = 'c', long)]
    config: Option<String>,

    /// The address used by the gateway
    #[arg(long = "gatewayaddr")]
    gateway_addr: Option<String>,

    /// The address used by the manager; empty disables it
    #[arg(long = "manageraddr")]
    manager_addr: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long = "log.level")]
    log_level: Option<String>,

    /// The TLS certificate file of the gateway listener
    #[arg(long = "tls.certfile")]
    tls_certfile: Option<String>,

    /// The TLS key file of the gateway listener
    #[arg(long = "tls.keyfile")]
    tls_keyfile: Option<String>,

    /// The provider of the dynamic configurations
    #[arg(long = "provider", default_value = "localfiledir")]
    provider: String,

    /// The directory of the local files storing the routes
    #[arg(long = "provider.localfiledir.routes")]
    routes_dir: Option<String>,

    /// The directory of the local files storing the upstreams
    #[arg(long = "provider.localfiledir.upstreams")]
    upstreams_dir: Option<String>,

    /// The directory of the local files storing the middleware groups
    #[arg(long = "provider.localfiledir.middlewaregroups")]
    middleware_groups_dir: Option<String>,

    /// The interval to check and reload the configurations, e.g. "1m"
    #[arg(long = "provider.localfiledir.interval")]
    interval: Option<String>,
}

impl Cli {
    fn into_boot_config(self) -> anyhow::Result<BootConfig> {
        if self.provider != "localfiledir" {
            anyhow::bail!("unsupported provider '{}'", self.provider);
        }

        let mut boot = match &self.config {
            Some(path) => BootConfig::from_file(path)?,
            None => BootConfig::default(),
        };

        if let Some(v) = self.gateway_addr {
            boot.gateway_addr = v;
        }
        if let Some(v) = self.manager_addr {
            boot.manager_addr = v;
        }
        if let Some(v) = self.log_level {
            boot.log_level = v;
        }
        if let Some(v) = self.tls_certfile {
            boot.tls.cert_file = v;
        }
        if let Some(v) = self.tls_keyfile {
            boot.tls.key_file = v;
        }
        if let Some(v) = self.routes_dir {
            boot.provider.routes_dir = v;
        }
        if let Some(v) = self.upstreams_dir {
            boot.provider.upstreams_dir = v;
        }
        if let Some(v) = self.middleware_groups_dir {
            boot.provider.middleware_groups_dir = v;
        }
        if let Some(v) = self.interval {
            boot.provider.interval = humantime::parse_duration(&v)?;
        }

        Ok(boot)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let boot = Cli::parse().into_boot_config()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&boot.log_level)),
        )
        .init();

    tracing::info!("fluxgate v{}", env!("CARGO_PKG_VERSION"));

    let gateway = Arc::new(Gateway::new(boot)?);
    gateway.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    gateway.shutdown();

    Ok(())
}
