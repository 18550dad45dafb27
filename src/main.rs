//! vicar - HTTP/2 tunneling gateway
//!
//! Exposes local services through one multiplexed HTTP/2 endpoint (`--in`)
//! and relays streams for local ports to remote gateways (`--out`).

use std::net::{IpAddr, SocketAddr};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

use vicar_lib::{Gateway, GatewayConfig, PortMapping, ServiceMapping};

/// vicar - tunnel many services through one HTTP/2 endpoint
#[derive(Parser, Debug)]
#[command(name = "vicar")]
#[command(about = "Tunnel local services through a single HTTP/2 endpoint", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
#[command(after_help = r#"EXAMPLES:
  # Gateway exposing a local web server as /web
  vicar --listen 0.0.0.0:8080 --in web=9001

  # Relay streams for /9002 to another gateway
  vicar --out 9002=http://backend.local:8080/web

  # Local listener on 9001 tunneling to a remote gateway
  vicar --upstream https://gateway.example.com --in web=9001
"#)]
struct Cli {
    /// Gateway endpoint bind address
    #[arg(long, env = "VICAR_LISTEN", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Ingress mapping NAME=PORT (repeatable)
    #[arg(long = "in", value_name = "NAME=PORT")]
    services: Vec<ServiceMapping>,

    /// Egress mapping PORT=URL (repeatable)
    /// The remote must speak HTTP/2 (another vicar gateway); plain
    /// HTTP/1.1 servers answer every stream with 502
    #[arg(long = "out", value_name = "PORT=URL")]
    ports: Vec<PortMapping>,

    /// Gateway that ingress listeners tunnel to
    /// Without it no local listener is bound for --in mappings
    #[arg(long, env = "VICAR_UPSTREAM")]
    upstream: Option<Url>,

    /// Address ingress listeners bind and services are dialed on
    #[arg(long, default_value = "127.0.0.1")]
    local_ip: IpAddr,

    /// Timeout in seconds for dialing services and remote gateways
    #[arg(long, default_value = "10")]
    connect_timeout: u64,

    /// Grace period in seconds for open streams at shutdown
    #[arg(long, default_value = "5")]
    shutdown_timeout: u64,

    /// TLS certificate file path (PEM format)
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<String>,

    /// TLS private key file path (PEM format)
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "VICAR_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Cli {
    fn into_config(self) -> GatewayConfig {
        let mut config = GatewayConfig::new(self.listen)
            .with_services(self.services)
            .with_ports(self.ports)
            .local_ip(self.local_ip)
            .connect_timeout(Duration::from_secs(self.connect_timeout))
            .shutdown_timeout(Duration::from_secs(self.shutdown_timeout));

        if let Some(upstream) = self.upstream {
            config = config.upstream(upstream);
        }
        if let (Some(cert), Some(key)) = (self.tls_cert, self.tls_key) {
            config = config.tls(cert, key);
        }
        config
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.services.is_empty() && cli.ports.is_empty() {
        Cli::command()
            .error(
                clap::error::ErrorKind::MissingRequiredArgument,
                "at least one --in or --out mapping is required",
            )
            .exit();
    }

    if let Err(e) = init_logging(&cli.log_level) {
        eprintln!("Failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    // Required before any TLS config is built
    let _ = rustls::crypto::CryptoProvider::install_default(
        rustls::crypto::ring::default_provider(),
    );

    info!("Starting vicar {}", env!("GIT_TAG"));
    let gateway = Gateway::new(cli.into_config())?;

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    gateway.run(shutdown).await?;
    Ok(())
}

/// Cancel `token` on Ctrl-C or SIGTERM
async fn cancel_on_signal(token: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Error listening for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Error listening for shutdown signal: {}", e);
                return;
            }
        }
        _ = terminate => {}
    }

    info!("Shutdown signal received, stopping gateway...");
    token.cancel();
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
