use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mimir::config::StubConfig;
use mimir::forward::ForwardResolver;
use mimir::server;

#[derive(Debug, Parser)]
#[command(name = "mimir", about = "Local DNS stub resolver front-end")]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Extra listener endpoints, e.g. `udp:192.0.2.1:5353`.
    #[arg(long = "extra-listener")]
    extra_listeners: Vec<String>,

    /// Upstream DNS servers, e.g. `9.9.9.9` or `9.9.9.9:53`.
    #[arg(long = "upstream")]
    upstream_servers: Vec<String>,

    /// Disable the primary loopback stub listener.
    #[arg(long)]
    no_stub_listener: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut config = match args.config.as_deref() {
        Some(path) => match StubConfig::from_file(path) {
            Ok(config) => config,
            Err(err) => {
                error!("failed to load configuration: {err}");
                std::process::exit(1);
            }
        },
        None => StubConfig::default(),
    };
    if let Err(err) = config.apply_env() {
        error!("invalid environment configuration: {err}");
        std::process::exit(1);
    }
    if let Err(err) = apply_args(&mut config, &args) {
        error!("invalid arguments: {err}");
        std::process::exit(1);
    }

    let resolver = Arc::new(ForwardResolver::new(&config));
    let (shutdown_tx, _) = broadcast::channel(1);

    tokio::spawn(wait_for_shutdown(shutdown_tx.clone()));

    info!("starting stub server");
    if let Err(err) = server::run(config, resolver, shutdown_tx).await {
        error!("stub server failed: {err}");
        std::process::exit(1);
    }
}

fn apply_args(config: &mut StubConfig, args: &Args) -> mimir::error::Result<()> {
    if args.no_stub_listener {
        config.stub_listener = false;
    }
    for spec in &args.extra_listeners {
        let listener = spec.parse()?;
        if !config.extra_listeners.contains(&listener) {
            config.extra_listeners.push(listener);
        }
    }
    if !args.upstream_servers.is_empty() {
        config.upstream_servers.clear();
        for server in &args.upstream_servers {
            let addr = server
                .parse()
                .or_else(|_| {
                    server
                        .parse::<std::net::IpAddr>()
                        .map(|ip| std::net::SocketAddr::new(ip, mimir::constants::DNS_PORT))
                })
                .map_err(|_| mimir::error::StubError::InvalidUpstreamServer(server.clone()))?;
            config.upstream_servers.push(addr);
        }
    }
    Ok(())
}

async fn wait_for_shutdown(shutdown_tx: broadcast::Sender<()>) {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            error!("cannot install SIGTERM handler: {err}");
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
    }
    let _ = shutdown_tx.send(());
}
