//! switchyardd — the Switchyard router daemon.
//!
//! Assembles the router from its parts:
//! - Route table + staleness pruner
//! - NATS registration listener
//! - HTTP proxy listener (and TLS listener when `enable_ssl` is set)
//! - Status API (`/routes`, `/health`)
//! - Drain controller bound to SIGTERM, SIGINT and SIGUSR1
//!
//! # Usage
//!
//! ```text
//! switchyardd -c /etc/switchyard/switchyard.toml
//! ```

use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use switchyard_api::ApiState;
use switchyard_core::config::LogFormat;
use switchyard_core::{Lifecycle, RouterConfig};
use switchyard_mbus::{BusListener, RegistryHandler};
use switchyard_proxy::{ConnectionTracker, DrainController, Proxy, ProxyServer};
use switchyard_registry::{BusHealth, Pruner, RouteTable};

#[derive(Parser)]
#[command(name = "switchyardd", about = "Switchyard dynamic HTTP router")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "/etc/switchyard/switchyard.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = RouterConfig::from_file(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;

    init_tracing(&config)?;
    run(config).await
}

fn init_tracing(config: &RouterConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.logging.level)
            .with_context(|| format!("invalid log level {:?}", config.logging.level))?,
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
    Ok(())
}

async fn run(config: RouterConfig) -> anyhow::Result<()> {
    info!(nats = config.nats.len(), "switchyard starting");

    let table = Arc::new(RouteTable::new(config.droplet_stale_threshold));
    let lifecycle = Lifecycle::new();
    let connections = ConnectionTracker::new();

    // ── Registration bus ───────────────────────────────────────

    let bus = BusHealth::new(false);
    let servers: Vec<String> = config.nats.iter().map(|n| n.url()).collect();
    let start = switchyard_mbus::router_start(&config, vec![advertised_host(&config)])
        .context("building router.start announcement")?;
    let handler = RegistryHandler::new(Arc::clone(&table), lifecycle.clone(), &start);
    let listener = BusListener::new(servers, handler, bus.clone(), lifecycle.clone());
    let bus_handle = tokio::spawn(async move {
        if let Err(e) = listener.run().await {
            error!(error = %e, "registration listener failed");
        }
    });

    let pruner = Pruner::new(
        Arc::clone(&table),
        config.prune_stale_droplets_interval,
        config.suspend_pruning_if_nats_unavailable,
        bus,
        lifecycle.clone(),
    );
    let pruner_handle = tokio::spawn(pruner.run());

    // Let registrations arrive before taking traffic.
    if !config.start_response_delay_interval.is_zero() {
        info!(delay = ?config.start_response_delay_interval, "waiting for routes before listening");
        tokio::time::sleep(config.start_response_delay_interval).await;
    }

    // ── Listeners ──────────────────────────────────────────────

    let proxy = Arc::new(
        Proxy::new(&config, Arc::clone(&table), lifecycle.clone())
            .context("building backend TLS configuration")?,
    );

    let mut servers = Vec::new();
    let http_addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let http = ProxyServer::bind(http_addr, Arc::clone(&proxy), lifecycle.clone(), connections.clone())
        .await
        .with_context(|| format!("binding proxy listener on {http_addr}"))?;
    servers.push(tokio::spawn(http.serve()));

    if config.enable_ssl {
        let tls = switchyard_proxy::tls::server_config(&config)
            .context("building frontend TLS configuration")?;
        let tls_addr = SocketAddr::from(([0, 0, 0, 0], config.ssl_port));
        let https = ProxyServer::bind(tls_addr, Arc::clone(&proxy), lifecycle.clone(), connections.clone())
            .await
            .with_context(|| format!("binding TLS listener on {tls_addr}"))?
            .with_tls(tls);
        servers.push(tokio::spawn(https.serve()));
    }

    let status_addr = format!("{}:{}", config.status.host, config.status.port);
    let status_listener = tokio::net::TcpListener::bind(&status_addr)
        .await
        .with_context(|| format!("binding status API on {status_addr}"))?;
    if config.status.user.is_empty() {
        warn!("status API credentials not set; /routes is unauthenticated");
    }
    let api_state = ApiState::new(Arc::clone(&table), lifecycle.clone(), &config.status);
    let api_handle = tokio::spawn(async move {
        if let Err(e) = switchyard_api::serve(status_listener, api_state).await {
            error!(error = %e, "status API failed");
        }
    });

    info!(
        port = config.port,
        ssl_port = config.enable_ssl.then_some(config.ssl_port),
        status = %status_addr,
        "switchyard started"
    );

    // ── Drain on signal ────────────────────────────────────────

    wait_for_signal().await?;

    let drain = DrainController::new(
        lifecycle,
        connections,
        config.drain_wait,
        config.drain_timeout,
    );
    let report = drain.drain().await;
    if report.timed_out() {
        warn!(forced = report.forced, "drain timed out");
    }

    for server in servers {
        let _ = server.await;
    }
    let _ = api_handle.await;
    let _ = pruner_handle.await;
    let _ = bus_handle.await;

    info!("switchyard stopped");
    Ok(())
}

async fn wait_for_signal() -> anyhow::Result<()> {
    let mut term = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut int = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut usr1 = signal(SignalKind::user_defined1()).context("installing SIGUSR1 handler")?;

    let name = tokio::select! {
        _ = term.recv() => "SIGTERM",
        _ = int.recv() => "SIGINT",
        _ = usr1.recv() => "SIGUSR1",
    };
    info!(signal = name, "drain signal received");
    Ok(())
}

/// Address announced in `router.start`: the status host when it is a
/// concrete address, otherwise the local address used to reach the bus.
fn advertised_host(config: &RouterConfig) -> String {
    if let Ok(ip) = config.status.host.parse::<IpAddr>() {
        if !ip.is_unspecified() {
            return ip.to_string();
        }
    }
    config
        .nats
        .first()
        .and_then(|nats| {
            let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
            socket.connect((nats.host.as_str(), nats.port)).ok()?;
            socket.local_addr().ok()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "127.0.0.1".to_string())
}
