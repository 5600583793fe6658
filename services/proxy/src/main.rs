//! hostgate
//!
//! HTTP reverse proxy with host, path, and header routing.
//!
//! This service:
//! - Loads routes from a YAML or JSON file at startup
//! - Accepts HTTP requests on one listener
//! - Picks a backend per (hostname, rule) in round-robin order
//! - Forwards requests with `X-Forwarded-For` set and relays the response

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hostgate_proxy::config::Config;
use hostgate_proxy::route_file;
use hostgate_proxy::{BackendSelector, Forwarder, Listener, ListenerConfig, Proxy, RouteTable};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to HOSTGATE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting hostgate");
    info!(
        listen_addr = %config.listen_addr,
        routes_file = %config.routes_file.display(),
        forward_timeout_ms = config.forward_timeout.as_millis() as u64,
        max_body_bytes = config.max_body_bytes,
        "Configuration loaded"
    );

    let routes = route_file::load_routes(&config.routes_file)?;

    // Create shared state
    let route_table = Arc::new(RouteTable::from_routes(routes));
    let backend_selector = Arc::new(BackendSelector::new());
    let forwarder =
        Forwarder::new(config.forwarder_config()).context("Failed to build HTTP client")?;
    let proxy = Arc::new(Proxy::new(route_table, backend_selector, forwarder));

    let listener = match Listener::bind(ListenerConfig::new(config.listen_addr), proxy).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(
                bind_addr = %config.listen_addr,
                error = %e,
                "Failed to bind listener"
            );
            return Err(e.into());
        }
    };

    listener.run_until(shutdown_signal()).await?;

    info!("hostgate stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
