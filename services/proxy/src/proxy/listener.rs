//! HTTP listener and request handling.
//!
//! Each accepted connection is served on its own task by axum; every request
//! runs the full pipeline:
//!
//! ```text
//! request -> RouteTable::route -> BackendSelector::select -> Forwarder::forward -> response
//! ```
//!
//! Errors stop at this boundary and become a plain-text 503 (routing) or
//! 500 (forwarding) response.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::HOST;
use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use super::backend::BackendSelector;
use super::forwarder::Forwarder;
use super::router::SharedRouteTable;
use crate::error::ProxyError;

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self { bind_addr }
    }
}

/// Request counters.
#[derive(Debug, Default)]
pub struct ProxyStats {
    /// Total requests received.
    pub requests_received: AtomicU64,
    /// Requests that matched a route and rule.
    pub routes_matched: AtomicU64,
    /// Requests with no host or rule match.
    pub routes_failed: AtomicU64,
    /// Requests that got a backend.
    pub backends_selected: AtomicU64,
    /// Requests that failed while cloning or forwarding.
    pub forwards_failed: AtomicU64,
    /// Backend responses whose status line went to the caller. A body that
    /// aborts mid-stream still counts here.
    pub responses_started: AtomicU64,
}

/// Routing, selection, and forwarding for one proxy instance.
pub struct Proxy {
    /// Route table for routing decisions.
    route_table: SharedRouteTable,
    /// Round-robin state.
    backend_selector: Arc<BackendSelector>,
    /// Outbound HTTP.
    forwarder: Forwarder,
    /// Statistics.
    stats: ProxyStats,
}

impl Proxy {
    /// Create a new proxy.
    pub fn new(
        route_table: SharedRouteTable,
        backend_selector: Arc<BackendSelector>,
        forwarder: Forwarder,
    ) -> Self {
        Self {
            route_table,
            backend_selector,
            forwarder,
            stats: ProxyStats::default(),
        }
    }

    /// Get the route table.
    pub fn route_table(&self) -> &SharedRouteTable {
        &self.route_table
    }

    /// Get proxy statistics.
    pub fn stats(&self) -> &ProxyStats {
        &self.stats
    }

    /// Handle a single request from `peer`.
    pub async fn handle(&self, request: Request, peer: SocketAddr) -> Response {
        self.stats.requests_received.fetch_add(1, Ordering::Relaxed);

        match self.proxy(request, peer).await {
            Ok(response) => {
                self.stats.responses_started.fetch_add(1, Ordering::Relaxed);
                response
            }
            Err(e) => {
                warn!(
                    peer_addr = %peer,
                    reason = e.reason_code(),
                    status = e.status_code().as_u16(),
                    error = %e,
                    "Request failed"
                );
                e.into_response()
            }
        }
    }

    async fn proxy(&self, request: Request, peer: SocketAddr) -> Result<Response, ProxyError> {
        let host = request_host(&request);

        let matched = self
            .route_table
            .route(host.as_deref(), request.uri().path(), request.headers())
            .inspect_err(|_| {
                self.stats.routes_failed.fetch_add(1, Ordering::Relaxed);
            })?;
        self.stats.routes_matched.fetch_add(1, Ordering::Relaxed);

        let rule = matched.rule();
        let backend = self.backend_selector.select(&matched.hostname, rule).await?;
        self.stats.backends_selected.fetch_add(1, Ordering::Relaxed);

        debug!(
            peer_addr = %peer,
            route = %matched.route.name,
            rule = %rule.name,
            backend = %backend.name,
            "Routing request"
        );

        let deadline = self.forwarder.deadline_for(rule);
        self.forwarder
            .forward(request, peer, backend, deadline)
            .await
            .inspect_err(|_| {
                self.stats.forwards_failed.fetch_add(1, Ordering::Relaxed);
            })
    }
}

/// Host the request was addressed to, with port if the client sent one.
///
/// The URI authority wins over the `Host` header.
fn request_host(request: &Request) -> Option<String> {
    let uri = request.uri();
    if let Some(host) = uri.host() {
        return Some(match uri.port_u16() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        });
    }

    request
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Build the axum router that sends every request through `proxy`.
pub fn router(proxy: Arc<Proxy>) -> Router {
    Router::new()
        .fallback(proxy_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(proxy)
}

async fn proxy_handler(
    State(proxy): State<Arc<Proxy>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    proxy.handle(request, peer).await
}

/// An HTTP listener for the proxy.
pub struct Listener {
    /// The TCP listener.
    listener: TcpListener,
    /// Request pipeline shared by all connections.
    proxy: Arc<Proxy>,
}

impl Listener {
    /// Create a new listener.
    pub async fn bind(config: ListenerConfig, proxy: Arc<Proxy>) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(bind_addr = %local_addr, "Listener bound");

        Ok(Self { listener, proxy })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get the proxy behind this listener.
    pub fn proxy(&self) -> &Arc<Proxy> {
        &self.proxy
    }

    /// Run the listener until the process exits.
    pub async fn run(self) -> io::Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Run the listener until `shutdown` resolves, then drain in-flight requests.
    pub async fn run_until<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        let app = router(self.proxy);
        axum::serve(
            self.listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await?;

        info!(bind_addr = %local_addr, "Listener stopped");
        Ok(())
    }
}
