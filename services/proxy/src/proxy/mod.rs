//! L7 HTTP proxy implementation.
//!
//! This module provides:
//! - Host, path-prefix, and header based routing
//! - Per-(hostname, rule) round-robin backend selection
//! - Request forwarding with `X-Forwarded-For` rewriting and a deadline
//! - The HTTP listener tying them together
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> RouteTable -> BackendSelector -> Forwarder -> Backend
//!                          |                |
//!                 (hostname, rule)   round-robin cursor
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{BackendSelector, Forwarder, ForwarderConfig, Listener, ListenerConfig, Proxy, RouteTable};
//!
//! let route_table = Arc::new(RouteTable::from_routes(routes));
//! let backend_selector = Arc::new(BackendSelector::new());
//! let forwarder = Forwarder::new(ForwarderConfig::default())?;
//! let proxy = Arc::new(Proxy::new(route_table, backend_selector, forwarder));
//!
//! let listener = Listener::bind(ListenerConfig::new("0.0.0.0:8080".parse()?), proxy).await?;
//! listener.run().await?;
//! ```

mod backend;
mod forwarder;
mod listener;
mod netif;
mod router;

pub use backend::{Backend, BackendSelector};
pub use forwarder::{
    append_forwarded_for, target_url, Forwarder, ForwarderConfig, OutboundRequest,
    DEFAULT_FORWARD_TIMEOUT, DEFAULT_MAX_BODY_BYTES, X_FORWARDED_FOR,
};
pub use listener::{router, Listener, ListenerConfig, Proxy, ProxyStats};
pub use netif::local_ipv4_addrs;
pub use router::{
    MatchPredicate, Route, RouteMatch, RouteTable, Rule, RuleTimeout, SharedRouteTable,
};
