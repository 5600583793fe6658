//! hostgate proxy library.
//!
//! Exposes the routing, selection, and forwarding pipeline so the binary and
//! the integration tests build the same proxy.

pub mod config;
pub mod error;
pub mod proxy;
pub mod route_file;

pub use error::{ProxyError, RouteConfigError};
pub use proxy::{
    Backend, BackendSelector, Forwarder, ForwarderConfig, Listener, ListenerConfig, Proxy,
    ProxyStats, Route, RouteTable, Rule, SharedRouteTable,
};
