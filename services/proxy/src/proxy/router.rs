//! Route table and routing decisions.
//!
//! Routes own hostnames; each route carries an ordered list of rules, each
//! rule an ordered list of match predicates and a pool of backends.
//!
//! Matching rules:
//! - Hostnames normalized to lowercase, trailing dot trimmed
//! - Exact hostname lookup, first with the port the client sent, then without
//! - Routes sharing a hostname are evaluated in registration order
//! - Rules in declaration order, predicates in declaration order
//! - First rule with any satisfied predicate wins (no specificity scoring)

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use axum::http::{HeaderMap, HeaderName};
use tracing::{debug, info, warn};

use super::backend::Backend;
use crate::error::{ProxyError, RouteConfigError};

/// A single path-prefix and header-equality condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchPredicate {
    /// Required path prefix. Empty matches every path.
    pub path_prefix: String,
    /// Required header values, names compared case-insensitively.
    pub headers: Vec<(HeaderName, String)>,
}

impl MatchPredicate {
    /// Create a predicate from a path prefix and header requirements.
    pub fn new<I, K, V>(path_prefix: impl Into<String>, headers: I) -> Result<Self, RouteConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let headers = headers
            .into_iter()
            .map(|(name, value)| {
                let name = name.as_ref();
                HeaderName::from_bytes(name.as_bytes())
                    .map(|h| (h, value.into()))
                    .map_err(|_| RouteConfigError::InvalidHeaderName(name.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            path_prefix: path_prefix.into(),
            headers,
        })
    }

    /// Path-prefix-only predicate.
    pub fn prefix(path_prefix: impl Into<String>) -> Self {
        Self {
            path_prefix: path_prefix.into(),
            headers: Vec::new(),
        }
    }

    /// Check whether a request path and headers satisfy this predicate.
    ///
    /// Only the first value of a header is compared. A missing header reads
    /// as the empty string.
    pub fn matches(&self, path: &str, headers: &HeaderMap) -> bool {
        if !path.starts_with(&self.path_prefix) {
            return false;
        }

        self.headers.iter().all(|(name, expected)| {
            let actual = headers.get(name).map(|v| v.as_bytes()).unwrap_or_default();
            actual == expected.as_bytes()
        })
    }
}

/// Per-rule timeout policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuleTimeout {
    /// Upper bound on handling the whole client request.
    pub request_timeout: Option<Duration>,
    /// Upper bound on the call to the backend.
    pub backend_request_timeout: Option<Duration>,
}

impl RuleTimeout {
    /// Deadline for the outbound call.
    ///
    /// With no retries both timeouts bound the same single backend call, so the
    /// smaller configured value wins. A zero timeout counts as unset. Falls back
    /// to `default` when neither is set.
    pub fn deadline(&self, default: Duration) -> Duration {
        let set = |t: Option<Duration>| t.filter(|d| !d.is_zero());
        match (set(self.request_timeout), set(self.backend_request_timeout)) {
            (Some(a), Some(b)) => a.min(b),
            (Some(t), None) | (None, Some(t)) => t,
            (None, None) => default,
        }
    }
}

/// Ordered predicates mapped to a pool of backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    /// Rule name, keys round-robin state within the owning route.
    pub name: String,
    pub matches: Vec<MatchPredicate>,
    pub backends: Vec<Backend>,
    pub timeout: RuleTimeout,
}

impl Rule {
    /// Create a rule. An empty backend list is allowed here; selecting from
    /// such a rule fails with `NoBackends`.
    pub fn new(
        name: impl Into<String>,
        matches: Vec<MatchPredicate>,
        backends: Vec<Backend>,
        timeout: RuleTimeout,
    ) -> Result<Self, RouteConfigError> {
        let name = name.into();
        if name.is_empty() {
            return Err(RouteConfigError::EmptyName("rule"));
        }
        if matches.is_empty() {
            return Err(RouteConfigError::NoMatches(name));
        }

        Ok(Self {
            name,
            matches,
            backends,
            timeout,
        })
    }

    /// True when any predicate is satisfied.
    pub fn matches(&self, path: &str, headers: &HeaderMap) -> bool {
        self.matches.iter().any(|m| m.matches(path, headers))
    }
}

/// A named bundle of hostnames and the rules that apply to them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub name: String,
    /// Normalized, deduplicated hostnames.
    pub hostnames: Vec<String>,
    pub rules: Vec<Rule>,
}

impl Route {
    /// Create a route. Hostnames are normalized and deduplicated.
    pub fn new(
        name: impl Into<String>,
        hostnames: impl IntoIterator<Item = impl AsRef<str>>,
        rules: Vec<Rule>,
    ) -> Result<Self, RouteConfigError> {
        let name = name.into();
        if name.is_empty() {
            return Err(RouteConfigError::EmptyName("route"));
        }

        let mut normalized: Vec<String> = Vec::new();
        for hostname in hostnames {
            let hostname = Self::normalize_hostname(hostname.as_ref());
            if !hostname.is_empty() && !normalized.contains(&hostname) {
                normalized.push(hostname);
            }
        }

        if normalized.is_empty() {
            return Err(RouteConfigError::NoHostnames(name));
        }

        Ok(Self {
            name,
            hostnames: normalized,
            rules,
        })
    }

    /// Normalize a hostname for matching.
    ///
    /// - Convert to lowercase
    /// - Trim trailing dot
    pub fn normalize_hostname(hostname: &str) -> String {
        hostname.trim().to_lowercase().trim_end_matches('.').to_string()
    }

    /// Find the first rule with a satisfied predicate.
    pub fn match_rule(&self, path: &str, headers: &HeaderMap) -> Option<usize> {
        self.rules.iter().position(|rule| rule.matches(path, headers))
    }

    fn duplicate_rule_names(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        let mut duplicates = Vec::new();
        for rule in &self.rules {
            if seen.contains(&rule.name.as_str()) {
                duplicates.push(rule.name.as_str());
            } else {
                seen.push(&rule.name);
            }
        }
        duplicates
    }
}

/// Result of a successful routing decision.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    /// Hostname key the route was found under.
    pub hostname: String,
    pub route: Arc<Route>,
    rule_index: usize,
}

impl RouteMatch {
    /// The matched rule.
    pub fn rule(&self) -> &Rule {
        &self.route.rules[self.rule_index]
    }
}

/// Immutable snapshot of route data for lock-free reads.
#[derive(Debug, Default, Clone)]
struct RouteSnapshot {
    /// Routes indexed by hostname, in registration order.
    by_hostname: HashMap<String, Vec<Arc<Route>>>,
    /// All routes in registration order.
    routes: Vec<Arc<Route>>,
}

impl RouteSnapshot {
    /// Create a new snapshot with a route added.
    fn with_route(&self, route: Arc<Route>) -> Self {
        let mut next = self.clone();
        for hostname in &route.hostnames {
            next.by_hostname
                .entry(hostname.clone())
                .or_default()
                .push(Arc::clone(&route));
        }
        next.routes.push(route);
        next
    }
}

/// Route table managing all registered routes.
///
/// Uses ArcSwap so registration never blocks matching.
/// Readers get consistent snapshots without blocking.
pub struct RouteTable {
    /// Atomically swappable route snapshot.
    snapshot: ArcSwap<RouteSnapshot>,
}

impl RouteTable {
    /// Create a new empty route table.
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RouteSnapshot::default()),
        }
    }

    /// Create a route table with the given routes registered in order.
    pub fn from_routes(routes: impl IntoIterator<Item = Route>) -> Self {
        let table = Self::new();
        for route in routes {
            table.register(route);
        }
        table
    }

    /// Register a route under each of its hostnames.
    ///
    /// A hostname already owned by another route keeps that route first; the
    /// new route is only consulted when the earlier ones match no rule.
    pub fn register(&self, route: Route) {
        for name in route.duplicate_rule_names() {
            warn!(
                route = %route.name,
                rule = %name,
                "Duplicate rule name in route, round-robin state will be shared"
            );
        }

        let route = Arc::new(route);
        let previous = self
            .snapshot
            .rcu(|current| Arc::new(current.with_route(Arc::clone(&route))));

        for hostname in &route.hostnames {
            match previous.by_hostname.get(hostname) {
                Some(existing) => warn!(
                    hostname = %hostname,
                    route = %route.name,
                    existing_routes = existing.len(),
                    "Hostname already registered, route appended as fallback"
                ),
                None => info!(hostname = %hostname, route = %route.name, "Registered route"),
            }
        }
    }

    /// Make a routing decision for a request.
    pub fn route(
        &self,
        host: Option<&str>,
        path: &str,
        headers: &HeaderMap,
    ) -> Result<RouteMatch, ProxyError> {
        let snapshot = self.snapshot.load();
        let host = host.unwrap_or_default();

        let candidates = Self::lookup(&snapshot, host);
        let Some((first_hostname, _)) = candidates.first() else {
            debug!(host = %host, "No route for host");
            return Err(ProxyError::NoHostMatch {
                host: host.to_string(),
            });
        };
        let first_hostname = first_hostname.clone();

        for (hostname, routes) in candidates {
            for route in routes {
                if let Some(rule_index) = route.match_rule(path, headers) {
                    debug!(
                        hostname = %hostname,
                        route = %route.name,
                        rule = %route.rules[rule_index].name,
                        path = %path,
                        "Route matched"
                    );
                    return Ok(RouteMatch {
                        hostname,
                        route: Arc::clone(route),
                        rule_index,
                    });
                }
            }
        }

        debug!(hostname = %first_hostname, path = %path, "No rule matched");
        Err(ProxyError::NoRuleMatch {
            host: first_hostname,
            path: path.to_string(),
        })
    }

    /// Routes owned by `host` with its port, then by the bare host.
    fn lookup<'s>(snapshot: &'s RouteSnapshot, host: &str) -> Vec<(String, &'s [Arc<Route>])> {
        let normalized = Route::normalize_hostname(host);
        if normalized.is_empty() {
            return Vec::new();
        }

        let bare = Route::normalize_hostname(strip_port(&normalized));
        let mut keys = vec![normalized];
        if bare != keys[0] {
            keys.push(bare);
        }

        keys.into_iter()
            .filter_map(|key| {
                snapshot
                    .by_hostname
                    .get(&key)
                    .map(|routes| (key, routes.as_slice()))
            })
            .collect()
    }

    /// All registered routes in registration order.
    pub fn routes(&self) -> Vec<Arc<Route>> {
        self.snapshot.load().routes.clone()
    }

    /// All hostnames with at least one route.
    pub fn hostnames(&self) -> Vec<String> {
        self.snapshot.load().by_hostname.keys().cloned().collect()
    }

    /// Get the total number of routes.
    pub fn len(&self) -> usize {
        self.snapshot.load().routes.len()
    }

    /// Check if the route table is empty.
    pub fn is_empty(&self) -> bool {
        self.snapshot.load().routes.is_empty()
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared route table reference.
pub type SharedRouteTable = Arc<RouteTable>;

/// Strip a trailing `:port` from a host, keeping IPv6 brackets intact.
fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }

    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}
