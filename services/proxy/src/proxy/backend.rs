//! Backend endpoints and round-robin selection.
//!
//! A `Backend` is an immutable upstream address. The `BackendSelector` owns
//! the only mutable state on the request path: one round-robin cursor per
//! (hostname, rule name) pair.
//!
//! - Cursors are created lazily on first selection and live for the process
//!   lifetime
//! - The first selection for a key returns index 0, then 1, 2, ... wrapping
//!   modulo the rule's backend count
//! - Advancing a cursor is a single atomic read-modify-write, so concurrent
//!   selections never lose or duplicate an advance
//! - Selections for different keys only contend on the map lookup

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use reqwest::Url;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::router::Rule;
use crate::error::{ProxyError, RouteConfigError};

/// A single upstream endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    /// Display name, defaults to the address host (with port, if any).
    pub name: String,
    /// Absolute base URL requests are forwarded to.
    pub address: Url,
}

impl Backend {
    /// Create a backend from an address string and an optional name.
    ///
    /// The address must be an absolute `http` or `https` URL with a host.
    pub fn new(address: &str, name: Option<&str>) -> Result<Self, RouteConfigError> {
        let invalid = |detail: String| RouteConfigError::InvalidBackendAddress {
            address: address.to_string(),
            detail,
        };

        let address = Url::parse(address).map_err(|e| invalid(e.to_string()))?;

        if !matches!(address.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme '{}'", address.scheme())));
        }

        let host = match address.host_str() {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => return Err(invalid("missing host".to_string())),
        };

        let name = match name {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => match address.port() {
                Some(port) => format!("{host}:{port}"),
                None => host,
            },
        };

        Ok(Self { name, address })
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

/// Key for cursor lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CursorKey {
    hostname: String,
    rule: String,
}

/// Round-robin position for one key.
#[derive(Debug, Default)]
struct RoundRobinCursor {
    /// Index handed out by the next selection.
    next: AtomicUsize,
}

impl RoundRobinCursor {
    /// Return the current index and advance modulo `len`.
    fn advance(&self, len: usize) -> usize {
        let previous = self
            .next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some((n + 1) % len))
            .unwrap_or_else(|n| n);
        previous % len
    }
}

/// Selector that keeps round-robin state for every (hostname, rule) pair.
pub struct BackendSelector {
    /// Cursors keyed by hostname and rule name.
    cursors: RwLock<HashMap<CursorKey, Arc<RoundRobinCursor>>>,
}

impl BackendSelector {
    /// Create a new backend selector with no cursors.
    pub fn new() -> Self {
        Self {
            cursors: RwLock::new(HashMap::new()),
        }
    }

    /// Pick the next backend of `rule` for requests that arrived on `hostname`.
    pub async fn select<'r>(
        &self,
        hostname: &str,
        rule: &'r Rule,
    ) -> Result<&'r Backend, ProxyError> {
        if rule.backends.is_empty() {
            warn!(hostname = %hostname, rule = %rule.name, "No backends for rule");
            return Err(ProxyError::NoBackends {
                hostname: hostname.to_string(),
                rule: rule.name.clone(),
            });
        }

        let cursor = self.cursor(hostname, &rule.name).await;
        let idx = cursor.advance(rule.backends.len());
        let backend = &rule.backends[idx];

        debug!(
            hostname = %hostname,
            rule = %rule.name,
            index = idx,
            backend = %backend.name,
            "Backend selected"
        );

        Ok(backend)
    }

    /// Get or create the cursor for a key.
    async fn cursor(&self, hostname: &str, rule: &str) -> Arc<RoundRobinCursor> {
        let key = CursorKey {
            hostname: hostname.to_string(),
            rule: rule.to_string(),
        };

        // Fast path: read lock
        {
            let cursors = self.cursors.read().await;
            if let Some(cursor) = cursors.get(&key) {
                return Arc::clone(cursor);
            }
        }

        // Slow path: write lock
        let mut cursors = self.cursors.write().await;
        cursors.entry(key).or_default().clone()
    }

    /// Number of (hostname, rule) pairs that have been selected at least once.
    pub async fn len(&self) -> usize {
        self.cursors.read().await.len()
    }

    /// Check if no selection has happened yet.
    pub async fn is_empty(&self) -> bool {
        self.cursors.read().await.is_empty()
    }
}

impl Default for BackendSelector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::router::{MatchPredicate, RuleTimeout};

    fn make_rule(name: &str, backend_count: usize) -> Rule {
        let backends = (0..backend_count)
            .map(|i| Backend::new(&format!("http://10.0.0.{}:8080", i + 1), None).unwrap())
            .collect();
        Rule::new(
            name,
            vec![MatchPredicate::prefix("/")],
            backends,
            RuleTimeout::default(),
        )
        .unwrap()
    }

    fn index_of(rule: &Rule, backend: &Backend) -> usize {
        rule.backends.iter().position(|b| b == backend).unwrap()
    }

    #[test]
    fn test_backend_name_defaults_to_host() {
        let backend = Backend::new("http://localhost:8081/backend", None).unwrap();
        assert_eq!(backend.name, "localhost:8081");

        let backend = Backend::new("https://api.example.com", None).unwrap();
        assert_eq!(backend.name, "api.example.com");

        let backend = Backend::new("http://localhost:8081", Some("a")).unwrap();
        assert_eq!(backend.name, "a");
    }

    #[test]
    fn test_backend_rejects_relative_address() {
        let err = Backend::new("/just/a/path", None).unwrap_err();
        assert!(matches!(err, RouteConfigError::InvalidBackendAddress { .. }));

        let err = Backend::new("ftp://files.example.com", None).unwrap_err();
        assert!(matches!(err, RouteConfigError::InvalidBackendAddress { .. }));
    }

    #[tokio::test]
    async fn test_round_robin_wraps() {
        let selector = BackendSelector::new();
        let rule = make_rule("rule1", 3);

        let mut seen = Vec::new();
        for _ in 0..4 {
            let backend = selector.select("localhost", &rule).await.unwrap();
            seen.push(index_of(&rule, backend));
        }

        assert_eq!(seen, vec![0, 1, 2, 0]);
    }

    #[tokio::test]
    async fn test_single_backend_always_selected() {
        let selector = BackendSelector::new();
        let rule = make_rule("only", 1);

        for _ in 0..3 {
            let backend = selector.select("localhost", &rule).await.unwrap();
            assert_eq!(index_of(&rule, backend), 0);
        }
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let selector = BackendSelector::new();
        let rule_a = make_rule("a", 2);
        let rule_b = make_rule("b", 2);

        // Advance (localhost, a) twice
        selector.select("localhost", &rule_a).await.unwrap();
        selector.select("localhost", &rule_a).await.unwrap();

        // Fresh keys still start at 0
        let b = selector.select("localhost", &rule_b).await.unwrap();
        assert_eq!(index_of(&rule_b, b), 0);
        let other_host = selector.select("example.org", &rule_a).await.unwrap();
        assert_eq!(index_of(&rule_a, other_host), 0);

        // And (localhost, a) continues where it left off
        let a = selector.select("localhost", &rule_a).await.unwrap();
        assert_eq!(index_of(&rule_a, a), 0);

        assert_eq!(selector.len().await, 3);
    }

    #[tokio::test]
    async fn test_no_backends() {
        let selector = BackendSelector::new();
        let rule = make_rule("empty", 0);

        match selector.select("localhost", &rule).await {
            Err(ProxyError::NoBackends { hostname, rule }) => {
                assert_eq!(hostname, "localhost");
                assert_eq!(rule, "empty");
            }
            other => panic!("Expected NoBackends, got {:?}", other),
        }
        assert!(selector.is_empty().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_selection_is_fair() {
        let selector = Arc::new(BackendSelector::new());
        let rule = Arc::new(make_rule("busy", 3));

        let mut handles = Vec::new();
        for _ in 0..64 {
            let selector = Arc::clone(&selector);
            let rule = Arc::clone(&rule);
            handles.push(tokio::spawn(async move {
                let mut picked = Vec::new();
                for _ in 0..10 {
                    let backend = selector.select("localhost", &rule).await.unwrap();
                    picked.push(index_of(&rule, backend));
                }
                picked
            }));
        }

        let mut counts = [0usize; 3];
        for handle in handles {
            for idx in handle.await.unwrap() {
                counts[idx] += 1;
            }
        }

        // 640 selections over 3 backends: 214, 213, 213 in cursor order
        assert_eq!(counts, [214, 213, 213]);
    }
}
