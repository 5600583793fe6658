//! Request forwarding.
//!
//! Turns an accepted inbound request into an outbound call against the
//! selected backend and relays the answer:
//!
//! 1. Buffer the inbound body (bounded by `max_body_bytes`)
//! 2. Retarget: backend base URL + inbound path and query
//! 3. Copy headers, append the caller and local IPv4s to `X-Forwarded-For`
//! 4. Send with a deadline covering connect, headers, and body
//! 5. Relay status, headers, and body back to the caller
//!
//! Nothing is retried. Buffers and the upstream body are dropped on every
//! exit path.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::extract::Request;
use axum::http::header::{CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Uri};
use axum::response::Response;
use futures_util::TryStreamExt;
use reqwest::Url;
use tracing::{debug, warn};

use super::backend::Backend;
use super::netif::local_ipv4_addrs;
use super::router::Rule;
use crate::error::ProxyError;

/// Default deadline for the outbound call.
pub const DEFAULT_FORWARD_TIMEOUT: Duration = Duration::from_secs(10);

/// Default cap on a buffered inbound body.
pub const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Forwarding-chain header.
pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Configuration for a forwarder.
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Deadline used when the matched rule sets no timeout.
    pub default_timeout: Duration,
    /// Maximum inbound body size.
    pub max_body_bytes: usize,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_FORWARD_TIMEOUT,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

/// A fully buffered request ready to be sent to a backend.
#[derive(Debug)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Forwards requests to backends over a shared HTTP client.
pub struct Forwarder {
    client: reqwest::Client,
    config: ForwarderConfig,
}

impl Forwarder {
    /// Create a new forwarder. Redirects are relayed, not followed.
    pub fn new(config: ForwarderConfig) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self { client, config })
    }

    /// Get the forwarder configuration.
    pub fn config(&self) -> &ForwarderConfig {
        &self.config
    }

    /// Deadline for a request matched by `rule`.
    pub fn deadline_for(&self, rule: &Rule) -> Duration {
        rule.timeout.deadline(self.config.default_timeout)
    }

    /// Forward `request` from `peer` to `backend` and relay the response.
    pub async fn forward(
        &self,
        request: Request,
        peer: SocketAddr,
        backend: &Backend,
        deadline: Duration,
    ) -> Result<Response, ProxyError> {
        let outbound = self.clone_request(request, peer, backend).await?;

        debug!(
            backend = %backend.name,
            method = %outbound.method,
            url = %outbound.url,
            deadline_ms = deadline.as_millis() as u64,
            "Forwarding request"
        );

        let started = Instant::now();
        let response = self
            .client
            .request(outbound.method, outbound.url)
            .headers(outbound.headers)
            .body(outbound.body)
            .timeout(deadline)
            .send()
            .await
            .map_err(|e| ProxyError::forward(backend.name.clone(), e))?;

        debug!(
            backend = %backend.name,
            status = response.status().as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Backend responded"
        );

        Ok(relay(response, backend.name.clone()))
    }

    /// Build the outbound request: buffered body, retargeted URL, rewritten headers.
    pub async fn clone_request(
        &self,
        request: Request,
        peer: SocketAddr,
        backend: &Backend,
    ) -> Result<OutboundRequest, ProxyError> {
        let (parts, body) = request.into_parts();

        let body = axum::body::to_bytes(body, self.config.max_body_bytes)
            .await
            .map_err(|e| ProxyError::Clone(format!("failed to read request body: {e}")))?;

        let url = target_url(&backend.address, &parts.uri);

        // Framing and authority are recomputed by the client for the new target
        let mut headers = parts.headers;
        headers.remove(HOST);
        headers.remove(CONTENT_LENGTH);
        headers.remove(TRANSFER_ENCODING);

        let local_ips = local_ipv4_addrs()
            .map_err(|e| ProxyError::Clone(format!("failed to list local addresses: {e}")))?;
        append_forwarded_for(&mut headers, peer.ip().to_canonical(), &local_ips);

        Ok(OutboundRequest {
            method: parts.method,
            url,
            headers,
            body,
        })
    }
}

/// Resolve the inbound path and query against a backend base URL.
///
/// The base path is kept as a prefix: `http://h/backend` + `/hello?x=1`
/// becomes `http://h/backend/hello?x=1`. Without an inbound query the base
/// query (if any) is kept.
pub fn target_url(base: &Url, uri: &Uri) -> Url {
    let mut url = base.clone();

    let base_path = base.path().trim_end_matches('/');
    let path = uri.path();
    if path.starts_with('/') {
        url.set_path(&format!("{base_path}{path}"));
    } else {
        url.set_path(&format!("{base_path}/{path}"));
    }

    if let Some(query) = uri.query() {
        url.set_query(Some(query));
    }

    url
}

/// Append the caller, then each local address, after any existing values.
pub fn append_forwarded_for(headers: &mut HeaderMap, client: IpAddr, local_ips: &[Ipv4Addr]) {
    let chain = std::iter::once(client).chain(local_ips.iter().copied().map(IpAddr::V4));
    for ip in chain {
        if let Ok(value) = HeaderValue::try_from(ip.to_string()) {
            headers.append(X_FORWARDED_FOR, value);
        }
    }
}

/// Copy the backend's status and headers, then stream its body through.
///
/// Errors in the body stream surface after the status line has gone out, so
/// they can only abort the connection.
fn relay(response: reqwest::Response, backend: String) -> Response {
    let status = response.status();
    let headers = response.headers().clone();

    let body = response.bytes_stream().map_err(move |e| {
        let err = ProxyError::Relay(e.to_string());
        warn!(
            backend = %backend,
            reason = err.reason_code(),
            error = %err,
            "Response relay aborted"
        );
        err
    });

    let mut relayed = Response::new(Body::from_stream(body));
    *relayed.status_mut() = status;
    *relayed.headers_mut() = headers;
    relayed
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tokio::net::TcpListener;

    fn forwarder(default_timeout: Duration) -> Forwarder {
        Forwarder::new(ForwarderConfig {
            default_timeout,
            max_body_bytes: 1024,
        })
        .unwrap()
    }

    #[rstest]
    #[case("http://localhost:8081/backend", "/hello", "http://localhost:8081/backend/hello")]
    #[case("http://localhost:8081/backend/", "/hello", "http://localhost:8081/backend/hello")]
    #[case("http://localhost:8081", "/hello", "http://localhost:8081/hello")]
    #[case("http://localhost:8081/", "/", "http://localhost:8081/")]
    #[case("http://localhost:8081/backend", "/a/b?x=1&y=2", "http://localhost:8081/backend/a/b?x=1&y=2")]
    #[case("http://localhost:8081/backend?k=v", "/hello", "http://localhost:8081/backend/hello?k=v")]
    #[case("http://localhost:8081/backend?k=v", "/hello?x=1", "http://localhost:8081/backend/hello?x=1")]
    #[case("http://localhost:8081/api", "/caf%C3%A9", "http://localhost:8081/api/caf%C3%A9")]
    fn test_target_url(#[case] base: &str, #[case] inbound: &str, #[case] expected: &str) {
        let base = Url::parse(base).unwrap();
        let uri: Uri = inbound.parse().unwrap();
        assert_eq!(target_url(&base, &uri).as_str(), expected);
    }

    #[test]
    fn test_forwarded_for_appends_after_existing() {
        let mut headers = HeaderMap::new();
        headers.append(X_FORWARDED_FOR, HeaderValue::from_static("203.0.113.7"));

        append_forwarded_for(
            &mut headers,
            "198.51.100.2".parse().unwrap(),
            &["10.0.0.5".parse().unwrap(), "192.168.1.4".parse().unwrap()],
        );

        let values: Vec<_> = headers
            .get_all(X_FORWARDED_FOR)
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(
            values,
            vec!["203.0.113.7", "198.51.100.2", "10.0.0.5", "192.168.1.4"]
        );
    }

    #[tokio::test]
    async fn test_clone_request_rewrites() {
        let forwarder = forwarder(DEFAULT_FORWARD_TIMEOUT);
        let backend = Backend::new("http://10.0.0.1:8081/backend", None).unwrap();

        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/hello?name=x")
            .header("host", "localhost:8080")
            .header("content-length", "7")
            .header("x-custom", "kept")
            .body(Body::from("payload"))
            .unwrap();
        let peer: SocketAddr = "127.0.0.1:54321".parse().unwrap();

        let outbound = forwarder
            .clone_request(request, peer, &backend)
            .await
            .unwrap();

        assert_eq!(outbound.method, Method::POST);
        assert_eq!(
            outbound.url.as_str(),
            "http://10.0.0.1:8081/backend/hello?name=x"
        );
        assert_eq!(outbound.body, Bytes::from_static(b"payload"));
        assert!(outbound.headers.get(HOST).is_none());
        assert!(outbound.headers.get(CONTENT_LENGTH).is_none());
        assert_eq!(outbound.headers.get("x-custom").unwrap(), "kept");

        let chain: Vec<String> = outbound
            .headers
            .get_all(X_FORWARDED_FOR)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        let mut expected = vec!["127.0.0.1".to_string()];
        expected.extend(local_ipv4_addrs().unwrap().iter().map(|ip| ip.to_string()));
        assert_eq!(chain, expected);
    }

    #[tokio::test]
    async fn test_clone_request_maps_v4_in_v6_peer() {
        let forwarder = forwarder(DEFAULT_FORWARD_TIMEOUT);
        let backend = Backend::new("http://10.0.0.1:8081", None).unwrap();
        let request = axum::http::Request::builder().uri("/").body(Body::empty()).unwrap();
        let peer: SocketAddr = "[::ffff:192.0.2.10]:4000".parse().unwrap();

        let outbound = forwarder
            .clone_request(request, peer, &backend)
            .await
            .unwrap();

        let first = outbound.headers.get(X_FORWARDED_FOR).unwrap();
        assert_eq!(first, "192.0.2.10");
    }

    #[tokio::test]
    async fn test_body_too_large() {
        let forwarder = forwarder(DEFAULT_FORWARD_TIMEOUT);
        let backend = Backend::new("http://10.0.0.1:8081", None).unwrap();
        let request = axum::http::Request::builder()
            .method("PUT")
            .uri("/upload")
            .body(Body::from(vec![0u8; 4096]))
            .unwrap();

        let err = forwarder
            .clone_request(request, "127.0.0.1:1".parse().unwrap(), &backend)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Clone(_)));
    }

    #[tokio::test]
    async fn test_silent_backend_times_out() {
        // Accept connections but never answer
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let forwarder = forwarder(DEFAULT_FORWARD_TIMEOUT);
        let backend = Backend::new(&format!("http://{addr}"), None).unwrap();
        let request = axum::http::Request::builder().uri("/slow").body(Body::empty()).unwrap();

        let started = Instant::now();
        let err = forwarder
            .forward(
                request,
                "127.0.0.1:50000".parse().unwrap(),
                &backend,
                Duration::from_millis(200),
            )
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(err.is_timeout(), "Expected timeout, got {:?}", err);
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_secs(2), "took {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_unreachable_backend() {
        // Reserve a port, then close it
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let forwarder = forwarder(DEFAULT_FORWARD_TIMEOUT);
        let backend = Backend::new(&format!("http://{addr}"), None).unwrap();
        let request = axum::http::Request::builder().uri("/").body(Body::empty()).unwrap();

        let err = forwarder
            .forward(
                request,
                "127.0.0.1:50000".parse().unwrap(),
                &backend,
                Duration::from_secs(2),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ProxyError::Forward { .. }));
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_deadline_for_rule() {
        use crate::proxy::router::{MatchPredicate, RuleTimeout};

        let forwarder = forwarder(Duration::from_secs(10));
        let mut rule = Rule::new(
            "rule1",
            vec![MatchPredicate::prefix("/")],
            Vec::new(),
            RuleTimeout::default(),
        )
        .unwrap();
        assert_eq!(forwarder.deadline_for(&rule), Duration::from_secs(10));

        rule.timeout.backend_request_timeout = Some(Duration::from_millis(250));
        assert_eq!(forwarder.deadline_for(&rule), Duration::from_millis(250));
    }
}
