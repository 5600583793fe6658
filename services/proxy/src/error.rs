//! Error types for the proxy.
//!
//! `ProxyError` covers everything that can go wrong while handling one
//! request. Every variant is terminal for that request: nothing is retried
//! and nothing propagates past the response write.

use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Request-path errors with standardized reason codes.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// No registered route owns the request's hostname.
    #[error("no route registered for host '{host}'")]
    NoHostMatch { host: String },

    /// The hostname is owned, but no rule's predicates matched.
    #[error("no rule matched host '{host}' path '{path}'")]
    NoRuleMatch { host: String, path: String },

    /// The matched rule has an empty backend list.
    #[error("rule '{rule}' on host '{hostname}' has no backends")]
    NoBackends { hostname: String, rule: String },

    /// The outbound request could not be built.
    #[error("{0}")]
    Clone(String),

    /// The backend could not be reached or did not answer in time.
    #[error("backend {backend}: {source}")]
    Forward {
        backend: String,
        timed_out: bool,
        #[source]
        source: reqwest::Error,
    },

    /// The response body broke after the status line was sent.
    #[error("{0}")]
    Relay(String),
}

impl ProxyError {
    /// Build a forward error from a client error, keeping the timeout class.
    pub fn forward(backend: impl Into<String>, source: reqwest::Error) -> Self {
        ProxyError::Forward {
            backend: backend.into(),
            timed_out: source.is_timeout(),
            source,
        }
    }

    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ProxyError::NoHostMatch { .. } => "no_host_match",
            ProxyError::NoRuleMatch { .. } => "no_rule_match",
            ProxyError::NoBackends { .. } => "no_backends",
            ProxyError::Clone(_) => "clone_failed",
            ProxyError::Forward { .. } => "forward_failed",
            ProxyError::Relay(_) => "relay_failed",
        }
    }

    /// Status code surfaced to the caller.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::NoHostMatch { .. }
            | ProxyError::NoRuleMatch { .. }
            | ProxyError::NoBackends { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Clone(_) | ProxyError::Forward { .. } | ProxyError::Relay(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Whether the outbound call was cut off by its deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProxyError::Forward { timed_out: true, .. })
    }

    fn body(&self) -> String {
        match self {
            ProxyError::NoHostMatch { .. }
            | ProxyError::NoRuleMatch { .. }
            | ProxyError::NoBackends { .. } => format!("No backend available: {self}\n"),
            ProxyError::Clone(_) => format!("Failed to clone request: {self}\n"),
            ProxyError::Forward { .. } => format!("Failed to forward request: {self}\n"),
            ProxyError::Relay(_) => format!("Failed to copy response body: {self}\n"),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let mut response = (self.status_code(), self.body()).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }
}

/// Errors raised while building routes, rules, and backends.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteConfigError {
    #[error("backend address '{address}' is invalid: {detail}")]
    InvalidBackendAddress { address: String, detail: String },

    #[error("route '{0}' lists no hostnames")]
    NoHostnames(String),

    #[error("rule '{0}' has no match predicates")]
    NoMatches(String),

    #[error("invalid header name '{0}'")]
    InvalidHeaderName(String),

    #[error("{0} name must not be empty")]
    EmptyName(&'static str),

    #[error("invalid duration '{value}': {detail}")]
    InvalidDuration { value: String, detail: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_errors_are_service_unavailable() {
        let errors = [
            ProxyError::NoHostMatch {
                host: "example.com".to_string(),
            },
            ProxyError::NoRuleMatch {
                host: "localhost".to_string(),
                path: "/nope".to_string(),
            },
            ProxyError::NoBackends {
                hostname: "localhost".to_string(),
                rule: "rule1".to_string(),
            },
        ];

        for err in errors {
            assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
            assert!(!err.is_timeout());
        }
    }

    #[test]
    fn clone_error_is_internal() {
        let err = ProxyError::Clone("body too large".to_string());
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.reason_code(), "clone_failed");
    }

    #[test]
    fn error_response_is_plain_text() {
        let response = ProxyError::NoHostMatch {
            host: "example.com".to_string(),
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
    }
}
