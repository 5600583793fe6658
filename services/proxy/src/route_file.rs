//! Route file loading.
//!
//! Routes are declared in a YAML (or JSON, by `.json` extension) file and
//! converted into the immutable route model at startup:
//!
//! ```yaml
//! routes:
//!   - name: r1
//!     hostnames: [localhost]
//!     rules:
//!       - name: rule1
//!         matches:
//!           - path: /hello
//!             headers: { x-env: canary }
//!         backendRefs:
//!           - address: http://localhost:8081/backend
//!         timeout:
//!           backendRequestTimeout: 1500ms
//! ```
//!
//! A file holding a single route object (no `routes:` list) is accepted too.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

use crate::error::RouteConfigError;
use crate::proxy::{Backend, MatchPredicate, Route, Rule, RuleTimeout};

/// Serialization format of a route file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteFileFormat {
    Yaml,
    Json,
}

impl RouteFileFormat {
    /// Pick the format from a file extension. Anything but `.json` is YAML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Yaml,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RouteFileSpec {
    Many { routes: Vec<RouteSpec> },
    Single(RouteSpec),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    pub name: String,
    #[serde(default)]
    pub hostnames: Vec<String>,
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSpec {
    /// Defaults to `rule-<index>` within the route.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub matches: Vec<MatchSpec>,
    #[serde(default)]
    pub backend_refs: Vec<BackendSpec>,
    #[serde(default)]
    pub timeout: Option<TimeoutSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchSpec {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendSpec {
    #[serde(default)]
    pub name: Option<String>,
    pub address: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutSpec {
    #[serde(default)]
    pub request_timeout: Option<String>,
    #[serde(default)]
    pub backend_request_timeout: Option<String>,
}

impl RouteSpec {
    /// Convert into a validated route.
    pub fn into_route(self) -> Result<Route, RouteConfigError> {
        let rules = self
            .rules
            .into_iter()
            .enumerate()
            .map(|(idx, rule)| rule.into_rule(idx))
            .collect::<Result<Vec<_>, _>>()?;

        Route::new(self.name, self.hostnames, rules)
    }
}

impl RuleSpec {
    fn into_rule(self, idx: usize) -> Result<Rule, RouteConfigError> {
        let name = self
            .name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("rule-{idx}"));

        let matches = self
            .matches
            .into_iter()
            .map(|m| MatchPredicate::new(m.path, m.headers))
            .collect::<Result<Vec<_>, _>>()?;

        let backends = self
            .backend_refs
            .into_iter()
            .map(|b| Backend::new(&b.address, b.name.as_deref()))
            .collect::<Result<Vec<_>, _>>()?;

        let timeout = match self.timeout {
            Some(t) => RuleTimeout {
                request_timeout: t.request_timeout.as_deref().map(parse_duration).transpose()?,
                backend_request_timeout: t
                    .backend_request_timeout
                    .as_deref()
                    .map(parse_duration)
                    .transpose()?,
            },
            None => RuleTimeout::default(),
        };

        Rule::new(name, matches, backends, timeout)
    }
}

/// Load and validate the routes in `path`.
pub fn load_routes(path: &Path) -> Result<Vec<Route>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read route file: {}", path.display()))?;

    let routes = parse_routes(&content, RouteFileFormat::from_path(path))
        .with_context(|| format!("Failed to load route file: {}", path.display()))?;

    info!(
        path = %path.display(),
        route_count = routes.len(),
        "Loaded routes"
    );

    Ok(routes)
}

/// Parse and validate routes from file content.
pub fn parse_routes(content: &str, format: RouteFileFormat) -> Result<Vec<Route>> {
    let file: RouteFileSpec = match format {
        RouteFileFormat::Json => serde_json::from_str(content).context("Invalid JSON")?,
        RouteFileFormat::Yaml => serde_yaml_ng::from_str(content).context("Invalid YAML")?,
    };

    let specs = match file {
        RouteFileSpec::Many { routes } => routes,
        RouteFileSpec::Single(route) => vec![route],
    };

    specs
        .into_iter()
        .map(|spec| {
            let name = spec.name.clone();
            spec.into_route()
                .with_context(|| format!("Invalid route '{name}'"))
        })
        .collect()
}

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Parse a duration such as `300ms`, `1.5s`, or `1h2m`.
///
/// Accepts a sequence of decimal numbers, each with an optional fraction and
/// a unit of `ns`, `us` (or `µs`), `ms`, `s`, `m`, or `h`. A bare `0` is
/// allowed. Negative durations are rejected.
pub fn parse_duration(value: &str) -> Result<Duration, RouteConfigError> {
    let invalid = |detail: &str| RouteConfigError::InvalidDuration {
        value: value.to_string(),
        detail: detail.to_string(),
    };

    let s = value.trim();
    let s = s.strip_prefix('+').unwrap_or(s);
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err(invalid("empty duration"));
    }
    if s.starts_with('-') {
        return Err(invalid("negative durations are not allowed"));
    }

    let mut total: u128 = 0;
    let mut rest = s;
    while !rest.is_empty() {
        let int_len = rest.bytes().take_while(u8::is_ascii_digit).count();
        let (int_part, after) = rest.split_at(int_len);

        let (frac_part, after) = match after.strip_prefix('.') {
            Some(f) => f.split_at(f.bytes().take_while(u8::is_ascii_digit).count()),
            None => ("", after),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid("expected a number"));
        }

        let unit_len = after
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(after.len());
        let (unit, after) = after.split_at(unit_len);

        let unit_nanos: u128 = match unit {
            "ns" => 1,
            "us" | "µs" | "μs" => 1_000,
            "ms" => 1_000_000,
            "s" => NANOS_PER_SEC,
            "m" => 60 * NANOS_PER_SEC,
            "h" => 3_600 * NANOS_PER_SEC,
            "" => return Err(invalid("missing unit")),
            other => return Err(invalid(&format!("unknown unit '{other}'"))),
        };

        let whole: u128 = if int_part.is_empty() {
            0
        } else {
            int_part.parse().map_err(|_| invalid("number out of range"))?
        };
        let mut nanos = whole
            .checked_mul(unit_nanos)
            .ok_or_else(|| invalid("duration out of range"))?;

        if !frac_part.is_empty() {
            let digits = &frac_part[..frac_part.len().min(18)];
            let frac: u128 = digits.parse().map_err(|_| invalid("invalid fraction"))?;
            nanos = nanos
                .checked_add(frac * unit_nanos / 10u128.pow(digits.len() as u32))
                .ok_or_else(|| invalid("duration out of range"))?;
        }

        total = total
            .checked_add(nanos)
            .ok_or_else(|| invalid("duration out of range"))?;
        rest = after;
    }

    let secs = u64::try_from(total / NANOS_PER_SEC).map_err(|_| invalid("duration out of range"))?;
    Ok(Duration::new(secs, (total % NANOS_PER_SEC) as u32))
}
