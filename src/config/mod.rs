//! Dynamic configuration — the wire objects providers load
//!
//! Routes, upstreams and middleware groups arrive as JSON arrays. The
//! structs here keep deep value equality so the reload loop can diff a
//! freshly-loaded set against the last accepted one: reordering equal
//! items is a no-op, anything else becomes adds (including changed items)
//! and dels.

pub mod boot;
pub mod duration;

pub use boot::BootConfig;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// A named middleware with its opaque config document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiddlewareConf {
    pub name: String,
    #[serde(default)]
    pub conf: Value,
}

/// One predicate set; the fields present AND together.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MatcherConfig {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub path_prefixes: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub queries: HashMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub client_ips: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub server_ips: Vec<String>,
}

/// A route wire object. Multiple matchers OR together.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouteConfig {
    pub id: String,
    pub upstream: String,
    pub priority: i32,
    pub protect: bool,
    #[serde(with = "duration::opt", skip_serializing_if = "Option::is_none")]
    pub request_timeout: Option<Duration>,
    #[serde(with = "duration::opt", skip_serializing_if = "Option::is_none")]
    pub forward_timeout: Option<Duration>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub matchers: Vec<MatcherConfig>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub middlewares: Vec<MiddlewareConf>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub middleware_groups: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// Retry policy: `number < 0` disables retrying entirely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub number: i32,
    #[serde(with = "duration::opt", skip_serializing_if = "Option::is_none")]
    pub interval: Option<Duration>,
}

/// A static backend server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub weight: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 0,
            weight: 1,
        }
    }
}

/// The probe template of a health check; scheme "tcp" probes with a
/// TCP connect instead of an HTTP request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckRequest {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub scheme: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub method: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub host: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub disable: bool,
    pub failure: u32,
    #[serde(with = "duration")]
    pub timeout: Duration,
    #[serde(with = "duration")]
    pub interval: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<HealthCheckRequest>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            disable: false,
            failure: 1,
            timeout: Duration::from_secs(1),
            interval: Duration::from_secs(10),
            request: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StaticDiscoveryConfig {
    pub servers: Vec<ServerConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(rename = "static", skip_serializing_if = "Option::is_none")]
    pub static_discovery: Option<StaticDiscoveryConfig>,
}

/// An upstream wire object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpstreamConfig {
    pub id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub scheme: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub host: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub policy: String,
    #[serde(with = "duration::opt", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    pub retry: RetryConfig,
    pub discovery: DiscoveryConfig,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub middlewares: Vec<MiddlewareConf>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub middleware_group: String,
}

/// A middleware group wire object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MiddlewareGroupConfig {
    pub name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub middlewares: Vec<MiddlewareConf>,
}

// ----------------------------------------------------------------------- //
// Diffing

fn diff_by_key<T: Clone + PartialEq>(
    news: &[T],
    olds: &[T],
    key: impl Fn(&T) -> &str,
) -> (Vec<T>, Vec<T>) {
    let mut adds = Vec::new();
    let mut dels = Vec::new();

    for item in news {
        match olds.iter().find(|old| key(old) == key(item)) {
            Some(old) if old == item => {}
            _ => adds.push(item.clone()),
        }
    }

    for old in olds {
        if !news.iter().any(|item| key(item) == key(old)) {
            dels.push(old.clone());
        }
    }

    (adds, dels)
}

/// Compare new and old routes by id and deep equality.
///
/// `adds` also contains existing-but-changed routes; reordering equal
/// items yields empty results.
pub fn diff_routes(news: &[RouteConfig], olds: &[RouteConfig]) -> (Vec<RouteConfig>, Vec<RouteConfig>) {
    diff_by_key(news, olds, |r| r.id.as_str())
}

/// Compare new and old upstreams by id and deep equality.
pub fn diff_upstreams(
    news: &[UpstreamConfig],
    olds: &[UpstreamConfig],
) -> (Vec<UpstreamConfig>, Vec<UpstreamConfig>) {
    diff_by_key(news, olds, |u| u.id.as_str())
}

/// Compare new and old middleware groups by name and deep equality.
pub fn diff_groups(
    news: &[MiddlewareGroupConfig],
    olds: &[MiddlewareGroupConfig],
) -> (Vec<MiddlewareGroupConfig>, Vec<MiddlewareGroupConfig>) {
    diff_by_key(news, olds, |g| g.name.as_str())
}
