//! Matcher engine — composable route predicates with priorities
//!
//! A matcher is a pure predicate tree over the request context: leaf kinds
//! for method, path, path prefix, host, headers, queries and client/server
//! IP CIDRs, combined with AND/OR. Every node exposes a priority; AND sums
//! its children, OR takes the maximum. Compilation errors (bad CIDR)
//! surface at build time; matching itself is infallible.

use crate::context::Context;
use crate::error::{GatewayError, Result};
use http::Method;
use ipnet::IpNet;
use std::collections::HashMap;
use std::net::IpAddr;

const PRIORITY_HOST: i64 = 5000;
const PRIORITY_PATH: i64 = 500;
const PRIORITY_PATH_PREFIX: i64 = 50;
const PRIORITY_METHOD: i64 = 40;
const PRIORITY_IP: i64 = 20;
const PRIORITY_HEADER: i64 = 4;
const PRIORITY_QUERY: i64 = 1;

/// A set of parsed CIDRs with an infallible containment check.
#[derive(Debug, Clone)]
pub struct IpCheckers {
    nets: Vec<IpNet>,
}

impl IpCheckers {
    /// Parse a list of CIDRs (a bare IP is treated as a /32 or /128).
    pub fn new<S: AsRef<str>>(cidrs: &[S]) -> Result<Self> {
        let mut nets = Vec::with_capacity(cidrs.len());
        for cidr in cidrs {
            let s = cidr.as_ref();
            let net = s
                .parse::<IpNet>()
                .or_else(|_| s.parse::<IpAddr>().map(IpNet::from))
                .map_err(|_| GatewayError::Matcher(format!("invalid CIDR '{}'", s)))?;
            nets.push(net);
        }
        Ok(Self { nets })
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        self.nets.iter().any(|net| net.contains(&addr))
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }
}

/// A host pattern: exact, `*.suffix` wildcard, or bare `*`.
#[derive(Debug, Clone)]
enum HostPattern {
    Any,
    Suffix(String),
    Exact(String),
}

impl HostPattern {
    fn parse(host: &str) -> (Self, usize) {
        let host = host.to_ascii_lowercase();
        let len = host.len();
        let pattern = if host == "*" {
            HostPattern::Any
        } else if let Some(suffix) = host.strip_prefix('*') {
            HostPattern::Suffix(suffix.to_string())
        } else {
            HostPattern::Exact(host)
        };
        (pattern, len)
    }

    fn matches(&self, host: &str) -> bool {
        match self {
            HostPattern::Any => true,
            HostPattern::Suffix(suffix) => host.ends_with(suffix.as_str()),
            HostPattern::Exact(exact) => host == exact,
        }
    }
}

/// Trim a single trailing '/' unless the path is exactly "/".
fn normalize_path(path: &str) -> &str {
    if path.len() > 1 {
        path.strip_suffix('/').unwrap_or(path)
    } else {
        path
    }
}

/// A composable route predicate.
#[derive(Debug, Clone)]
pub enum Matcher {
    Method(Vec<Method>),
    /// Normalised exact paths, with the priority-bearing longest length.
    Path { paths: Vec<String>, longest: usize },
    PathPrefix { prefixes: Vec<String>, longest: usize },
    Host { patterns: Vec<HostPatternEntry> },
    /// All keys must be present; a non-empty value must appear in the
    /// multi-value list for that key.
    Headers(Vec<(String, String)>),
    Queries(Vec<(String, String)>),
    ClientIp(IpCheckers),
    ServerIp(IpCheckers),
    And(Vec<Matcher>),
    Or(Vec<Matcher>),
    AlwaysTrue,
    AlwaysFalse,
}

/// A parsed host pattern together with the original pattern length.
#[derive(Debug, Clone)]
pub struct HostPatternEntry {
    pattern: HostPattern,
    len: usize,
}

impl Matcher {
    pub fn method<S: AsRef<str>>(methods: &[S]) -> Result<Option<Matcher>> {
        if methods.is_empty() {
            return Ok(None);
        }
        let mut ms = Vec::with_capacity(methods.len());
        for m in methods {
            let upper = m.as_ref().to_ascii_uppercase();
            let method = upper
                .parse::<Method>()
                .map_err(|_| GatewayError::Matcher(format!("invalid method '{}'", m.as_ref())))?;
            ms.push(method);
        }
        Ok(Some(Matcher::Method(ms)))
    }

    pub fn path<S: AsRef<str>>(paths: &[S]) -> Option<Matcher> {
        if paths.is_empty() {
            return None;
        }
        let paths: Vec<String> = paths
            .iter()
            .map(|p| normalize_path(p.as_ref()).to_string())
            .collect();
        let longest = paths.iter().map(String::len).max().unwrap_or(0);
        Some(Matcher::Path { paths, longest })
    }

    pub fn path_prefix<S: AsRef<str>>(prefixes: &[S]) -> Option<Matcher> {
        if prefixes.is_empty() {
            return None;
        }
        let prefixes: Vec<String> = prefixes
            .iter()
            .map(|p| normalize_path(p.as_ref()).to_string())
            .collect();
        let longest = prefixes.iter().map(String::len).max().unwrap_or(0);
        Some(Matcher::PathPrefix { prefixes, longest })
    }

    pub fn host<S: AsRef<str>>(hosts: &[S]) -> Option<Matcher> {
        if hosts.is_empty() {
            return None;
        }
        let patterns = hosts
            .iter()
            .map(|h| {
                let (pattern, len) = HostPattern::parse(h.as_ref());
                HostPatternEntry { pattern, len }
            })
            .collect();
        Some(Matcher::Host { patterns })
    }

    pub fn headers(headers: &HashMap<String, String>) -> Option<Matcher> {
        if headers.is_empty() {
            return None;
        }
        let pairs = headers
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
            .collect();
        Some(Matcher::Headers(pairs))
    }

    pub fn queries(queries: &HashMap<String, String>) -> Option<Matcher> {
        if queries.is_empty() {
            return None;
        }
        let pairs = queries.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        Some(Matcher::Queries(pairs))
    }

    pub fn client_ip<S: AsRef<str>>(cidrs: &[S]) -> Result<Option<Matcher>> {
        if cidrs.is_empty() {
            return Ok(None);
        }
        Ok(Some(Matcher::ClientIp(IpCheckers::new(cidrs)?)))
    }

    pub fn server_ip<S: AsRef<str>>(cidrs: &[S]) -> Result<Option<Matcher>> {
        if cidrs.is_empty() {
            return Ok(None);
        }
        Ok(Some(Matcher::ServerIp(IpCheckers::new(cidrs)?)))
    }

    /// AND over a set of matchers. With no children it matches nothing.
    pub fn and(ms: Vec<Matcher>) -> Matcher {
        if ms.is_empty() {
            Matcher::AlwaysFalse
        } else {
            Matcher::And(ms)
        }
    }

    /// OR over a set of matchers. With no children it matches anything.
    pub fn or(ms: Vec<Matcher>) -> Matcher {
        if ms.is_empty() {
            Matcher::AlwaysTrue
        } else {
            Matcher::Or(ms)
        }
    }

    /// The matcher priority. The bigger the value, the higher.
    pub fn priority(&self) -> i64 {
        match self {
            Matcher::Method(_) => PRIORITY_METHOD,
            Matcher::Path { longest, .. } => PRIORITY_PATH * (*longest as i64),
            Matcher::PathPrefix { longest, .. } => PRIORITY_PATH_PREFIX * (*longest as i64),
            Matcher::Host { patterns } => {
                let longest = patterns.iter().map(|p| p.len).max().unwrap_or(0);
                PRIORITY_HOST * (longest as i64)
            }
            Matcher::Headers(pairs) => PRIORITY_HEADER * (pairs.len() as i64),
            Matcher::Queries(pairs) => PRIORITY_QUERY * (pairs.len() as i64),
            Matcher::ClientIp(_) | Matcher::ServerIp(_) => PRIORITY_IP,
            Matcher::And(ms) => ms.iter().map(Matcher::priority).sum(),
            Matcher::Or(ms) => ms.iter().map(Matcher::priority).max().unwrap_or(0),
            Matcher::AlwaysTrue | Matcher::AlwaysFalse => 0,
        }
    }

    /// Check whether the request matches. Pure: no I/O, no mutation.
    pub fn matches(&self, ctx: &Context) -> bool {
        match self {
            Matcher::Method(methods) => methods.contains(&ctx.client_request.method),

            Matcher::Path { paths, .. } => {
                let path = normalize_path(ctx.client_request.path());
                paths.iter().any(|p| p == path)
            }

            Matcher::PathPrefix { prefixes, .. } => {
                let path = normalize_path(ctx.client_request.path());
                prefixes.iter().any(|p| path.starts_with(p.as_str()))
            }

            Matcher::Host { patterns } => {
                let host = ctx.client_request.host.to_ascii_lowercase();
                let host = host.split(':').next().unwrap_or(&host);
                patterns.iter().any(|p| p.pattern.matches(host))
            }

            Matcher::Headers(pairs) => pairs.iter().all(|(key, value)| {
                let mut values = ctx.client_request.headers.get_all(key).iter();
                if value.is_empty() {
                    values.next().is_some()
                } else {
                    values.any(|v| v.to_str().map(|v| v == value).unwrap_or(false))
                }
            }),

            Matcher::Queries(pairs) => pairs.iter().all(|(key, value)| {
                match ctx.queries().get(key) {
                    None => false,
                    Some(vs) => value.is_empty() || vs.iter().any(|v| v == value),
                }
            }),

            Matcher::ClientIp(checkers) => checkers.contains(ctx.client_ip()),
            Matcher::ServerIp(checkers) => checkers.contains(ctx.server_ip()),

            Matcher::And(ms) => ms.iter().all(|m| m.matches(ctx)),
            Matcher::Or(ms) => ms.iter().any(|m| m.matches(ctx)),
            Matcher::AlwaysTrue => true,
            Matcher::AlwaysFalse => false,
        }
    }
}
