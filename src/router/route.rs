//! Route — a compiled mapping from matcher to upstream plus middlewares

use crate::config::{MatcherConfig, RouteConfig};
use crate::context::Context;
use crate::error::{GatewayError, Result};
use crate::matcher::Matcher;
use crate::middleware::{Middleware, Registry};
use crate::responder::{Responder, StdResponse};
use std::sync::Arc;

/// A runtime route, immutable once placed in a router snapshot.
pub struct Route {
    pub config: RouteConfig,
    /// Configured priority plus the matcher priority. Bigger wins.
    pub priority: i64,
    pub(crate) matcher: Matcher,
    pub(crate) middlewares: Vec<Arc<dyn Middleware>>,
    pub(crate) responder: Arc<dyn Responder>,
}

impl Route {
    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn upstream_id(&self) -> &str {
        &self.config.upstream
    }

    pub fn matches(&self, ctx: &Context) -> bool {
        self.matcher.matches(ctx)
    }
}

/// Compile one predicate set; the present fields AND together.
fn build_matcher_one(m: &MatcherConfig) -> Result<Matcher> {
    let mut ms = Vec::with_capacity(4);

    if let Some(matcher) = Matcher::host(&m.hosts) {
        ms.push(matcher);
    }
    if let Some(matcher) = Matcher::method(&m.methods)? {
        ms.push(matcher);
    }
    if let Some(matcher) = Matcher::headers(&m.headers) {
        ms.push(matcher);
    }
    if let Some(matcher) = Matcher::queries(&m.queries) {
        ms.push(matcher);
    }
    if let Some(matcher) = Matcher::path_prefix(&m.path_prefixes) {
        ms.push(matcher);
    }
    if let Some(matcher) = Matcher::path(&m.paths) {
        ms.push(matcher);
    }
    if let Some(matcher) = Matcher::client_ip(&m.client_ips)? {
        ms.push(matcher);
    }
    if let Some(matcher) = Matcher::server_ip(&m.server_ips)? {
        ms.push(matcher);
    }

    if ms.is_empty() {
        return Err(GatewayError::Matcher(
            "matcher exists, but has no matching items".into(),
        ));
    }
    Ok(Matcher::and(ms))
}

/// Compile the matcher set of a route; multiple entries OR together.
pub fn build_matcher(matchers: &[MatcherConfig]) -> Result<Matcher> {
    if matchers.is_empty() {
        return Err(GatewayError::Matcher("no route matcher".into()));
    }
    let mut ms = Vec::with_capacity(matchers.len());
    for m in matchers {
        ms.push(build_matcher_one(m)?);
    }
    Ok(Matcher::or(ms))
}

/// Build a runtime route from its wire config.
pub fn build_route(config: RouteConfig, registry: &Registry) -> Result<Route> {
    if config.id.is_empty() {
        return Err(GatewayError::Config("missing route id".into()));
    }
    if config.upstream.is_empty() {
        return Err(GatewayError::Config(format!(
            "route '{}' has no upstream",
            config.id
        )));
    }

    let matcher = build_matcher(&config.matchers)
        .map_err(|e| GatewayError::Config(format!("route '{}': {}", config.id, e)))?;

    let middlewares = registry
        .build_all(&config.middlewares)
        .map_err(|e| GatewayError::Config(format!("route '{}': {}", config.id, e)))?;

    let priority = config.priority as i64 + matcher.priority();

    Ok(Route {
        config,
        priority,
        matcher,
        middlewares,
        responder: Arc::new(StdResponse),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MiddlewareConf;
    use std::collections::HashMap;

    fn registry() -> Registry {
        use crate::context::ContextPool;
        use crate::middleware::{GroupManager, RegistryDeps};
        use crate::upstream::UpstreamManager;
        Registry::with_builtins(RegistryDeps {
            upstreams: Arc::new(UpstreamManager::new()),
            groups: Arc::new(GroupManager::new()),
            pool: Arc::new(ContextPool::new()),
        })
    }

    fn base_config() -> RouteConfig {
        RouteConfig {
            id: "r1".into(),
            upstream: "u1".into(),
            matchers: vec![MatcherConfig {
                paths: vec!["/a".into()],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_build_route() {
        let route = build_route(base_config(), &registry()).unwrap();
        assert_eq!(route.id(), "r1");
        assert_eq!(route.upstream_id(), "u1");
        // 0 + path priority 500*2
        assert_eq!(route.priority, 1000);
    }

    #[test]
    fn test_total_priority_adds_configured() {
        let mut cfg = base_config();
        cfg.priority = 7;
        let route = build_route(cfg, &registry()).unwrap();
        assert_eq!(route.priority, 1007);
    }

    #[test]
    fn test_missing_id_rejected() {
        let mut cfg = base_config();
        cfg.id = String::new();
        assert!(build_route(cfg, &registry()).is_err());
    }

    #[test]
    fn test_missing_upstream_rejected() {
        let mut cfg = base_config();
        cfg.upstream = String::new();
        assert!(build_route(cfg, &registry()).is_err());
    }

    #[test]
    fn test_empty_matchers_rejected() {
        let mut cfg = base_config();
        cfg.matchers = vec![];
        assert!(build_route(cfg, &registry()).is_err());

        let mut cfg = base_config();
        cfg.matchers = vec![MatcherConfig::default()];
        assert!(build_route(cfg, &registry()).is_err());
    }

    #[test]
    fn test_bad_cidr_propagates() {
        let mut cfg = base_config();
        cfg.matchers[0].client_ips = vec!["bad/cidr".into()];
        assert!(build_route(cfg, &registry()).is_err());
    }

    #[test]
    fn test_unknown_middleware_propagates() {
        let mut cfg = base_config();
        cfg.middlewares = vec![MiddlewareConf {
            name: "nosuch".into(),
            conf: serde_json::Value::Null,
        }];
        let err = match build_route(cfg, &registry()) {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(err.to_string().contains("unknown middleware"));
    }

    #[test]
    fn test_matchers_or_together() {
        let mut cfg = base_config();
        cfg.matchers = vec![
            MatcherConfig {
                paths: vec!["/a".into()],
                ..Default::default()
            },
            MatcherConfig {
                methods: vec!["POST".into()],
                headers: HashMap::from([("X-K".into(), "v".into())]),
                ..Default::default()
            },
        ];
        let route = build_route(cfg, &registry()).unwrap();

        let mut ctx = Context::new();
        ctx.client_request.method = http::Method::GET;
        ctx.client_request.uri = "/a".parse().unwrap();
        assert!(route.matches(&ctx));

        let mut ctx2 = Context::new();
        ctx2.client_request.method = http::Method::POST;
        ctx2.client_request.uri = "/other".parse().unwrap();
        ctx2.client_request
            .headers
            .insert("x-k", "v".parse().unwrap());
        assert!(route.matches(&ctx2));

        let mut ctx3 = Context::new();
        ctx3.client_request.method = http::Method::POST;
        ctx3.client_request.uri = "/other".parse().unwrap();
        assert!(!route.matches(&ctx3));
    }
}
