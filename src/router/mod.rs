//! Router — priority-ordered route matching over an atomic snapshot
//!
//! The router holds two atomically-published views: a by-id map and a
//! sorted slice. Readers never lock; writers serialise on a mutex, mutate
//! a shadow map and publish clones. Protected routes sink to the end of
//! the sorted slice and the matching loop stops before reaching them.

mod route;

pub use route::{build_matcher, build_route, Route};

use crate::context::Context;
use crate::error::StatusError;
use crate::middleware::{run_chain, sort_middlewares, GroupManager, Handler, Middleware};
use crate::responder::{Responder, StdResponse};
use crate::upstream::{UpstreamForwarder, UpstreamManager};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use futures_util::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct Router {
    lock: Mutex<HashMap<String, Arc<Route>>>,
    by_id: ArcSwap<HashMap<String, Arc<Route>>>,
    sorted: ArcSwap<Vec<Arc<Route>>>,
    globals: ArcSwap<Vec<Arc<dyn Middleware>>>,
    groups: Arc<GroupManager>,
    forwarder: UpstreamForwarder,
    default_responder: Arc<dyn Responder>,
}

impl Router {
    pub fn new(upstreams: Arc<UpstreamManager>, groups: Arc<GroupManager>) -> Self {
        Self {
            lock: Mutex::new(HashMap::new()),
            by_id: ArcSwap::from_pointee(HashMap::new()),
            sorted: ArcSwap::from_pointee(Vec::new()),
            globals: ArcSwap::from_pointee(Vec::new()),
            groups: groups.clone(),
            forwarder: UpstreamForwarder { upstreams, groups },
            default_responder: Arc::new(StdResponse),
        }
    }

    /// Append a gateway-global middleware wrapping every request,
    /// including the no-match and responder paths. Install before serving.
    pub fn use_middleware(&self, mw: Arc<dyn Middleware>) {
        let mut globals: Vec<Arc<dyn Middleware>> = self.globals.load().as_ref().clone();
        globals.push(mw);
        sort_middlewares(&mut globals);
        self.globals.store(Arc::new(globals));
    }

    /// Add the routes; existing ids are updated.
    pub fn add_routes(&self, routes: Vec<Route>) {
        if routes.is_empty() {
            return;
        }
        let mut shadow = self.lock.lock().expect("router lock poisoned");
        for route in routes {
            tracing::info!(route = route.id(), priority = route.priority, "add or update the http route");
            shadow.insert(route.id().to_string(), Arc::new(route));
        }
        self.publish(&shadow);
    }

    /// Delete the routes by id; missing ids are ignored.
    pub fn del_routes(&self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        let mut shadow = self.lock.lock().expect("router lock poisoned");
        let mut changed = false;
        for id in ids {
            if shadow.remove(id).is_some() {
                tracing::info!(route = %id, "delete the http route");
                changed = true;
            }
        }
        if changed {
            self.publish(&shadow);
        }
    }

    pub fn get_route(&self, id: &str) -> Option<Arc<Route>> {
        self.by_id.load().get(id).cloned()
    }

    /// The priority-sorted route snapshot, read-only.
    pub fn routes(&self) -> Arc<Vec<Arc<Route>>> {
        self.sorted.load_full()
    }

    fn publish(&self, shadow: &HashMap<String, Arc<Route>>) {
        let mut sorted: Vec<Arc<Route>> = shadow.values().cloned().collect();
        sorted.sort_by(|a, b| {
            a.config
                .protect
                .cmp(&b.config.protect)
                .then_with(|| b.priority.cmp(&a.priority))
                .then_with(|| a.config.id.cmp(&b.config.id))
        });
        self.sorted.store(Arc::new(sorted));
        self.by_id.store(Arc::new(shadow.clone()));
    }

    /// Serve one request: the global middlewares wrap the whole
    /// match-serve-respond path.
    pub async fn serve(&self, ctx: &mut Context) {
        let globals = self.globals.load_full();
        let inner = ServeRoute { router: self };
        run_chain(&globals, &inner, ctx).await;
    }

    async fn serve_route(&self, ctx: &mut Context) {
        let routes = self.sorted.load_full();

        let mut chosen: Option<Arc<Route>> = None;
        for route in routes.iter() {
            // Protected routes sort to the end; nothing beyond them matches.
            if route.config.protect {
                break;
            }
            if route.matches(ctx) {
                chosen = Some(route.clone());
                break;
            }
        }

        match chosen {
            None => ctx.error = Some(StatusError::not_found()),
            Some(route) => self.handle_route(ctx, &route).await,
        }

        if !ctx.client_response.wrote_header() {
            let responder = ctx
                .responder
                .clone()
                .unwrap_or_else(|| self.default_responder.clone());
            responder.respond(ctx).await;
        }

        // Drop any unconsumed upstream response body.
        ctx.upstream_response = None;
    }

    async fn handle_route(&self, ctx: &mut Context, route: &Arc<Route>) {
        ctx.route_id.clone_from(&route.config.id);
        ctx.upstream_id.clone_from(&route.config.upstream);
        ctx.forward_timeout = route.config.forward_timeout;
        ctx.responder = Some(route.responder.clone());

        let mut chain = route.middlewares.clone();
        for name in &route.config.middleware_groups {
            match self.groups.get(name) {
                Some(group) => chain.extend(group.snapshot().iter().cloned()),
                None => {
                    ctx.abort(StatusError::internal_server_error().with_message(format!(
                        "not found the middleware group '{}'",
                        name
                    )));
                    return;
                }
            }
        }

        enum Outcome {
            Done,
            TimedOut,
            Panicked(Box<dyn std::any::Any + Send>),
        }

        let guarded = AssertUnwindSafe(run_chain(&chain, &self.forwarder, ctx)).catch_unwind();
        let outcome = match route.config.request_timeout {
            Some(t) if t > Duration::ZERO => match tokio::time::timeout(t, guarded).await {
                Ok(Ok(())) => Outcome::Done,
                Ok(Err(panic)) => Outcome::Panicked(panic),
                Err(_) => Outcome::TimedOut,
            },
            _ => match guarded.await {
                Ok(()) => Outcome::Done,
                Err(panic) => Outcome::Panicked(panic),
            },
        };

        match outcome {
            Outcome::Done => {}
            Outcome::TimedOut => {
                ctx.abort(StatusError::gateway_timeout().with_message("request timeout"));
            }
            Outcome::Panicked(payload) => {
                let msg = panic_message(payload);
                tracing::error!(route = route.id(), panic = %msg, "panic while handling the route");
                ctx.abort(StatusError::internal_server_error().with_message(format!("panic: {}", msg)));
            }
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct ServeRoute<'r> {
    router: &'r Router,
}

#[async_trait]
impl Handler for ServeRoute<'_> {
    async fn handle(&self, ctx: &mut Context) {
        self.router.serve_route(ctx).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MatcherConfig, RouteConfig};
    use crate::context::ContextPool;
    use crate::middleware::{Next, Registry, RegistryDeps};
    use http::StatusCode;

    fn deps() -> (Arc<UpstreamManager>, Arc<GroupManager>, Registry) {
        let upstreams = Arc::new(UpstreamManager::new());
        let groups = Arc::new(GroupManager::new());
        let registry = Registry::with_builtins(RegistryDeps {
            upstreams: upstreams.clone(),
            groups: groups.clone(),
            pool: Arc::new(ContextPool::new()),
        });
        (upstreams, groups, registry)
    }

    fn route_cfg(id: &str, path: &str, priority: i32) -> RouteConfig {
        RouteConfig {
            id: id.into(),
            upstream: "u1".into(),
            priority,
            matchers: vec![MatcherConfig {
                paths: vec![path.into()],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn ctx(method: &str, path: &str) -> Context {
        let mut c = Context::new();
        c.client_request.method = method.parse().unwrap();
        c.client_request.uri = path.parse().unwrap();
        c.client_request.host = "example.com".into();
        c.client_addr = "127.0.0.1:1000".parse().unwrap();
        c
    }

    #[test]
    fn test_add_get_del_routes() {
        let (upstreams, groups, registry) = deps();
        let router = Router::new(upstreams, groups);

        let route = build_route(route_cfg("r1", "/a", 0), &registry).unwrap();
        router.add_routes(vec![route]);
        assert!(router.get_route("r1").is_some());
        assert_eq!(router.routes().len(), 1);

        router.del_routes(&["r1".to_string()]);
        assert!(router.get_route("r1").is_none());
        assert!(router.routes().is_empty());
    }

    #[test]
    fn test_sorted_by_total_priority_desc() {
        let (upstreams, groups, registry) = deps();
        let router = Router::new(upstreams, groups);

        router.add_routes(vec![
            build_route(route_cfg("low", "/a", 0), &registry).unwrap(),
            build_route(route_cfg("high", "/a", 10), &registry).unwrap(),
        ]);
        let routes = router.routes();
        assert_eq!(routes[0].id(), "high");
        assert_eq!(routes[1].id(), "low");
    }

    #[test]
    fn test_equal_priority_ties_break_by_id() {
        let (upstreams, groups, registry) = deps();
        let router = Router::new(upstreams, groups);

        router.add_routes(vec![
            build_route(route_cfg("rb", "/a", 0), &registry).unwrap(),
            build_route(route_cfg("ra", "/a", 0), &registry).unwrap(),
        ]);
        let routes = router.routes();
        assert_eq!(routes[0].id(), "ra");
        assert_eq!(routes[1].id(), "rb");
    }

    #[test]
    fn test_protected_routes_sink_to_end() {
        let (upstreams, groups, registry) = deps();
        let router = Router::new(upstreams, groups);

        let mut protected = route_cfg("prot", "/a", 100);
        protected.protect = true;
        router.add_routes(vec![
            build_route(protected, &registry).unwrap(),
            build_route(route_cfg("pub", "/a", 0), &registry).unwrap(),
        ]);
        let routes = router.routes();
        assert_eq!(routes[0].id(), "pub");
        assert_eq!(routes[1].id(), "prot");
    }

    #[tokio::test]
    async fn test_no_match_is_404() {
        let (upstreams, groups, _registry) = deps();
        let router = Router::new(upstreams, groups);

        let mut c = ctx("GET", "/nowhere");
        router.serve(&mut c).await;
        assert_eq!(c.client_response.status_code(), StatusCode::NOT_FOUND);
        assert!(c.client_response.wrote_header());
    }

    #[tokio::test]
    async fn test_protected_route_never_matches_publicly() {
        let (upstreams, groups, registry) = deps();
        let router = Router::new(upstreams, groups);

        let mut protected = route_cfg("prot", "/a", 100);
        protected.protect = true;
        router.add_routes(vec![build_route(protected, &registry).unwrap()]);

        let mut c = ctx("GET", "/a");
        router.serve(&mut c).await;
        assert_eq!(c.client_response.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_missing_group_aborts_500() {
        let (upstreams, groups, registry) = deps();
        let router = Router::new(upstreams, groups);

        let mut cfg = route_cfg("r1", "/a", 0);
        cfg.middleware_groups = vec!["ghost".into()];
        router.add_routes(vec![build_route(cfg, &registry).unwrap()]);

        let mut c = ctx("GET", "/a");
        router.serve(&mut c).await;
        assert_eq!(
            c.client_response.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        let body = String::from_utf8_lossy(c.client_response.body()).to_string();
        assert!(body.contains("not found the middleware group 'ghost'"));
    }

    #[tokio::test]
    async fn test_missing_upstream_is_500() {
        let (upstreams, groups, registry) = deps();
        let router = Router::new(upstreams, groups);
        router.add_routes(vec![build_route(route_cfg("r1", "/a", 0), &registry).unwrap()]);

        let mut c = ctx("GET", "/a");
        router.serve(&mut c).await;
        assert_eq!(
            c.client_response.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    struct PanickingMiddleware;

    #[async_trait]
    impl Middleware for PanickingMiddleware {
        fn name(&self) -> &str {
            "panicking"
        }

        fn priority(&self) -> i32 {
            0
        }

        async fn handle(&self, _ctx: &mut Context, _next: Next<'_>) {
            panic!("boom");
        }
    }

    #[tokio::test]
    async fn test_panic_recovered_as_500() {
        let (upstreams, groups, registry) = deps();
        let router = Router::new(upstreams, groups.clone());

        groups.add("g1", vec![Arc::new(PanickingMiddleware)]);
        let mut cfg = route_cfg("r1", "/a", 0);
        cfg.middleware_groups = vec!["g1".into()];
        router.add_routes(vec![build_route(cfg, &registry).unwrap()]);

        let mut c = ctx("GET", "/a");
        router.serve(&mut c).await;
        assert_eq!(
            c.client_response.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        let body = String::from_utf8_lossy(c.client_response.body()).to_string();
        assert!(body.contains("panic: boom"));
    }

    #[tokio::test]
    async fn test_snapshot_isolation_under_concurrent_writes() {
        let (upstreams, groups, registry) = deps();
        let router = Arc::new(Router::new(upstreams, groups));

        let writer = {
            let router = router.clone();
            tokio::spawn(async move {
                for i in 0..200 {
                    let registry = {
                        let (_, _, r) = deps();
                        r
                    };
                    let id = format!("r{}", i % 4);
                    let route =
                        build_route(route_cfg(&id, "/a", i % 7), &registry).unwrap();
                    router.add_routes(vec![route]);
                    if i % 3 == 0 {
                        router.del_routes(&[id]);
                    }
                    tokio::task::yield_now().await;
                }
            })
        };

        for _ in 0..200 {
            let routes = router.routes();
            // A snapshot is internally consistent: ids unique, sorted.
            for pair in routes.windows(2) {
                assert!(pair[0].priority >= pair[1].priority || pair[1].config.protect);
            }
            tokio::task::yield_now().await;
        }
        writer.await.unwrap();
    }
}
