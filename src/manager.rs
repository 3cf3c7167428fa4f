//! Management API — inspect loaded/runtime config and trigger reloads
//!
//! Bound only when a manager address is configured. Endpoints:
//!
//! - `GET /apigateway/provider/{routes|upstreams|middlewares/groups}`
//! - `GET /apigateway/runtime/{routes|upstreams|middlewares/groups}`
//! - `POST /apigateway/reload/{certs|upstreams|http/routes|http/middlewares/groups}`

use crate::config::{MiddlewareGroupConfig, RouteConfig, UpstreamConfig};
use crate::middleware::GroupManager;
use crate::provider::ConfigStore;
use crate::reload::ReloadSignal;
use crate::router::Router;
use crate::upstream::UpstreamManager;
use bytes::Bytes;
use http::{Method, StatusCode};
use http_body_util::Full;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

pub struct ManagerState {
    pub router: Arc<Router>,
    pub upstreams: Arc<UpstreamManager>,
    pub groups: Arc<GroupManager>,

    pub route_store: Arc<ConfigStore<RouteConfig>>,
    pub upstream_store: Arc<ConfigStore<UpstreamConfig>>,
    pub group_store: Arc<ConfigStore<MiddlewareGroupConfig>>,

    pub reload_certs: ReloadSignal,
    pub reload_routes: ReloadSignal,
    pub reload_upstreams: ReloadSignal,
    pub reload_groups: ReloadSignal,
}

pub struct ManagerResponse {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub body: String,
}

impl ManagerResponse {
    fn json(value: serde_json::Value) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: "application/json; charset=UTF-8",
            body: value.to_string(),
        }
    }

    fn no_content() -> Self {
        Self {
            status: StatusCode::NO_CONTENT,
            content_type: "text/plain",
            body: String::new(),
        }
    }

    fn not_found() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            content_type: "text/plain",
            body: "not found".into(),
        }
    }
}

/// Dispatch one management request.
pub fn handle(state: &ManagerState, method: &Method, path: &str) -> ManagerResponse {
    match (method, path) {
        (&Method::GET, "/apigateway/provider/routes") => {
            ManagerResponse::json(json!(state.route_store.resource()))
        }
        (&Method::GET, "/apigateway/provider/upstreams") => {
            ManagerResponse::json(json!(state.upstream_store.resource()))
        }
        (&Method::GET, "/apigateway/provider/middlewares/groups") => {
            ManagerResponse::json(json!(state.group_store.resource()))
        }

        (&Method::GET, "/apigateway/runtime/routes") => {
            let snapshot = state.router.routes();
            let mut out = Vec::with_capacity(snapshot.len());
            for route in snapshot.iter() {
                out.push(json!({
                    "route": route.config,
                    "priority": route.priority,
                }));
            }
            ManagerResponse::json(json!(out))
        }

        (&Method::GET, "/apigateway/runtime/upstreams") => {
            let all = state.upstreams.all();
            let mut out = Vec::with_capacity(all.len());
            for up in all.values() {
                let endpoints: Vec<serde_json::Value> = up
                    .discovery()
                    .endpoints()
                    .iter()
                    .map(|ep| {
                        json!({
                            "id": ep.id(),
                            "config": {"addr": ep.id(), "weight": ep.weight()},
                            "online": ep.is_online(),
                        })
                    })
                    .collect();
                out.push(json!({
                    "id": up.id(),
                    "policy": up.balancer().policy().as_str(),
                    "timeout": up.timeout().map(|t| t.as_secs()).unwrap_or(0),
                    "endpoints": endpoints,
                    "healthCheck": up.discovery().health_check(),
                }));
            }
            out.sort_by(|a, b| a["id"].as_str().cmp(&b["id"].as_str()));
            ManagerResponse::json(json!(out))
        }

        (&Method::GET, "/apigateway/runtime/middlewares/groups") => {
            let groups = state.groups.groups();
            let mut out = serde_json::Map::new();
            for (name, group) in groups.iter() {
                let mut members = serde_json::Map::new();
                for mw in group.snapshot().iter() {
                    members.insert(mw.name().to_string(), mw.config());
                }
                out.insert(name.clone(), serde_json::Value::Object(members));
            }
            ManagerResponse::json(serde_json::Value::Object(out))
        }

        (&Method::POST, "/apigateway/reload/certs") => {
            state.reload_certs.trigger();
            ManagerResponse::no_content()
        }
        (&Method::POST, "/apigateway/reload/upstreams") => {
            state.reload_upstreams.trigger();
            ManagerResponse::no_content()
        }
        (&Method::POST, "/apigateway/reload/http/routes") => {
            state.reload_routes.trigger();
            ManagerResponse::no_content()
        }
        (&Method::POST, "/apigateway/reload/http/middlewares/groups") => {
            state.reload_groups.trigger();
            ManagerResponse::no_content()
        }

        _ => ManagerResponse::not_found(),
    }
}

/// Serve the management API on the address until the process exits.
pub async fn serve(addr: SocketAddr, state: Arc<ManagerState>) -> crate::error::Result<()> {
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        crate::error::GatewayError::Config(format!("failed to bind the manager on {}: {}", addr, e))
    })?;
    tracing::info!(address = %addr, "manager listening");

    loop {
        let (stream, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::error!(error = %e, "failed to accept a manager connection");
                continue;
            }
        };
        let state = state.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                let state = state.clone();
                async move {
                    let resp = handle(&state, req.method(), req.uri().path());
                    Ok::<_, hyper::Error>(
                        hyper::Response::builder()
                            .status(resp.status)
                            .header("content-type", resp.content_type)
                            .body(Full::new(Bytes::from(resp.body)))
                            .unwrap(),
                    )
                }
            });
            let _ = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DiscoveryConfig, ServerConfig, StaticDiscoveryConfig};
    use crate::context::ContextPool;
    use crate::middleware::{Registry, RegistryDeps};
    use crate::router::build_route;
    use crate::upstream::build_upstream;

    fn state() -> ManagerState {
        let upstreams = Arc::new(UpstreamManager::new());
        let groups = Arc::new(GroupManager::new());
        let router = Arc::new(Router::new(upstreams.clone(), groups.clone()));
        ManagerState {
            router,
            upstreams,
            groups,
            route_store: Arc::new(ConfigStore::new()),
            upstream_store: Arc::new(ConfigStore::new()),
            group_store: Arc::new(ConfigStore::new()),
            reload_certs: ReloadSignal::new().0,
            reload_routes: ReloadSignal::new().0,
            reload_upstreams: ReloadSignal::new().0,
            reload_groups: ReloadSignal::new().0,
        }
    }

    fn registry(state: &ManagerState) -> Registry {
        Registry::with_builtins(RegistryDeps {
            upstreams: state.upstreams.clone(),
            groups: state.groups.clone(),
            pool: Arc::new(ContextPool::new()),
        })
    }

    #[test]
    fn test_provider_routes_endpoint() {
        let state = state();
        state.route_store.set(
            vec![RouteConfig {
                id: "r1".into(),
                upstream: "u1".into(),
                ..Default::default()
            }],
            "1".into(),
        );
        let resp = handle(&state, &Method::GET, "/apigateway/provider/routes");
        assert_eq!(resp.status, StatusCode::OK);
        assert!(resp.body.contains("\"id\":\"r1\""));
    }

    #[test]
    fn test_runtime_routes_endpoint() {
        let state = state();
        let registry = registry(&state);
        let cfg = RouteConfig {
            id: "r1".into(),
            upstream: "u1".into(),
            matchers: vec![crate::config::MatcherConfig {
                paths: vec!["/a".into()],
                ..Default::default()
            }],
            ..Default::default()
        };
        state
            .router
            .add_routes(vec![build_route(cfg, &registry).unwrap()]);

        let resp = handle(&state, &Method::GET, "/apigateway/runtime/routes");
        assert!(resp.body.contains("\"id\":\"r1\""));
        assert!(resp.body.contains("\"priority\":1000"));
    }

    #[test]
    fn test_runtime_upstreams_endpoint() {
        let state = state();
        let registry = registry(&state);
        let cfg = UpstreamConfig {
            id: "u1".into(),
            policy: "roundrobin".into(),
            discovery: DiscoveryConfig {
                static_discovery: Some(StaticDiscoveryConfig {
                    servers: vec![ServerConfig {
                        host: "10.0.0.1".into(),
                        port: 80,
                        weight: 2,
                    }],
                    health_check: None,
                }),
            },
            ..Default::default()
        };
        state.upstreams.add(build_upstream(cfg, &registry).unwrap());

        let resp = handle(&state, &Method::GET, "/apigateway/runtime/upstreams");
        assert!(resp.body.contains("\"id\":\"u1\""));
        assert!(resp.body.contains("\"policy\":\"roundrobin\""));
        assert!(resp.body.contains("\"addr\":\"10.0.0.1:80\""));
        assert!(resp.body.contains("\"online\":true"));
    }

    #[test]
    fn test_runtime_groups_endpoint() {
        let state = state();
        let registry = registry(&state);
        let members = registry
            .build_all(&[crate::config::MiddlewareConf {
                name: "requestid".into(),
                conf: serde_json::Value::Null,
            }])
            .unwrap();
        state.groups.add("g1", members);

        let resp = handle(&state, &Method::GET, "/apigateway/runtime/middlewares/groups");
        assert!(resp.body.contains("\"g1\""));
        assert!(resp.body.contains("\"requestid\""));
    }

    #[tokio::test]
    async fn test_reload_endpoints_trigger_signals() {
        let upstreams = Arc::new(UpstreamManager::new());
        let groups = Arc::new(GroupManager::new());
        let router = Arc::new(Router::new(upstreams.clone(), groups.clone()));
        let (signal, mut rx) = ReloadSignal::new();
        let state = ManagerState {
            router,
            upstreams,
            groups,
            route_store: Arc::new(ConfigStore::new()),
            upstream_store: Arc::new(ConfigStore::new()),
            group_store: Arc::new(ConfigStore::new()),
            reload_certs: ReloadSignal::new().0,
            reload_routes: signal,
            reload_upstreams: ReloadSignal::new().0,
            reload_groups: ReloadSignal::new().0,
        };

        let resp = handle(&state, &Method::POST, "/apigateway/reload/http/routes");
        assert_eq!(resp.status, StatusCode::NO_CONTENT);
        assert!(rx.try_recv().is_ok());

        // A second trigger while one is pending is absorbed.
        let _ = handle(&state, &Method::POST, "/apigateway/reload/http/routes");
        let _ = handle(&state, &Method::POST, "/apigateway/reload/http/routes");
    }

    #[test]
    fn test_unknown_path_is_404() {
        let state = state();
        let resp = handle(&state, &Method::GET, "/apigateway/unknown");
        assert_eq!(resp.status, StatusCode::NOT_FOUND);

        // Reload endpoints require POST.
        let resp = handle(&state, &Method::GET, "/apigateway/reload/upstreams");
        assert_eq!(resp.status, StatusCode::NOT_FOUND);
    }
}
