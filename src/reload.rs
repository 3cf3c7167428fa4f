//! Snapshot-diff reload — pulls config sets and applies adds/dels
//!
//! One loop per resource kind. Each iteration (interval tick, explicit
//! reload signal, or shutdown) asks the provider for the full desired
//! set; when the etag moved, the set is diffed against the last accepted
//! one and the adds/dels are applied to the runtime managers. An object
//! failing to build is logged and skipped; the rest of the set still
//! applies.

use crate::config::{
    diff_groups, diff_routes, diff_upstreams, MiddlewareGroupConfig, RouteConfig, UpstreamConfig,
};
use crate::middleware::{GroupManager, Registry};
use crate::provider::{ConfigStore, Provider};
use crate::router::{build_route, Router};
use crate::upstream::{build_upstream, UpstreamManager};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// A 1-slot reload trigger; a pending signal absorbs further triggers.
#[derive(Clone)]
pub struct ReloadSignal {
    tx: mpsc::Sender<()>,
}

impl ReloadSignal {
    pub fn new() -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    /// Request a reload; a no-op when one is already pending.
    pub fn trigger(&self) {
        let _ = self.tx.try_send(());
    }
}

/// Drives one resource kind until shutdown.
pub async fn sync_loop<T, A>(
    kind: &'static str,
    provider: Arc<dyn Provider<T>>,
    store: Arc<ConfigStore<T>>,
    interval: Duration,
    mut reload: mpsc::Receiver<()>,
    mut shutdown: watch::Receiver<bool>,
    mut apply: A,
) where
    T: Clone + Send + Sync,
    A: FnMut(&[T], &[T]) + Send,
{
    let interval = if interval.is_zero() {
        Duration::from_secs(60)
    } else {
        interval
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut lasts: Vec<T> = Vec::new();
    let mut last_etag = String::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = reload.recv() => {
                tracing::info!(kind, "explicit reload requested");
            }
            _ = shutdown.changed() => {
                tracing::debug!(kind, "reload loop stopping");
                return;
            }
        }

        match provider.load(&last_etag).await {
            Ok(None) => {}
            Ok(Some((resources, etag))) => {
                apply(&resources, &lasts);
                store.set(resources.clone(), etag.clone());
                lasts = resources;
                last_etag = etag;
            }
            Err(e) => {
                tracing::error!(kind, error = %e, "failed to load the resources");
            }
        }
    }
}

/// Diff and apply a route set to the router.
pub fn apply_routes(router: &Router, registry: &Registry, news: &[RouteConfig], olds: &[RouteConfig]) {
    let (adds, dels) = diff_routes(news, olds);
    if adds.is_empty() && dels.is_empty() {
        return;
    }

    let mut built = Vec::with_capacity(adds.len());
    for cfg in adds {
        let id = cfg.id.clone();
        match build_route(cfg, registry) {
            Ok(route) => built.push(route),
            Err(e) => tracing::error!(route = %id, error = %e, "failed to build the http route"),
        }
    }
    router.add_routes(built);

    let del_ids: Vec<String> = dels.into_iter().map(|r| r.id).collect();
    router.del_routes(&del_ids);
}

/// Diff and apply an upstream set to the manager.
pub fn apply_upstreams(
    manager: &UpstreamManager,
    registry: &Registry,
    news: &[UpstreamConfig],
    olds: &[UpstreamConfig],
) {
    let (adds, dels) = diff_upstreams(news, olds);

    for cfg in adds {
        let id = cfg.id.clone();
        match build_upstream(cfg, registry) {
            Ok(up) => {
                tracing::info!(upstream = %id, "add or update the upstream");
                manager.add(up);
            }
            Err(e) => tracing::error!(upstream = %id, error = %e, "failed to build the upstream"),
        }
    }

    for cfg in dels {
        tracing::info!(upstream = %cfg.id, "delete the upstream");
        manager.del(&cfg.id);
    }
}

/// Diff and apply a middleware-group set to the manager.
pub fn apply_groups(
    manager: &GroupManager,
    registry: &Registry,
    news: &[MiddlewareGroupConfig],
    olds: &[MiddlewareGroupConfig],
) {
    let (adds, dels) = diff_groups(news, olds);

    for cfg in adds {
        if cfg.name.is_empty() {
            tracing::error!("skip a middleware group without a name");
            continue;
        }
        match registry.build_all(&cfg.middlewares) {
            Ok(members) => {
                tracing::info!(group = %cfg.name, "add or update the middleware group");
                manager.add(cfg.name.clone(), members);
            }
            Err(e) => {
                tracing::error!(group = %cfg.name, error = %e, "failed to build the middleware group")
            }
        }
    }

    for cfg in dels {
        tracing::info!(group = %cfg.name, "delete the middleware group");
        manager.del(&cfg.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        DiscoveryConfig, MatcherConfig, MiddlewareConf, ServerConfig, StaticDiscoveryConfig,
    };
    use crate::context::ContextPool;
    use crate::middleware::RegistryDeps;
    use crate::provider::DirProvider;
    use serde_json::json;

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

    fn route(id: &str, path: &str) -> RouteConfig {
        RouteConfig {
            id: id.into(),
            upstream: "u1".into(),
            matchers: vec![MatcherConfig {
                paths: vec![path.into()],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn upstream(id: &str, hosts: &[&str]) -> UpstreamConfig {
        UpstreamConfig {
            id: id.into(),
            discovery: DiscoveryConfig {
                static_discovery: Some(StaticDiscoveryConfig {
                    servers: hosts
                        .iter()
                        .map(|h| ServerConfig {
                            host: h.to_string(),
                            port: 80,
                            weight: 1,
                        })
                        .collect(),
                    health_check: None,
                }),
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_apply_routes_adds_and_removes() {
        let (upstreams, groups, registry) = deps();
        let router = Router::new(upstreams, groups);

        let v1 = vec![route("r1", "/a"), route("r2", "/b")];
        apply_routes(&router, &registry, &v1, &[]);
        assert_eq!(router.routes().len(), 2);

        let v2 = vec![route("r1", "/a"), route("r3", "/c")];
        apply_routes(&router, &registry, &v2, &v1);
        assert!(router.get_route("r2").is_none());
        assert!(router.get_route("r3").is_some());
        assert_eq!(router.routes().len(), 2);
    }

    #[test]
    fn test_apply_routes_skips_bad_objects() {
        let (upstreams, groups, registry) = deps();
        let router = Router::new(upstreams, groups);

        let mut bad = route("bad", "/x");
        bad.matchers[0].client_ips = vec!["not-a-cidr".into()];
        let set = vec![bad, route("good", "/ok")];
        apply_routes(&router, &registry, &set, &[]);

        assert!(router.get_route("bad").is_none());
        assert!(router.get_route("good").is_some());
    }

    #[tokio::test]
    async fn test_apply_upstreams_reload_scenario() {
        let (manager, _, registry) = deps();

        // Start with u1 = {e1}.
        let v1 = vec![upstream("u1", &["e1"])];
        apply_upstreams(&manager, &registry, &v1, &[]);
        assert_eq!(manager.get("u1").unwrap().discovery().len(), 1);

        // Grow u1, add u2.
        let v2 = vec![upstream("u1", &["e1", "e2"]), upstream("u2", &["e3"])];
        apply_upstreams(&manager, &registry, &v2, &v1);
        assert_eq!(manager.get("u1").unwrap().discovery().len(), 2);
        assert_eq!(manager.get("u2").unwrap().discovery().len(), 1);

        // Shrink back; u2 disappears.
        let v3 = vec![upstream("u1", &["e1"])];
        apply_upstreams(&manager, &registry, &v3, &v2);
        assert_eq!(manager.get("u1").unwrap().discovery().len(), 1);
        assert!(manager.get("u2").is_none());
    }

    #[test]
    fn test_apply_groups() {
        let (_, groups, registry) = deps();

        let v1 = vec![MiddlewareGroupConfig {
            name: "g1".into(),
            middlewares: vec![MiddlewareConf {
                name: "requestid".into(),
                conf: json!(null),
            }],
        }];
        apply_groups(&groups, &registry, &v1, &[]);
        assert_eq!(groups.get("g1").unwrap().snapshot().len(), 1);

        apply_groups(&groups, &registry, &[], &v1);
        assert!(groups.get("g1").is_none());
    }

    #[test]
    fn test_apply_groups_skips_unbuildable() {
        let (_, groups, registry) = deps();
        let set = vec![
            MiddlewareGroupConfig {
                name: "bad".into(),
                middlewares: vec![MiddlewareConf {
                    name: "nosuch".into(),
                    conf: json!(null),
                }],
            },
            MiddlewareGroupConfig {
                name: "good".into(),
                middlewares: vec![],
            },
        ];
        apply_groups(&groups, &registry, &set, &[]);
        assert!(groups.get("bad").is_none());
        assert!(groups.get("good").is_some());
    }

    #[tokio::test]
    async fn test_sync_loop_applies_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("routes.json"),
            r#"[{"id":"r1","upstream":"u1","matchers":[{"paths":["/a"]}]}]"#,
        )
        .unwrap();

        let (upstreams, groups, registry) = deps();
        let router = Arc::new(Router::new(upstreams, groups));
        let provider: Arc<dyn Provider<RouteConfig>> =
            Arc::new(DirProvider::new(dir.path()));
        let store = Arc::new(ConfigStore::new());

        let (signal, reload_rx) = ReloadSignal::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = {
            let router = router.clone();
            let store = store.clone();
            tokio::spawn(async move {
                sync_loop(
                    "routes",
                    provider,
                    store,
                    Duration::from_millis(20),
                    reload_rx,
                    shutdown_rx,
                    move |news, olds| apply_routes(&router, &registry, news, olds),
                )
                .await;
            })
        };

        signal.trigger();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(router.get_route("r1").is_some());
        assert_eq!(store.resource().len(), 1);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_round_trip_same_etag_no_change() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("routes.json"),
            r#"[{"id":"r1","upstream":"u1","matchers":[{"paths":["/a"]}]}]"#,
        )
        .unwrap();
        let provider = DirProvider::<RouteConfig>::new(dir.path());

        let (_, etag) = provider.load("").await.unwrap().unwrap();
        // Unchanged files: the provider reports nothing, so the runtime
        // sees no add/del and stores no new snapshot.
        assert!(provider.load(&etag).await.unwrap().is_none());
    }
}
