//! Upstream forwarding engine — balancing, retries, request rewriting
//!
//! An upstream owns a static discovery, a balancer policy, a retry policy,
//! timeouts, scheme/host/path overrides and its own middleware chain. The
//! [`UpstreamForwarder`] terminates a route's middleware chain: it rewrites
//! the derived upstream request, threads it through the upstream's own
//! middlewares and dispatches to a balanced endpoint, recording the
//! response or a status error on the context.

pub mod balancer;
pub mod discovery;
pub mod endpoint;
mod health_check;

pub use balancer::{Balancer, Policy};
pub use discovery::StaticDiscovery;
pub use endpoint::{shared_client, Endpoint};

use crate::config::UpstreamConfig;
use crate::context::Context;
use crate::error::{GatewayError, Result, StatusError};
use crate::middleware::{run_chain, GroupManager, Handler, Middleware, Registry};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Host override resolving to the client's Host header.
pub const HOST_CLIENT: &str = "$client";
/// Host override cleared so the endpoint fills in its own address.
pub const HOST_SERVER: &str = "$server";

/// A runtime upstream: a named pool of endpoints plus forwarding policy.
pub struct Upstream {
    config: UpstreamConfig,
    balancer: Balancer,
    discovery: Arc<StaticDiscovery>,
    middlewares: Vec<Arc<dyn Middleware>>,
    client: reqwest::Client,
}

impl Upstream {
    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    pub fn balancer(&self) -> &Balancer {
        &self.balancer
    }

    pub fn discovery(&self) -> &Arc<StaticDiscovery> {
        &self.discovery
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.config.timeout
    }

    /// Dispatch the context's upstream request to a balanced endpoint,
    /// retrying per the retry policy without reusing a failed endpoint
    /// when an alternative exists.
    async fn dispatch(&self, ctx: &mut Context) -> std::result::Result<reqwest::Response, StatusError> {
        let endpoints = self.discovery.discover();
        if endpoints.is_empty() {
            return Err(
                StatusError::service_unavailable().with_message("no available endpoints")
            );
        }

        let retries = if self.config.retry.number >= 0 {
            self.config.retry.number as u32
        } else {
            0
        };
        let interval = self.config.retry.interval.unwrap_or(Duration::ZERO);

        let mut last_failed: Option<String> = None;
        let mut attempt = 0u32;
        loop {
            let Some(ep) = self
                .balancer
                .select(&endpoints, ctx.client_ip(), last_failed.as_deref())
            else {
                return Err(
                    StatusError::service_unavailable().with_message("no available endpoints")
                );
            };

            match ep.serve(ctx, &self.client).await {
                Ok(resp) => return Ok(resp),
                Err(e) if attempt < retries => {
                    tracing::debug!(
                        upstream = self.id(),
                        endpoint = ep.id(),
                        attempt,
                        error = %e,
                        "endpoint attempt failed, retrying"
                    );
                    last_failed = Some(ep.id().to_string());
                    attempt += 1;
                    if interval > Duration::ZERO {
                        tokio::time::sleep(interval).await;
                    }
                }
                Err(e) => return Err(map_transport_error(&e)),
            }
        }
    }
}

fn map_transport_error(e: &reqwest::Error) -> StatusError {
    if e.is_timeout() {
        StatusError::gateway_timeout().with_message(e.to_string())
    } else {
        StatusError::internal_server_error().with_message(e.to_string())
    }
}

/// Build a runtime upstream from its wire config.
pub fn build_upstream(config: UpstreamConfig, registry: &Registry) -> Result<Arc<Upstream>> {
    if config.id.is_empty() {
        return Err(GatewayError::Config("missing upstream id".into()));
    }

    match config.scheme.as_str() {
        "" | "http" | "https" => {}
        other => {
            return Err(GatewayError::Upstream {
                id: config.id.clone(),
                reason: format!("unsupported scheme '{}'", other),
            })
        }
    }

    let policy = Policy::parse(&config.policy).map_err(|e| GatewayError::Upstream {
        id: config.id.clone(),
        reason: e.to_string(),
    })?;

    let static_cfg = config
        .discovery
        .static_discovery
        .as_ref()
        .ok_or_else(|| GatewayError::Upstream {
            id: config.id.clone(),
            reason: "missing static discovery".into(),
        })?;
    let discovery = Arc::new(StaticDiscovery::new(static_cfg).map_err(|e| {
        GatewayError::Upstream {
            id: config.id.clone(),
            reason: e.to_string(),
        }
    })?);

    let middlewares = registry
        .build_all(&config.middlewares)
        .map_err(|e| GatewayError::Upstream {
            id: config.id.clone(),
            reason: e.to_string(),
        })?;

    Ok(Arc::new(Upstream {
        balancer: Balancer::new(policy),
        discovery,
        middlewares,
        client: shared_client(),
        config,
    }))
}

/// Lock-free readable map of upstreams by id. Adding an upstream starts
/// its discovery (health checks); deleting or replacing one stops it.
pub struct UpstreamManager {
    lock: Mutex<HashMap<String, Arc<Upstream>>>,
    view: ArcSwap<HashMap<String, Arc<Upstream>>>,
}

impl Default for UpstreamManager {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamManager {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(HashMap::new()),
            view: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Upstream>> {
        self.view.load().get(id).cloned()
    }

    pub fn all(&self) -> Arc<HashMap<String, Arc<Upstream>>> {
        self.view.load_full()
    }

    pub fn add(&self, upstream: Arc<Upstream>) {
        let mut shadow = self.lock.lock().expect("upstream manager lock poisoned");
        upstream.discovery.start();
        if let Some(old) = shadow.insert(upstream.id().to_string(), upstream) {
            old.discovery.stop();
        }
        self.view.store(Arc::new(shadow.clone()));
    }

    pub fn del(&self, id: &str) {
        let mut shadow = self.lock.lock().expect("upstream manager lock poisoned");
        if let Some(old) = shadow.remove(id) {
            old.discovery.stop();
            self.view.store(Arc::new(shadow.clone()));
        }
    }
}

/// Apply the upstream's scheme/host/path overrides to the derived request.
fn rewrite_upstream_request(ctx: &mut Context, up: &Upstream) {
    let scheme = up.config().scheme.clone();
    let host = up.config().host.clone();
    let path = up.config().path.clone();
    let client_host = ctx.client_request.host.clone();

    let req = ctx.upstream_request_mut();

    if scheme == "http" || scheme == "https" {
        req.scheme = scheme;
    } else if req.scheme.is_empty() {
        req.scheme = "http".to_string();
    }

    match host.as_str() {
        "" | HOST_CLIENT => req.host = client_host,
        HOST_SERVER => req.host.clear(),
        literal => req.host = literal.to_string(),
    }

    if !path.is_empty() {
        req.path = path;
    }
}

/// The terminal of a route's middleware chain: looks up the upstream,
/// rewrites the request, and runs the per-upstream chain ending in the
/// balanced endpoint dispatch.
pub struct UpstreamForwarder {
    pub upstreams: Arc<UpstreamManager>,
    pub groups: Arc<GroupManager>,
}

#[async_trait]
impl Handler for UpstreamForwarder {
    async fn handle(&self, ctx: &mut Context) {
        forward(ctx, &self.upstreams, &self.groups).await;
    }
}

/// Forward the request through the upstream recorded on the context.
///
/// Also the entry point for sub-invocations (forward-auth by upstream),
/// which drive a fresh context through a different upstream.
pub async fn forward(ctx: &mut Context, upstreams: &UpstreamManager, groups: &GroupManager) {
    if ctx.aborted {
        return;
    }

    let Some(up) = upstreams.get(&ctx.upstream_id) else {
        ctx.abort(
            StatusError::internal_server_error()
                .with_message(format!("no upstream '{}'", ctx.upstream_id)),
        );
        return;
    };

    rewrite_upstream_request(ctx, &up);

    let mut chain = up.middlewares.clone();
    if !up.config.middleware_group.is_empty() {
        match groups.get(&up.config.middleware_group) {
            Some(group) => chain.extend(group.snapshot().iter().cloned()),
            None => {
                ctx.abort(StatusError::internal_server_error().with_message(format!(
                    "not found the middleware group '{}'",
                    up.config.middleware_group
                )));
                return;
            }
        }
    }

    let dispatch = Dispatch { upstream: &up };
    run_chain(&chain, &dispatch, ctx).await;
}

/// Runs the forward callbacks and performs the balanced round-trip.
struct Dispatch<'a> {
    upstream: &'a Upstream,
}

#[async_trait]
impl Handler for Dispatch<'_> {
    async fn handle(&self, ctx: &mut Context) {
        ctx.run_on_forward();
        if ctx.aborted {
            return;
        }

        let start = Instant::now();
        let timeout = ctx.forward_timeout.or(self.upstream.timeout());

        let result = match timeout {
            Some(t) if t > Duration::ZERO => {
                match tokio::time::timeout(t, self.upstream.dispatch(ctx)).await {
                    Ok(r) => r,
                    Err(_) => Err(StatusError::gateway_timeout()
                        .with_message(format!("forward timeout after {:?}", t))),
                }
            }
            _ => self.upstream.dispatch(ctx).await,
        };

        let cost = start.elapsed();
        match result {
            Ok(resp) => {
                tracing::debug!(
                    reqid = ctx.request_id(),
                    upstream = self.upstream.id(),
                    balancer = self.upstream.balancer().policy().as_str(),
                    endpoint = %ctx.endpoint_id,
                    status = resp.status().as_u16(),
                    cost = ?cost,
                    "forwarded the http request"
                );
                ctx.upstream_response = Some(resp);
            }
            Err(err) => {
                tracing::error!(
                    reqid = ctx.request_id(),
                    upstream = self.upstream.id(),
                    balancer = self.upstream.balancer().policy().as_str(),
                    endpoint = %ctx.endpoint_id,
                    cost = ?cost,
                    error = %err,
                    "failed to forward the http request"
                );
                ctx.error = Some(err);
            }
        }
    }
}
