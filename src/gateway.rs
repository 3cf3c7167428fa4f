//! Gateway — wires the runtime together and serves the public listener
//!
//! Construction builds the snapshot managers, the middleware registry and
//! the router; `start` launches the reload loops, the optional manager
//! server and the accept loop. Each accepted connection is served by
//! hyper http1; each request flows through a pooled context and the
//! router.

use crate::config::{BootConfig, MiddlewareGroupConfig, RouteConfig, UpstreamConfig};
use crate::context::{ClientRequest, ContextPool};
use crate::error::{GatewayError, Result};
use crate::manager::{self, ManagerState};
use crate::middleware::{self, GroupManager, Registry, RegistryDeps};
use crate::provider::{ConfigStore, DirProvider, Provider};
use crate::reload::{self, ReloadSignal};
use crate::router::Router;
use crate::tls::TlsState;
use crate::upstream::UpstreamManager;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

struct ReloadChannels {
    certs: mpsc::Receiver<()>,
    routes: mpsc::Receiver<()>,
    upstreams: mpsc::Receiver<()>,
    groups: mpsc::Receiver<()>,
}

pub struct Gateway {
    boot: BootConfig,

    pool: Arc<ContextPool>,
    router: Arc<Router>,
    upstreams: Arc<UpstreamManager>,
    groups: Arc<GroupManager>,
    registry: Arc<Registry>,
    tls: Option<Arc<TlsState>>,

    route_store: Arc<ConfigStore<RouteConfig>>,
    upstream_store: Arc<ConfigStore<UpstreamConfig>>,
    group_store: Arc<ConfigStore<MiddlewareGroupConfig>>,

    reload_certs: ReloadSignal,
    reload_routes: ReloadSignal,
    reload_upstreams: ReloadSignal,
    reload_groups: ReloadSignal,
    channels: Mutex<Option<ReloadChannels>>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Gateway {
    pub fn new(boot: BootConfig) -> Result<Self> {
        let pool = Arc::new(ContextPool::new());
        let upstreams = Arc::new(UpstreamManager::new());
        let groups = Arc::new(GroupManager::new());
        let registry = Arc::new(Registry::with_builtins(RegistryDeps {
            upstreams: upstreams.clone(),
            groups: groups.clone(),
            pool: pool.clone(),
        }));

        let router = Arc::new(Router::new(upstreams.clone(), groups.clone()));
        router.use_middleware(middleware::logger::global());

        let tls = if boot.tls.configured() {
            Some(Arc::new(TlsState::new(boot.tls.clone())?))
        } else {
            None
        };

        let (reload_certs, certs_rx) = ReloadSignal::new();
        let (reload_routes, routes_rx) = ReloadSignal::new();
        let (reload_upstreams, upstreams_rx) = ReloadSignal::new();
        let (reload_groups, groups_rx) = ReloadSignal::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            boot,
            pool,
            router,
            upstreams,
            groups,
            registry,
            tls,
            route_store: Arc::new(ConfigStore::new()),
            upstream_store: Arc::new(ConfigStore::new()),
            group_store: Arc::new(ConfigStore::new()),
            reload_certs,
            reload_routes,
            reload_upstreams,
            reload_groups,
            channels: Mutex::new(Some(ReloadChannels {
                certs: certs_rx,
                routes: routes_rx,
                upstreams: upstreams_rx,
                groups: groups_rx,
            })),
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn upstreams(&self) -> &Arc<UpstreamManager> {
        &self.upstreams
    }

    /// Signal every loop to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Launch the reload loops, the manager and the public listener.
    pub async fn start(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>> {
        let channels = self
            .channels
            .lock()
            .expect("gateway lock poisoned")
            .take()
            .ok_or_else(|| GatewayError::Other("gateway already started".into()))?;

        let mut handles = Vec::new();
        handles.push(self.spawn_route_reload(channels.routes));
        handles.push(self.spawn_upstream_reload(channels.upstreams));
        handles.push(self.spawn_group_reload(channels.groups));
        handles.push(self.spawn_cert_reload(channels.certs));

        if let Some(addr) = self.boot.manager_listen_addr()? {
            let state = Arc::new(ManagerState {
                router: self.router.clone(),
                upstreams: self.upstreams.clone(),
                groups: self.groups.clone(),
                route_store: self.route_store.clone(),
                upstream_store: self.upstream_store.clone(),
                group_store: self.group_store.clone(),
                reload_certs: self.reload_certs.clone(),
                reload_routes: self.reload_routes.clone(),
                reload_upstreams: self.reload_upstreams.clone(),
                reload_groups: self.reload_groups.clone(),
            });
            handles.push(tokio::spawn(async move {
                if let Err(e) = manager::serve(addr, state).await {
                    tracing::error!(error = %e, "manager server failed");
                }
            }));
        }

        let addr = self.boot.listen_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GatewayError::Config(format!("failed to bind on {}: {}", addr, e)))?;
        tracing::info!(address = %addr, tls = self.tls.is_some(), "gateway listening");

        let gateway = self.clone();
        handles.push(tokio::spawn(async move {
            gateway.accept_loop(listener).await;
        }));

        Ok(handles)
    }

    fn spawn_route_reload(self: &Arc<Self>, rx: mpsc::Receiver<()>) -> JoinHandle<()> {
        let provider: Arc<dyn Provider<RouteConfig>> = Arc::new(DirProvider::new(
            &self.boot.provider.routes_dir,
        ));
        let router = self.router.clone();
        let registry = self.registry.clone();
        let store = self.route_store.clone();
        let interval = self.boot.provider.interval;
        let shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            reload::sync_loop("routes", provider, store, interval, rx, shutdown, {
                move |news, olds| reload::apply_routes(&router, &registry, news, olds)
            })
            .await;
        })
    }

    fn spawn_upstream_reload(self: &Arc<Self>, rx: mpsc::Receiver<()>) -> JoinHandle<()> {
        let provider: Arc<dyn Provider<UpstreamConfig>> = Arc::new(DirProvider::new(
            &self.boot.provider.upstreams_dir,
        ));
        let upstreams = self.upstreams.clone();
        let registry = self.registry.clone();
        let store = self.upstream_store.clone();
        let interval = self.boot.provider.interval;
        let shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            reload::sync_loop("upstreams", provider, store, interval, rx, shutdown, {
                move |news, olds| reload::apply_upstreams(&upstreams, &registry, news, olds)
            })
            .await;
        })
    }

    fn spawn_group_reload(self: &Arc<Self>, rx: mpsc::Receiver<()>) -> JoinHandle<()> {
        let provider: Arc<dyn Provider<MiddlewareGroupConfig>> = Arc::new(DirProvider::new(
            &self.boot.provider.middleware_groups_dir,
        ));
        let groups = self.groups.clone();
        let registry = self.registry.clone();
        let store = self.group_store.clone();
        let interval = self.boot.provider.interval;
        let shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            reload::sync_loop("middlewaregroups", provider, store, interval, rx, shutdown, {
                move |news, olds| reload::apply_groups(&groups, &registry, news, olds)
            })
            .await;
        })
    }

    fn spawn_cert_reload(self: &Arc<Self>, mut rx: mpsc::Receiver<()>) -> JoinHandle<()> {
        let tls = self.tls.clone();
        let mut shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = rx.recv() => {
                        let Some(tls) = tls.as_ref() else { continue };
                        if let Err(e) = tls.reload() {
                            tracing::error!(error = %e, "failed to reload the TLS certificates");
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        })
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown_rx.clone();
        loop {
            let (stream, remote_addr) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to accept a connection");
                        continue;
                    }
                },
                _ = shutdown.changed() => {
                    tracing::info!("gateway listener stopping");
                    return;
                }
            };

            let local_addr = stream
                .local_addr()
                .unwrap_or_else(|_| "0.0.0.0:0".parse().unwrap());
            let gateway = self.clone();

            tokio::spawn(async move {
                match gateway.tls.clone() {
                    Some(tls) => match tls.acceptor().accept(stream).await {
                        Ok(tls_stream) => {
                            gateway
                                .serve_connection(TokioIo::new(tls_stream), remote_addr, local_addr, true)
                                .await;
                        }
                        Err(e) => {
                            tracing::debug!(remote = %remote_addr, error = %e, "TLS handshake failed");
                        }
                    },
                    None => {
                        gateway
                            .serve_connection(TokioIo::new(stream), remote_addr, local_addr, false)
                            .await;
                    }
                }
            });
        }
    }

    async fn serve_connection<I>(
        self: Arc<Self>,
        io: TokioIo<I>,
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
        tls: bool,
    ) where
        I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let gateway = self.clone();
        let service = service_fn(move |req: hyper::Request<Incoming>| {
            let gateway = gateway.clone();
            async move {
                Ok::<_, hyper::Error>(gateway.handle_request(req, remote_addr, local_addr, tls).await)
            }
        });
        let _ = hyper::server::conn::http1::Builder::new()
            .serve_connection(io, service)
            .await;
    }

    /// Handle one request: collect the body, run the router over a pooled
    /// context and convert the staged response for hyper.
    pub async fn handle_request(
        &self,
        req: hyper::Request<Incoming>,
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
        tls: bool,
    ) -> hyper::Response<Full<Bytes>> {
        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(_) => Bytes::new(),
        };

        let mut ctx = self.pool.acquire();
        ctx.client_addr = remote_addr;
        ctx.server_addr = local_addr;
        ctx.client_request = ClientRequest {
            host: ClientRequest::host_from_parts(&parts.headers, &parts.uri),
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
            body,
            tls,
        };

        self.router.serve(&mut ctx).await;

        let (status, headers, body) = ctx.client_response.take_parts();
        self.pool.release(ctx);

        let mut builder = hyper::Response::builder().status(status);
        if let Some(h) = builder.headers_mut() {
            *h = headers;
        }
        builder.body(Full::new(body)).unwrap_or_else(|_| {
            hyper::Response::builder()
                .status(http::StatusCode::INTERNAL_SERVER_ERROR)
                .body(Full::new(Bytes::new()))
                .expect("static response")
        })
    }
}
