//! Middleware pipeline — composable request/response behaviour
//!
//! A middleware wraps the rest of the chain: it may mutate the client or
//! upstream request, register callbacks on the context, short-circuit by
//! aborting or writing a response, or call [`Next::run`]. Chains execute in
//! ascending priority order, so the lowest-priority middleware sees the
//! request first. Builders are looked up by name in the [`Registry`].

pub mod group;

mod allow;
mod auth;
mod block;
mod cors;
mod forward_auth;
mod gzip;
pub mod logger;
mod processor;
mod redirect;
mod request_id;

pub use group::{Group, GroupManager};

use crate::context::{Context, ContextPool};
use crate::error::{GatewayError, Result};
use crate::upstream::UpstreamManager;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

// Built-in priorities; ascending priority is request-visit order.
pub const PRIORITY_LOGGER: i32 = 100;
pub const PRIORITY_REQUEST_ID: i32 = 200;
pub const PRIORITY_REDIRECT: i32 = 300;
pub const PRIORITY_ACL: i32 = 400;
pub const PRIORITY_CORS: i32 = 500;
pub const PRIORITY_AUTH: i32 = 600;
pub const PRIORITY_PROCESSOR: i32 = 700;
pub const PRIORITY_GZIP: i32 = 800;

/// A terminal handler at the end of a middleware chain.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &mut Context);
}

/// A middleware wrapping the rest of the chain.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Middleware name for logging and the management API.
    fn name(&self) -> &str;

    /// Composition priority; lower runs closer to the client.
    fn priority(&self) -> i32;

    /// The configuration this middleware was built from.
    fn config(&self) -> Value {
        Value::Null
    }

    async fn handle(&self, ctx: &mut Context, next: Next<'_>);
}

/// The remainder of a middleware chain plus its terminal handler.
pub struct Next<'a> {
    rest: &'a [Arc<dyn Middleware>],
    terminal: &'a dyn Handler,
}

impl<'a> Next<'a> {
    /// Run the rest of the chain. Returns early once the context aborts.
    pub async fn run(self, ctx: &mut Context) {
        if ctx.aborted {
            return;
        }
        match self.rest.split_first() {
            Some((mw, rest)) => {
                let next = Next {
                    rest,
                    terminal: self.terminal,
                };
                mw.handle(ctx, next).await;
            }
            None => self.terminal.handle(ctx).await,
        }
    }
}

/// Run a middleware chain ending in the terminal handler.
pub async fn run_chain(chain: &[Arc<dyn Middleware>], terminal: &dyn Handler, ctx: &mut Context) {
    Next {
        rest: chain,
        terminal,
    }
    .run(ctx)
    .await;
}

/// Stable sort by ascending priority; config order breaks ties.
pub fn sort_middlewares(mws: &mut [Arc<dyn Middleware>]) {
    mws.sort_by_key(|mw| mw.priority());
}

type BuilderFn = Box<dyn Fn(&str, &Value) -> Result<Arc<dyn Middleware>> + Send + Sync>;

/// Everything builders may capture: forward-auth drives other upstreams
/// through a pooled sub-context.
#[derive(Clone)]
pub struct RegistryDeps {
    pub upstreams: Arc<UpstreamManager>,
    pub groups: Arc<GroupManager>,
    pub pool: Arc<ContextPool>,
}

/// Registry of middleware builders, keyed by middleware name.
pub struct Registry {
    builders: HashMap<&'static str, BuilderFn>,
}

impl Registry {
    pub fn empty() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// The registry with all built-in middlewares registered.
    pub fn with_builtins(deps: RegistryDeps) -> Self {
        let mut r = Self::empty();
        r.register("allow", allow::build);
        r.register("block", block::build);
        r.register("auth", auth::build);
        r.register("cors", cors::build);
        r.register("redirect", redirect::build);
        r.register("requestid", request_id::build);
        r.register("logger", logger::build);
        r.register("processor", processor::build);
        r.register("gzip", gzip::build);

        let fa_deps = deps.clone();
        r.register_fn("forwardauth", move |name, conf| {
            forward_auth::build(name, conf, fa_deps.clone())
        });
        r
    }

    pub fn register(
        &mut self,
        name: &'static str,
        build: fn(&str, &Value) -> Result<Arc<dyn Middleware>>,
    ) {
        self.builders.insert(name, Box::new(build));
    }

    pub fn register_fn(
        &mut self,
        name: &'static str,
        build: impl Fn(&str, &Value) -> Result<Arc<dyn Middleware>> + Send + Sync + 'static,
    ) {
        self.builders.insert(name, Box::new(build));
    }

    /// Build the middleware named `name` from its config value.
    pub fn build(&self, name: &str, conf: &Value) -> Result<Arc<dyn Middleware>> {
        match self.builders.get(name) {
            Some(builder) => builder(name, conf),
            None => Err(GatewayError::Middleware {
                name: name.to_string(),
                reason: "unknown middleware".to_string(),
            }),
        }
    }

    /// Build a middleware list from config, sorted by ascending priority.
    pub fn build_all(
        &self,
        confs: &[crate::config::MiddlewareConf],
    ) -> Result<Vec<Arc<dyn Middleware>>> {
        let mut mws = Vec::with_capacity(confs.len());
        for mc in confs {
            mws.push(self.build(&mc.name, &mc.conf)?);
        }
        sort_middlewares(&mut mws);
        Ok(mws)
    }
}

/// Bind a middleware config value to a concrete config struct.
pub(crate) fn bind_conf<T: serde::de::DeserializeOwned>(name: &str, conf: &Value) -> Result<T> {
    serde_json::from_value(conf.clone()).map_err(|e| GatewayError::Middleware {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Records the order middlewares and the terminal run in.
    pub struct Trace {
        pub entries: Mutex<Vec<String>>,
    }

    impl Trace {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                entries: Mutex::new(Vec::new()),
            })
        }

        pub fn push(&self, s: impl Into<String>) {
            self.entries.lock().unwrap().push(s.into());
        }

        pub fn entries(&self) -> Vec<String> {
            self.entries.lock().unwrap().clone()
        }
    }

    pub struct TraceMiddleware {
        pub label: String,
        pub priority: i32,
        pub trace: Arc<Trace>,
    }

    #[async_trait]
    impl Middleware for TraceMiddleware {
        fn name(&self) -> &str {
            "trace"
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        async fn handle(&self, ctx: &mut Context, next: Next<'_>) {
            self.trace.push(format!("{}:before", self.label));
            next.run(ctx).await;
            self.trace.push(format!("{}:after", self.label));
        }
    }

    pub struct CountingTerminal {
        pub calls: AtomicUsize,
        pub trace: Arc<Trace>,
    }

    #[async_trait]
    impl Handler for CountingTerminal {
        async fn handle(&self, _ctx: &mut Context) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.trace.push("terminal");
        }
    }

    pub fn registry() -> Registry {
        let deps = RegistryDeps {
            upstreams: Arc::new(UpstreamManager::new()),
            groups: Arc::new(GroupManager::new()),
            pool: Arc::new(ContextPool::new()),
        };
        Registry::with_builtins(deps)
    }
}
