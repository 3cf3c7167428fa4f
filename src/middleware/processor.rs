//! Processor middleware — runs configured directives at forward time
//!
//! Config: `{"directives": [["setheader", "X-K", "v"], ["addprefix", "/api"]]}`.
//! The compiled processors are registered as an `on_forward` callback so
//! they mutate the upstream request just before dispatch.

use super::{bind_conf, Middleware, Next, PRIORITY_PROCESSOR};
use crate::context::Context;
use crate::directive::{self, run_processors, Processor};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::sync::OnceLock;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Config {
    directives: Vec<Vec<String>>,
}

fn directive_registry() -> &'static directive::Registry {
    static REGISTRY: OnceLock<directive::Registry> = OnceLock::new();
    REGISTRY.get_or_init(directive::Registry::with_builtins)
}

struct ProcessorMiddleware {
    processors: Arc<Vec<Processor>>,
    conf: Value,
}

#[async_trait]
impl Middleware for ProcessorMiddleware {
    fn name(&self) -> &str {
        "processor"
    }

    fn priority(&self) -> i32 {
        PRIORITY_PROCESSOR
    }

    fn config(&self) -> Value {
        self.conf.clone()
    }

    async fn handle(&self, ctx: &mut Context, next: Next<'_>) {
        if !self.processors.is_empty() {
            let processors = self.processors.clone();
            ctx.on_forward(move |ctx| run_processors(&processors, ctx));
        }
        next.run(ctx).await;
    }
}

pub(super) fn build(name: &str, conf: &Value) -> Result<Arc<dyn Middleware>> {
    let config: Config = bind_conf(name, conf)?;

    let mut processors = Vec::with_capacity(config.directives.len());
    for directive in &config.directives {
        let Some((dname, args)) = directive.split_first() else {
            continue;
        };
        let p = directive_registry()
            .build(dname, args)
            .map_err(|e| GatewayError::Middleware {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        processors.push(p);
    }

    Ok(Arc::new(ProcessorMiddleware {
        processors: Arc::new(processors),
        conf: conf.clone(),
    }))
}

#[cfg(test)]
mod tests {
    use super::super::testutil::registry;
    use super::*;
    use crate::middleware::{run_chain, Handler};
    use serde_json::json;

    struct RunForward;

    #[async_trait]
    impl Handler for RunForward {
        async fn handle(&self, ctx: &mut Context) {
            ctx.run_on_forward();
        }
    }

    #[tokio::test]
    async fn test_directives_apply_at_forward_time() {
        let conf = json!({"directives": [
            ["setheader", "X-K", "v"],
            ["addprefix", "/api"]
        ]});
        let mw = registry().build("processor", &conf).unwrap();

        let mut ctx = Context::new();
        ctx.client_request.method = http::Method::GET;
        ctx.client_request.uri = "/users".parse().unwrap();

        let chain = vec![mw];
        run_chain(&chain, &RunForward, &mut ctx).await;

        let up = ctx.upstream_request.as_ref().unwrap();
        assert_eq!(up.headers.get("x-k").unwrap(), "v");
        assert_eq!(up.path, "/api/users");
    }

    #[tokio::test]
    async fn test_directives_in_order() {
        let conf = json!({"directives": [
            ["addprefix", "/a"],
            ["addprefix", "/b"]
        ]});
        let mw = registry().build("processor", &conf).unwrap();

        let mut ctx = Context::new();
        ctx.client_request.method = http::Method::GET;
        ctx.client_request.uri = "/x".parse().unwrap();

        let chain = vec![mw];
        run_chain(&chain, &RunForward, &mut ctx).await;
        assert_eq!(ctx.upstream_request.as_ref().unwrap().path, "/b/a/x");
    }

    #[test]
    fn test_unknown_directive_is_build_error() {
        let conf = json!({"directives": [["nosuch", "a"]]});
        assert!(registry().build("processor", &conf).is_err());
    }

    #[test]
    fn test_empty_directive_entries_skipped() {
        let conf = json!({"directives": [[]]});
        assert!(registry().build("processor", &conf).is_ok());
    }
}
