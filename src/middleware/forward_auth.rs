//! Forward-auth middleware — delegates authentication to an external service
//!
//! A sub-request carries the selected client headers plus the
//! `X-Forwarded-{Proto,Method,Host,Uri,For}` set, either to a configured
//! URL or through a named upstream (a sub-invocation on a fresh context
//! that never touches the outer client response). On 2xx the configured
//! upstream-headers from the auth response are copied onto the upstream
//! request; on 3xx and above the configured client-headers are copied onto
//! the client response and the request is rejected with 401; on transport
//! errors the request is either forwarded anyway (`degraded`) or rejected
//! with 503.

use super::{bind_conf, Middleware, Next, RegistryDeps, PRIORITY_AUTH};
use crate::config::duration;
use crate::context::Context;
use crate::error::{GatewayError, Result, StatusError};
use async_trait::async_trait;
use http::header::{HeaderMap, HeaderValue};
use http::Method;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Config {
    /// Either-or with `url`; the upstream takes precedence.
    upstream: String,
    url: String,

    /// GET or POST. Default GET.
    method: String,
    /// Request headers copied onto the auth request; `X-*` prefix forms.
    headers: Vec<String>,
    #[serde(with = "duration")]
    timeout: Duration,

    /// Auth-response headers copied onto the upstream request on success.
    upstream_headers: Vec<String>,
    /// Auth-response headers copied onto the client response on failure.
    client_headers: Vec<String>,

    /// Forward the original request even when the auth service fails.
    degraded: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            upstream: String::new(),
            url: String::new(),
            method: String::new(),
            headers: Vec::new(),
            timeout: Duration::from_secs(3),
            upstream_headers: Vec::new(),
            client_headers: Vec::new(),
            degraded: false,
        }
    }
}

/// Exact names plus lowercase prefixes from patterns like "X-User-*".
#[derive(Debug, Default, Clone)]
struct HeaderSelector {
    exact: Vec<String>,
    prefixes: Vec<String>,
}

impl HeaderSelector {
    fn new(patterns: &[String]) -> Self {
        let mut s = Self::default();
        for p in patterns {
            let p = p.to_ascii_lowercase();
            match p.strip_suffix('*') {
                Some(prefix) => s.prefixes.push(prefix.to_string()),
                None => s.exact.push(p),
            }
        }
        s
    }

    fn matches(&self, name: &str) -> bool {
        self.exact.iter().any(|e| e == name)
            || self.prefixes.iter().any(|p| name.starts_with(p.as_str()))
    }

    fn copy(&self, from: &HeaderMap, to: &mut HeaderMap) {
        for (k, v) in from.iter() {
            if self.matches(k.as_str()) {
                to.append(k.clone(), v.clone());
            }
        }
    }
}

struct ForwardAuth {
    conf: Value,
    target: Target,
    method: Method,
    timeout: Duration,
    degraded: bool,
    headers: HeaderSelector,
    upstream_headers: HeaderSelector,
    client_headers: HeaderSelector,
    deps: RegistryDeps,
    client: reqwest::Client,
}

enum Target {
    Url(String),
    Upstream(String),
}

/// The auth sub-request outcome, normalised across both targets.
struct AuthOutcome {
    status: http::StatusCode,
    headers: HeaderMap,
}

impl ForwardAuth {
    fn auth_request_headers(&self, ctx: &Context) -> HeaderMap {
        let mut headers = HeaderMap::new();
        self.headers.copy(&ctx.client_request.headers, &mut headers);

        let proto = if ctx.client_request.tls { "https" } else { "http" };
        headers.insert("x-forwarded-proto", HeaderValue::from_static(proto));
        if let Ok(v) = HeaderValue::from_str(ctx.client_request.method.as_str()) {
            headers.insert("x-forwarded-method", v);
        }
        if let Ok(v) = HeaderValue::from_str(&ctx.client_request.host) {
            headers.insert("x-forwarded-host", v);
        }
        if let Ok(v) = HeaderValue::from_str(&ctx.client_request.request_uri()) {
            headers.insert("x-forwarded-uri", v);
        }
        if let Ok(v) = HeaderValue::from_str(&ctx.client_ip().to_string()) {
            headers.insert("x-forwarded-for", v);
        }
        headers
    }

    async fn auth_by_url(&self, url: &str, ctx: &Context) -> std::result::Result<AuthOutcome, String> {
        let req = self
            .client
            .request(self.method.clone(), url)
            .headers(self.auth_request_headers(ctx))
            .timeout(self.timeout);

        match req.send().await {
            Ok(resp) => Ok(AuthOutcome {
                status: resp.status(),
                headers: resp.headers().clone(),
            }),
            Err(e) => Err(e.to_string()),
        }
    }

    /// Drive the named upstream with a fresh context; the outer client
    /// response stays untouched.
    async fn auth_by_upstream(
        &self,
        upstream: &str,
        ctx: &Context,
    ) -> std::result::Result<AuthOutcome, String> {
        let mut sub = self.deps.pool.acquire();
        sub.upstream_id = upstream.to_string();
        sub.client_addr = ctx.client_addr;
        sub.server_addr = ctx.server_addr;
        sub.client_request.method = self.method.clone();
        sub.client_request.uri = ctx.client_request.uri.clone();
        sub.client_request.host = ctx.client_request.host.clone();
        sub.client_request.headers = self.auth_request_headers(ctx);
        sub.forward_timeout = Some(self.timeout);

        crate::upstream::forward(&mut sub, &self.deps.upstreams, &self.deps.groups).await;

        let result = match (&sub.error, sub.upstream_response.take()) {
            (Some(err), _) => Err(err.to_string()),
            (None, Some(resp)) => Ok(AuthOutcome {
                status: resp.status(),
                headers: resp.headers().clone(),
            }),
            (None, None) => Err("no response from the auth upstream".to_string()),
        };
        self.deps.pool.release(sub);
        result
    }
}

#[async_trait]
impl Middleware for ForwardAuth {
    fn name(&self) -> &str {
        "forwardauth"
    }

    fn priority(&self) -> i32 {
        PRIORITY_AUTH
    }

    fn config(&self) -> Value {
        self.conf.clone()
    }

    async fn handle(&self, ctx: &mut Context, next: Next<'_>) {
        let outcome = match &self.target {
            Target::Url(url) => self.auth_by_url(url, ctx).await,
            Target::Upstream(id) => self.auth_by_upstream(id, ctx).await,
        };

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(
                    reqid = ctx.request_id(),
                    error = %err,
                    "forwardauth service unreachable"
                );
                if self.degraded {
                    next.run(ctx).await;
                } else {
                    ctx.abort(StatusError::service_unavailable());
                }
                return;
            }
        };

        if outcome.status.as_u16() < 300 {
            let selector = self.upstream_headers.clone();
            let auth_headers = outcome.headers;
            ctx.on_forward(move |ctx| {
                selector.copy(&auth_headers, &mut ctx.upstream_request_mut().headers);
            });
            next.run(ctx).await;
            return;
        }

        tracing::warn!(
            reqid = ctx.request_id(),
            code = outcome.status.as_u16(),
            "forwardauth rejected the request"
        );

        if self.degraded {
            next.run(ctx).await;
        } else {
            self.client_headers
                .copy(&outcome.headers, ctx.client_response.header_mut());
            ctx.abort(StatusError::unauthorized().with_message("authentication failure"));
        }
    }
}

pub(super) fn build(name: &str, conf: &Value, deps: RegistryDeps) -> Result<Arc<dyn Middleware>> {
    let config: Config = bind_conf(name, conf)?;

    let target = if !config.upstream.is_empty() {
        Target::Upstream(config.upstream.clone())
    } else if !config.url.is_empty() {
        Target::Url(config.url.clone())
    } else {
        return Err(GatewayError::Middleware {
            name: name.to_string(),
            reason: "missing the url or upstream".to_string(),
        });
    };

    let method = match config.method.to_ascii_uppercase().as_str() {
        "" | "GET" => Method::GET,
        "POST" => Method::POST,
        other => {
            return Err(GatewayError::Middleware {
                name: name.to_string(),
                reason: format!("unsupported method '{}'", other),
            })
        }
    };

    Ok(Arc::new(ForwardAuth {
        conf: conf.clone(),
        target,
        method,
        timeout: config.timeout,
        degraded: config.degraded,
        headers: HeaderSelector::new(&config.headers),
        upstream_headers: HeaderSelector::new(&config.upstream_headers),
        client_headers: HeaderSelector::new(&config.client_headers),
        deps,
        client: crate::upstream::shared_client(),
    }))
}
