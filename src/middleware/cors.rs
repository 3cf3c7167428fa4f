//! CORS middleware — implements the Fetch-spec HTTP CORS protocol
//!
//! Origin matching supports exact origins, a subdomain wildcard such as
//! `https://*.example.com`, and `*`. Preflight OPTIONS requests are
//! answered directly with 204; simple requests continue down the chain
//! with the CORS response headers staged.

use super::{bind_conf, Middleware, Next, PRIORITY_CORS};
use crate::context::Context;
use crate::error::Result;
use async_trait::async_trait;
use http::Method;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

const DEFAULT_ALLOW_METHODS: &[&str] = &["HEAD", "GET", "POST", "PUT", "PATCH", "DELETE"];

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Config {
    allow_origins: Vec<String>,
    allow_headers: Vec<String>,
    allow_methods: Vec<String>,
    expose_headers: Vec<String>,
    allow_credentials: bool,
    max_age: u64,
}

struct Cors {
    allow_origins: Vec<String>,
    allow_headers: String,
    allow_methods: String,
    expose_headers: String,
    allow_credentials: bool,
    max_age: u64,
    conf: Value,
}

impl Cors {
    /// The Access-Control-Allow-Origin value for the request origin, or
    /// None when the origin is not allowed.
    fn allowed_origin(&self, origin: &str) -> Option<String> {
        for allowed in &self.allow_origins {
            if allowed == "*" {
                if self.allow_credentials {
                    return Some(origin.to_string());
                }
                return Some("*".to_string());
            }
            if allowed == origin {
                return Some(allowed.clone());
            }
            if match_subdomain(origin, allowed) {
                return Some(origin.to_string());
            }
        }
        None
    }
}

fn match_scheme(domain: &str, pattern: &str) -> bool {
    match (domain.find(':'), pattern.find(':')) {
        (Some(d), Some(p)) => domain[..d] == pattern[..p],
        _ => false,
    }
}

/// Compare an origin against a wildcard pattern like `https://*.site.com`.
fn match_subdomain(domain: &str, pattern: &str) -> bool {
    if !match_scheme(domain, pattern) {
        return false;
    }
    let (Some(didx), Some(pidx)) = (domain.find("://"), pattern.find("://")) else {
        return false;
    };
    let dom_auth = &domain[didx + 3..];
    if dom_auth.len() > 253 {
        return false;
    }
    let pat_auth = &pattern[pidx + 3..];

    match pat_auth.strip_prefix("*.") {
        Some(suffix) => dom_auth
            .strip_suffix(suffix)
            .map(|rest| rest.ends_with('.') || rest.is_empty())
            .unwrap_or(false),
        None => dom_auth == pat_auth,
    }
}

#[async_trait]
impl Middleware for Cors {
    fn name(&self) -> &str {
        "cors"
    }

    fn priority(&self) -> i32 {
        PRIORITY_CORS
    }

    fn config(&self) -> Value {
        self.conf.clone()
    }

    async fn handle(&self, ctx: &mut Context, next: Next<'_>) {
        let origin = ctx
            .client_request
            .headers
            .get("origin")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let Some(allow_origin) = self.allowed_origin(&origin) else {
            next.run(ctx).await;
            return;
        };

        let Ok(origin_value) = allow_origin.parse() else {
            next.run(ctx).await;
            return;
        };
        let headers = ctx.client_response.header_mut();
        headers.append("vary", "Origin".parse().unwrap());
        headers.insert("access-control-allow-origin", origin_value);
        if self.allow_credentials {
            headers.insert("access-control-allow-credentials", "true".parse().unwrap());
        }

        if ctx.client_request.method != Method::OPTIONS {
            // Simple request
            if !self.expose_headers.is_empty() {
                if let Ok(v) = self.expose_headers.parse() {
                    ctx.client_response
                        .header_mut()
                        .insert("access-control-expose-headers", v);
                }
            }
            next.run(ctx).await;
            return;
        }

        // Preflight request
        let request_headers = ctx
            .client_request
            .headers
            .get("access-control-request-headers")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let headers = ctx.client_response.header_mut();
        headers.append("vary", "Access-Control-Request-Method".parse().unwrap());
        headers.append("vary", "Access-Control-Request-Headers".parse().unwrap());
        if let Ok(v) = self.allow_methods.parse() {
            headers.insert("access-control-allow-methods", v);
        }

        if !self.allow_headers.is_empty() {
            if let Ok(v) = self.allow_headers.parse() {
                headers.insert("access-control-allow-headers", v);
            }
        } else if !request_headers.is_empty() {
            if let Ok(v) = request_headers.parse() {
                headers.insert("access-control-allow-headers", v);
            }
        }

        if self.max_age > 0 {
            headers.insert(
                "access-control-max-age",
                self.max_age.to_string().parse().unwrap(),
            );
        }

        ctx.client_response
            .write_header(http::StatusCode::NO_CONTENT);
    }
}

pub(super) fn build(name: &str, conf: &Value) -> Result<Arc<dyn Middleware>> {
    let mut config: Config = bind_conf(name, conf)?;
    if config.allow_origins.is_empty() {
        config.allow_origins = vec!["*".to_string()];
    }
    if config.allow_methods.is_empty() {
        config.allow_methods = DEFAULT_ALLOW_METHODS.iter().map(|s| s.to_string()).collect();
    }

    Ok(Arc::new(Cors {
        allow_origins: config.allow_origins,
        allow_headers: config.allow_headers.join(","),
        allow_methods: config.allow_methods.join(","),
        expose_headers: config.expose_headers.join(","),
        allow_credentials: config.allow_credentials,
        max_age: config.max_age,
        conf: conf.clone(),
    }))
}

#[cfg(test)]
mod tests {
    use super::super::testutil::registry;
    use super::*;
    use crate::middleware::{run_chain, Handler};
    use http::StatusCode;
    use serde_json::json;

    struct Mark;

    #[async_trait]
    impl Handler for Mark {
        async fn handle(&self, ctx: &mut Context) {
            ctx.kvs.insert("reached".into(), "yes".into());
        }
    }

    async fn run(conf: Value, method: &str, origin: Option<&str>) -> Context {
        let mw = registry().build("cors", &conf).unwrap();
        let mut ctx = Context::new();
        ctx.client_request.method = method.parse().unwrap();
        if let Some(o) = origin {
            ctx.client_request.headers.insert("origin", o.parse().unwrap());
        }
        let chain = vec![mw];
        run_chain(&chain, &Mark, &mut ctx).await;
        ctx
    }

    #[test]
    fn test_match_subdomain() {
        assert!(match_subdomain(
            "https://api.example.com",
            "https://*.example.com"
        ));
        assert!(!match_subdomain(
            "https://example.com.evil.io",
            "https://*.example.com"
        ));
        assert!(!match_subdomain(
            "http://api.example.com",
            "https://*.example.com"
        ));
    }

    #[tokio::test]
    async fn test_simple_request_sets_allow_origin() {
        let ctx = run(json!({}), "GET", Some("https://app.io")).await;
        assert_eq!(
            ctx.client_response
                .headers()
                .get("access-control-allow-origin")
                .unwrap(),
            "*"
        );
        assert_eq!(ctx.kvs.get("reached").unwrap(), "yes");
    }

    #[tokio::test]
    async fn test_disallowed_origin_continues_without_cors() {
        let conf = json!({"allowOrigins": ["https://good.io"]});
        let ctx = run(conf, "GET", Some("https://evil.io")).await;
        assert!(!ctx
            .client_response
            .headers()
            .contains_key("access-control-allow-origin"));
        assert_eq!(ctx.kvs.get("reached").unwrap(), "yes");
    }

    #[tokio::test]
    async fn test_preflight_answers_204_without_next() {
        let conf = json!({"allowOrigins": ["https://app.io"], "maxAge": 600});
        let ctx = run(conf, "OPTIONS", Some("https://app.io")).await;
        assert_eq!(ctx.client_response.status_code(), StatusCode::NO_CONTENT);
        assert!(ctx.client_response.wrote_header());
        assert!(ctx.kvs.get("reached").is_none());
        assert_eq!(
            ctx.client_response
                .headers()
                .get("access-control-max-age")
                .unwrap(),
            "600"
        );
        assert!(ctx
            .client_response
            .headers()
            .get("access-control-allow-methods")
            .is_some());
    }

    #[tokio::test]
    async fn test_credentials_echoes_origin() {
        let conf = json!({"allowCredentials": true});
        let ctx = run(conf, "GET", Some("https://app.io")).await;
        assert_eq!(
            ctx.client_response
                .headers()
                .get("access-control-allow-origin")
                .unwrap(),
            "https://app.io"
        );
        assert_eq!(
            ctx.client_response
                .headers()
                .get("access-control-allow-credentials")
                .unwrap(),
            "true"
        );
    }

    #[tokio::test]
    async fn test_wildcard_subdomain_origin() {
        let conf = json!({"allowOrigins": ["https://*.example.com"]});
        let ctx = run(conf, "GET", Some("https://api.example.com")).await;
        assert_eq!(
            ctx.client_response
                .headers()
                .get("access-control-allow-origin")
                .unwrap(),
            "https://api.example.com"
        );
    }

    #[tokio::test]
    async fn test_expose_headers_on_simple_request() {
        let conf = json!({"exposeHeaders": ["X-Total", "X-Page"]});
        let ctx = run(conf, "GET", Some("https://app.io")).await;
        assert_eq!(
            ctx.client_response
                .headers()
                .get("access-control-expose-headers")
                .unwrap(),
            "X-Total,X-Page"
        );
    }
}
