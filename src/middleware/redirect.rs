//! Redirect middleware — http→https scheme swap or a fixed Location.

use super::{bind_conf, Middleware, Next, PRIORITY_REDIRECT};
use crate::context::Context;
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use http::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Config {
    /// Redirect status code, 301..=399. Default 302.
    code: u16,
    http_to_https: bool,
    location: String,
    append_query: bool,
}

enum Kind {
    HttpToHttps,
    Location { location: String, append_query: bool },
}

struct Redirect {
    code: StatusCode,
    kind: Kind,
    conf: Value,
}

impl Redirect {
    /// Returns true when a redirect response was written.
    fn redirect(&self, ctx: &mut Context) -> bool {
        let location = match &self.kind {
            Kind::HttpToHttps => {
                if ctx.client_request.tls {
                    return false;
                }
                format!(
                    "https://{}{}",
                    ctx.client_request.host,
                    ctx.client_request.request_uri()
                )
            }
            Kind::Location {
                location,
                append_query,
            } => {
                if *append_query {
                    format!("{}?{}", location, ctx.client_request.raw_query())
                } else {
                    location.clone()
                }
            }
        };

        if let Ok(v) = location.parse() {
            ctx.client_response.header_mut().insert("location", v);
        }
        ctx.client_response.write_header(self.code);
        true
    }
}

#[async_trait]
impl Middleware for Redirect {
    fn name(&self) -> &str {
        "redirect"
    }

    fn priority(&self) -> i32 {
        PRIORITY_REDIRECT
    }

    fn config(&self) -> Value {
        self.conf.clone()
    }

    async fn handle(&self, ctx: &mut Context, next: Next<'_>) {
        if !self.redirect(ctx) {
            next.run(ctx).await;
        }
    }
}

pub(super) fn build(name: &str, conf: &Value) -> Result<Arc<dyn Middleware>> {
    let config: Config = bind_conf(name, conf)?;

    let code = match config.code {
        0 => StatusCode::FOUND,
        c @ 301..=399 => StatusCode::from_u16(c).map_err(|_| GatewayError::Middleware {
            name: name.to_string(),
            reason: format!("invalid redirect code {}", c),
        })?,
        c => {
            return Err(GatewayError::Middleware {
                name: name.to_string(),
                reason: format!("invalid redirect code {}", c),
            })
        }
    };

    let kind = if config.http_to_https {
        Kind::HttpToHttps
    } else if !config.location.is_empty() {
        Kind::Location {
            location: config.location,
            append_query: config.append_query,
        }
    } else {
        return Err(GatewayError::Middleware {
            name: name.to_string(),
            reason: "missing httpToHttps or location".to_string(),
        });
    };

    Ok(Arc::new(Redirect {
        code,
        kind,
        conf: conf.clone(),
    }))
}

#[cfg(test)]
mod tests {
    use super::super::testutil::registry;
    use super::*;
    use crate::middleware::{run_chain, Handler};
    use serde_json::json;

    struct Mark;

    #[async_trait]
    impl Handler for Mark {
        async fn handle(&self, ctx: &mut Context) {
            ctx.kvs.insert("reached".into(), "yes".into());
        }
    }

    async fn run(conf: Value, uri: &str, tls: bool) -> Context {
        let mw = registry().build("redirect", &conf).unwrap();
        let mut ctx = Context::new();
        ctx.client_request.method = http::Method::GET;
        ctx.client_request.uri = uri.parse().unwrap();
        ctx.client_request.host = "h.example.com".into();
        ctx.client_request.tls = tls;
        let chain = vec![mw];
        run_chain(&chain, &Mark, &mut ctx).await;
        ctx
    }

    #[tokio::test]
    async fn test_http_to_https_preserves_host_and_uri() {
        let ctx = run(json!({"httpToHttps": true}), "/u?q=1", false).await;
        assert_eq!(ctx.client_response.status_code(), StatusCode::FOUND);
        assert_eq!(
            ctx.client_response.headers().get("location").unwrap(),
            "https://h.example.com/u?q=1"
        );
        assert!(ctx.kvs.get("reached").is_none());
    }

    #[tokio::test]
    async fn test_https_request_passes_through() {
        let ctx = run(json!({"httpToHttps": true}), "/u", true).await;
        assert!(!ctx.client_response.wrote_header());
        assert_eq!(ctx.kvs.get("reached").unwrap(), "yes");
    }

    #[tokio::test]
    async fn test_fixed_location() {
        let ctx = run(json!({"location": "https://other.io/l", "code": 301}), "/u", false).await;
        assert_eq!(
            ctx.client_response.status_code(),
            StatusCode::MOVED_PERMANENTLY
        );
        assert_eq!(
            ctx.client_response.headers().get("location").unwrap(),
            "https://other.io/l"
        );
    }

    #[tokio::test]
    async fn test_fixed_location_append_query() {
        let conf = json!({"location": "https://other.io/l", "appendQuery": true});
        let ctx = run(conf, "/u?a=1&b=2", false).await;
        assert_eq!(
            ctx.client_response.headers().get("location").unwrap(),
            "https://other.io/l?a=1&b=2"
        );
    }

    #[test]
    fn test_invalid_code_rejected() {
        assert!(registry()
            .build("redirect", &json!({"httpToHttps": true, "code": 200}))
            .is_err());
        assert!(registry()
            .build("redirect", &json!({"httpToHttps": true, "code": 400}))
            .is_err());
    }

    #[test]
    fn test_missing_target_rejected() {
        let err = match registry().build("redirect", &json!({})) {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(err.to_string().contains("missing httpToHttps or location"));
    }
}
