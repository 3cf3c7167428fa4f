//! Gzip middleware — compresses the response body for accepting clients
//!
//! The header-phase callback decides (already-encoded and short responses
//! are left alone) and rewrites `Content-Encoding`/`Vary`; the body-phase
//! callback compresses the staged body in place after the copy completes.

use super::{bind_conf, Middleware, Next, PRIORITY_GZIP};
use crate::context::Context;
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH, VARY};
use serde::Deserialize;
use serde_json::Value;
use std::io::Write;
use std::sync::Arc;

const GZIP_FLAG: &str = "gzip.enabled";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Config {
    /// 0..=9; higher compresses better and slower.
    level: u32,
    /// Responses with a known length below this stay uncompressed.
    min_length: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            level: 6,
            min_length: 1024,
        }
    }
}

struct Gzip {
    level: Compression,
    min_length: u64,
    conf: Value,
}

#[async_trait]
impl Middleware for Gzip {
    fn name(&self) -> &str {
        "gzip"
    }

    fn priority(&self) -> i32 {
        PRIORITY_GZIP
    }

    fn config(&self) -> Value {
        self.conf.clone()
    }

    async fn handle(&self, ctx: &mut Context, next: Next<'_>) {
        let accepts_gzip = ctx
            .client_request
            .headers
            .get("accept-encoding")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase().contains("gzip"))
            .unwrap_or(false);

        if accepts_gzip {
            let min_length = self.min_length;
            ctx.on_response_header(move |ctx| {
                let headers = ctx.client_response.headers();
                if headers.contains_key(CONTENT_ENCODING) {
                    return;
                }
                let content_length = headers
                    .get(CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok());
                if matches!(content_length, Some(len) if len < min_length) {
                    return;
                }

                let headers = ctx.client_response.header_mut();
                headers.remove(CONTENT_LENGTH);
                headers.insert(CONTENT_ENCODING, "gzip".parse().unwrap());
                headers.append(VARY, "Accept-Encoding".parse().unwrap());
                ctx.kvs.insert(GZIP_FLAG.into(), "1".into());
            });

            let level = self.level;
            ctx.on_response_body(move |ctx| {
                if ctx.kvs.get(GZIP_FLAG).is_none() {
                    return;
                }
                let body = ctx.client_response.body_mut();
                let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 2), level);
                if encoder.write_all(body).is_err() {
                    return;
                }
                if let Ok(compressed) = encoder.finish() {
                    body.clear();
                    body.extend_from_slice(&compressed);
                }
            });
        }

        next.run(ctx).await;
    }
}

pub(super) fn build(name: &str, conf: &Value) -> Result<Arc<dyn Middleware>> {
    let config: Config = bind_conf(name, conf)?;
    if config.level > 9 {
        return Err(GatewayError::Middleware {
            name: name.to_string(),
            reason: format!("invalid compression level {}", config.level),
        });
    }
    Ok(Arc::new(Gzip {
        level: Compression::new(config.level),
        min_length: config.min_length,
        conf: conf.clone(),
    }))
}

#[cfg(test)]
mod tests {
    use super::super::testutil::registry;
    use super::*;
    use crate::middleware::{run_chain, Handler};
    use serde_json::json;
    use std::io::Read;

    struct StageBody(&'static [u8]);

    #[async_trait]
    impl Handler for StageBody {
        async fn handle(&self, ctx: &mut Context) {
            ctx.client_response.write_header(http::StatusCode::OK);
            ctx.run_on_response_header();
            ctx.client_response.write(self.0);
            ctx.run_on_response_body();
        }
    }

    async fn run(conf: Value, accept: Option<&str>, body: &'static [u8]) -> Context {
        let mw = registry().build("gzip", &conf).unwrap();
        let mut ctx = Context::new();
        if let Some(a) = accept {
            ctx.client_request
                .headers
                .insert("accept-encoding", a.parse().unwrap());
        }
        let chain = vec![mw];
        run_chain(&chain, &StageBody(body), &mut ctx).await;
        ctx
    }

    fn gunzip(data: &[u8]) -> Vec<u8> {
        let mut decoder = flate2::read::GzDecoder::new(data);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        out
    }

    #[tokio::test]
    async fn test_compresses_for_accepting_client() {
        let body = b"hello hello hello hello hello hello hello hello";
        let ctx = run(json!({}), Some("gzip, deflate"), body).await;
        assert_eq!(
            ctx.client_response.headers().get("content-encoding").unwrap(),
            "gzip"
        );
        assert_eq!(gunzip(ctx.client_response.body()), body.to_vec());
    }

    #[tokio::test]
    async fn test_skips_without_accept_encoding() {
        let body = b"plain body";
        let ctx = run(json!({}), None, body).await;
        assert!(!ctx
            .client_response
            .headers()
            .contains_key("content-encoding"));
        assert_eq!(ctx.client_response.body(), body);
    }

    #[tokio::test]
    async fn test_skips_already_encoded() {
        struct PreEncoded;

        #[async_trait]
        impl Handler for PreEncoded {
            async fn handle(&self, ctx: &mut Context) {
                ctx.client_response
                    .header_mut()
                    .insert(CONTENT_ENCODING, "br".parse().unwrap());
                ctx.client_response.write_header(http::StatusCode::OK);
                ctx.run_on_response_header();
                ctx.client_response.write(b"encoded");
                ctx.run_on_response_body();
            }
        }

        let mw = registry().build("gzip", &json!({})).unwrap();
        let mut ctx = Context::new();
        ctx.client_request
            .headers
            .insert("accept-encoding", "gzip".parse().unwrap());
        let chain = vec![mw];
        run_chain(&chain, &PreEncoded, &mut ctx).await;
        assert_eq!(
            ctx.client_response.headers().get("content-encoding").unwrap(),
            "br"
        );
        assert_eq!(ctx.client_response.body(), b"encoded");
    }

    #[tokio::test]
    async fn test_respects_min_length() {
        struct ShortWithLength;

        #[async_trait]
        impl Handler for ShortWithLength {
            async fn handle(&self, ctx: &mut Context) {
                ctx.client_response
                    .header_mut()
                    .insert(CONTENT_LENGTH, "5".parse().unwrap());
                ctx.client_response.write_header(http::StatusCode::OK);
                ctx.run_on_response_header();
                ctx.client_response.write(b"short");
                ctx.run_on_response_body();
            }
        }

        let mw = registry().build("gzip", &json!({"minLength": 1024})).unwrap();
        let mut ctx = Context::new();
        ctx.client_request
            .headers
            .insert("accept-encoding", "gzip".parse().unwrap());
        let chain = vec![mw];
        run_chain(&chain, &ShortWithLength, &mut ctx).await;
        assert_eq!(ctx.client_response.body(), b"short");
    }

    #[test]
    fn test_invalid_level_rejected() {
        assert!(registry().build("gzip", &json!({"level": 12})).is_err());
    }
}
