//! Request-id middleware — sets `X-Request-Id` if absent.

use super::{Middleware, Next, PRIORITY_REQUEST_ID};
use crate::context::Context;
use crate::error::Result;
use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use std::sync::Arc;

const TOKEN_LEN: usize = 24;
const CHARSET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// A random 24-character token over `[0-9A-Za-z]`.
pub fn generate() -> String {
    let mut rng = rand::thread_rng();
    (0..TOKEN_LEN)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

struct RequestId;

#[async_trait]
impl Middleware for RequestId {
    fn name(&self) -> &str {
        "requestid"
    }

    fn priority(&self) -> i32 {
        PRIORITY_REQUEST_ID
    }

    async fn handle(&self, ctx: &mut Context, next: Next<'_>) {
        if !ctx.client_request.headers.contains_key("x-request-id") {
            let id = generate();
            ctx.client_request
                .headers
                .insert("x-request-id", id.parse().expect("alphanumeric token"));
        }
        next.run(ctx).await;
    }
}

pub(super) fn build(_name: &str, _conf: &Value) -> Result<Arc<dyn Middleware>> {
    Ok(Arc::new(RequestId))
}

#[cfg(test)]
mod tests {
    use super::super::testutil::registry;
    use super::*;
    use crate::middleware::{run_chain, Handler};
    use serde_json::json;

    struct Noop;

    #[async_trait]
    impl Handler for Noop {
        async fn handle(&self, _ctx: &mut Context) {}
    }

    #[test]
    fn test_generated_token_shape() {
        for _ in 0..50 {
            let token = generate();
            assert_eq!(token.len(), 24);
            assert!(token.bytes().all(|b| b.is_ascii_alphanumeric()));
        }
    }

    #[tokio::test]
    async fn test_injects_when_absent() {
        let mw = registry().build("requestid", &json!(null)).unwrap();
        let mut ctx = Context::new();
        let chain = vec![mw];
        run_chain(&chain, &Noop, &mut ctx).await;
        let id = ctx.request_id().to_string();
        assert_eq!(id.len(), 24);
    }

    #[tokio::test]
    async fn test_preserves_existing() {
        let mw = registry().build("requestid", &json!(null)).unwrap();
        let mut ctx = Context::new();
        ctx.client_request
            .headers
            .insert("x-request-id", "preset-id".parse().unwrap());
        let chain = vec![mw];
        run_chain(&chain, &Noop, &mut ctx).await;
        assert_eq!(ctx.request_id(), "preset-id");
    }
}
