//! Responder — writes the final response to the client
//!
//! The default [`StdResponse`] copies the upstream response through the
//! context's response writer: headers first (hop-by-hop filtered), then the
//! body chunk by chunk. The `on_response_header` callbacks run after the
//! status and headers are staged and before the first body byte; the
//! `on_response_body` callbacks run after the copy completes. A status
//! error short-circuits to a plain-text error body.

use crate::context::Context;
use crate::error::StatusError;
use async_trait::async_trait;
use http::header::{HeaderName, CONTENT_TYPE};

/// Writes the response to the client from the upstream response or error.
#[async_trait]
pub trait Responder: Send + Sync {
    async fn respond(&self, ctx: &mut Context);
}

/// The standard responder.
pub struct StdResponse;

#[async_trait]
impl Responder for StdResponse {
    async fn respond(&self, ctx: &mut Context) {
        match ctx.error.clone() {
            Some(err) => send_status(ctx, &err),
            None => {
                if let Some(resp) = ctx.upstream_response.take() {
                    copy_response(ctx, resp).await;
                }
            }
        }
    }
}

/// Write a status-coded error: `text/plain` body when a message is set.
pub fn send_status(ctx: &mut Context, err: &StatusError) {
    match &err.message {
        Some(msg) if !msg.is_empty() => {
            ctx.client_response
                .header_mut()
                .insert(CONTENT_TYPE, "text/plain".parse().unwrap());
            ctx.client_response.write_header(err.code);
            ctx.client_response.write(msg.as_bytes());
        }
        _ => ctx.client_response.write_header(err.code),
    }
}

/// Copy the upstream response headers and body to the client.
async fn copy_response(ctx: &mut Context, mut resp: reqwest::Response) {
    copy_response_headers(ctx, &resp);
    ctx.client_response.write_header(resp.status());
    ctx.run_on_response_header();

    loop {
        match resp.chunk().await {
            Ok(Some(chunk)) => ctx.client_response.write(&chunk),
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(
                    route = %ctx.route_id,
                    upstream = %ctx.upstream_id,
                    error = %e,
                    "response body copy interrupted"
                );
                break;
            }
        }
    }

    ctx.run_on_response_body();
}

/// Stage the upstream response headers, replacing same-named headers the
/// middlewares may have staged, and dropping hop-by-hop and empty values.
fn copy_response_headers(ctx: &mut Context, resp: &reqwest::Response) {
    let keys: Vec<HeaderName> = resp.headers().keys().cloned().collect();
    for key in keys {
        if is_hop_by_hop(key.as_str()) {
            continue;
        }
        let values: Vec<_> = resp
            .headers()
            .get_all(&key)
            .iter()
            .filter(|v| !v.is_empty())
            .cloned()
            .collect();
        if values.is_empty() {
            continue;
        }
        let headers = ctx.client_response.header_mut();
        headers.remove(&key);
        for v in values {
            headers.append(key.clone(), v);
        }
    }
}

/// Whether a header is hop-by-hop and must never be forwarded.
pub fn is_hop_by_hop(name: &str) -> bool {
    name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("keep-alive")
        || name.eq_ignore_ascii_case("proxy-authenticate")
        || name.eq_ignore_ascii_case("proxy-authorization")
        || name.eq_ignore_ascii_case("proxy-connection")
        || name.eq_ignore_ascii_case("te")
        || name.eq_ignore_ascii_case("trailer")
        || name.eq_ignore_ascii_case("trailers")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("upgrade")
}
