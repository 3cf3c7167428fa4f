//! Logger middleware — structured access record per request
//!
//! Installed as a router-global middleware so it wraps the whole
//! match-serve-respond path and observes the final status and byte count.

use super::{Middleware, Next, PRIORITY_LOGGER};
use crate::context::Context;
use crate::error::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

/// One access record, serialisable for log aggregation.
#[derive(Debug, Clone, Serialize)]
pub struct AccessRecord {
    pub timestamp: String,
    pub request_id: String,
    pub client_addr: String,
    pub method: String,
    pub path: String,
    pub query: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub route: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub upstream: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub endpoint: String,
    pub status: u16,
    pub bytes: u64,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct Logger {
    conf: Value,
}

#[async_trait]
impl Middleware for Logger {
    fn name(&self) -> &str {
        "logger"
    }

    fn priority(&self) -> i32 {
        PRIORITY_LOGGER
    }

    fn config(&self) -> Value {
        self.conf.clone()
    }

    async fn handle(&self, ctx: &mut Context, next: Next<'_>) {
        let start = Instant::now();
        next.run(ctx).await;
        let cost = start.elapsed();

        let record = AccessRecord {
            timestamp: chrono::Utc::now().to_rfc3339(),
            request_id: ctx.request_id().to_string(),
            client_addr: ctx.client_addr.to_string(),
            method: ctx.client_request.method.to_string(),
            path: ctx.client_request.path().to_string(),
            query: ctx.client_request.raw_query().to_string(),
            route: ctx.route_id.clone(),
            upstream: ctx.upstream_id.clone(),
            endpoint: ctx.endpoint_id.clone(),
            status: ctx.client_response.status_code().as_u16(),
            bytes: ctx.client_response.written(),
            duration_ms: cost.as_millis() as u64,
            error: ctx.error.as_ref().and_then(|e| e.message.clone()),
        };

        tracing::info!(
            target: "access",
            reqid = %record.request_id,
            raddr = %record.client_addr,
            method = %record.method,
            path = %record.path,
            route = %record.route,
            upstream = %record.upstream,
            endpoint = %record.endpoint,
            code = record.status,
            bytes = record.bytes,
            cost_ms = record.duration_ms,
            err = record.error.as_deref().unwrap_or(""),
            "{}",
            serde_json::to_string(&record).unwrap_or_default()
        );
    }
}

pub(super) fn build(_name: &str, conf: &Value) -> Result<Arc<dyn Middleware>> {
    Ok(Arc::new(Logger { conf: conf.clone() }))
}

/// The logger with an empty config, for the router's global chain.
pub fn global() -> Arc<dyn Middleware> {
    Arc::new(Logger { conf: Value::Null })
}
