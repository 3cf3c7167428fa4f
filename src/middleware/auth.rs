//! Auth middleware — static Authorization table
//!
//! Parses `Authorization: <type> <value>`. The type must match the
//! configured one and the value must exist in the auths table; the header
//! map bound to the matched value is merged into the client request before
//! the chain continues.

use super::{bind_conf, Middleware, Next, PRIORITY_AUTH};
use crate::context::Context;
use crate::error::{Result, StatusError};
use async_trait::async_trait;
use http::header::{HeaderName, HeaderValue, AUTHORIZATION};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Config {
    #[serde(rename = "type")]
    auth_type: String,
    /// value -> headers merged into the request on success
    auths: HashMap<String, HashMap<String, String>>,
}

struct Auth {
    auth_type: String,
    auths: HashMap<String, Vec<(HeaderName, HeaderValue)>>,
    conf: Value,
}

#[async_trait]
impl Middleware for Auth {
    fn name(&self) -> &str {
        "auth"
    }

    fn priority(&self) -> i32 {
        PRIORITY_AUTH
    }

    fn config(&self) -> Value {
        self.conf.clone()
    }

    async fn handle(&self, ctx: &mut Context, next: Next<'_>) {
        let raw = ctx
            .client_request
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .trim()
            .to_string();

        if raw.is_empty() {
            ctx.abort(
                StatusError::unauthorized().with_message("missing header 'Authorization'"),
            );
            return;
        }

        let (auth_type, value) = match raw.split_once(' ') {
            Some((t, v)) => (t.to_string(), v.trim().to_string()),
            None => (String::new(), raw),
        };

        if auth_type.is_empty() {
            ctx.abort(StatusError::unauthorized().with_message("Authorization: missing auth type"));
            return;
        }
        if auth_type != self.auth_type {
            ctx.abort(StatusError::unauthorized().with_message("Authorization: invalid auth type"));
            return;
        }

        match self.auths.get(&value) {
            None => {
                ctx.abort(StatusError::unauthorized().with_message("Authorization: invalid auth"));
            }
            Some(headers) => {
                for (k, v) in headers {
                    ctx.client_request.headers.insert(k.clone(), v.clone());
                }
                next.run(ctx).await;
            }
        }
    }
}

pub(super) fn build(name: &str, conf: &Value) -> Result<Arc<dyn Middleware>> {
    let config: Config = bind_conf(name, conf)?;

    let mut auths = HashMap::with_capacity(config.auths.len());
    for (value, headers) in config.auths {
        let mut parsed = Vec::with_capacity(headers.len());
        for (k, v) in headers {
            let (Ok(name), Ok(value)) = (k.parse::<HeaderName>(), HeaderValue::from_str(&v))
            else {
                continue;
            };
            parsed.push((name, value));
        }
        auths.insert(value, parsed);
    }

    Ok(Arc::new(Auth {
        auth_type: config.auth_type,
        auths,
        conf: conf.clone(),
    }))
}
