//! Allow middleware — only client IPs inside the CIDR list pass.

use super::{bind_conf, Middleware, Next, PRIORITY_ACL};
use crate::context::Context;
use crate::error::{GatewayError, Result, StatusError};
use crate::matcher::IpCheckers;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

/// The config accepts a bare CIDR string, a CIDR list, or `{cidrs: [...]}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(super) enum CidrsConf {
    One(String),
    Many(Vec<String>),
    Map { cidrs: Vec<String> },
}

impl CidrsConf {
    pub(super) fn into_cidrs(self) -> Vec<String> {
        match self {
            CidrsConf::One(s) => vec![s],
            CidrsConf::Many(v) => v,
            CidrsConf::Map { cidrs } => cidrs,
        }
    }
}

pub(super) fn parse_cidrs(name: &str, conf: &Value) -> Result<IpCheckers> {
    let cidrs = bind_conf::<CidrsConf>(name, conf)?.into_cidrs();
    if cidrs.is_empty() {
        return Err(GatewayError::Middleware {
            name: name.to_string(),
            reason: "missing cidrs".to_string(),
        });
    }
    IpCheckers::new(&cidrs).map_err(|e| GatewayError::Middleware {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

struct Allow {
    checkers: IpCheckers,
    conf: Value,
}

#[async_trait]
impl Middleware for Allow {
    fn name(&self) -> &str {
        "allow"
    }

    fn priority(&self) -> i32 {
        PRIORITY_ACL
    }

    fn config(&self) -> Value {
        self.conf.clone()
    }

    async fn handle(&self, ctx: &mut Context, next: Next<'_>) {
        let ip = ctx.client_ip();
        if self.checkers.contains(ip) {
            next.run(ctx).await;
        } else {
            ctx.abort(
                StatusError::forbidden().with_message(format!("ip '{}' is not allowed", ip)),
            );
        }
    }
}

pub(super) fn build(name: &str, conf: &Value) -> Result<Arc<dyn Middleware>> {
    Ok(Arc::new(Allow {
        checkers: parse_cidrs(name, conf)?,
        conf: conf.clone(),
    }))
}
