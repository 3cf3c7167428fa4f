//! Block middleware — client IPs inside the CIDR list are rejected.

use super::allow::parse_cidrs;
use super::{Middleware, Next, PRIORITY_ACL};
use crate::context::Context;
use crate::error::{Result, StatusError};
use crate::matcher::IpCheckers;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

struct Block {
    checkers: IpCheckers,
    conf: Value,
}

#[async_trait]
impl Middleware for Block {
    fn name(&self) -> &str {
        "block"
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
            ctx.abort(StatusError::forbidden().with_message(format!("ip '{}' is blocked", ip)));
        } else {
            next.run(ctx).await;
        }
    }
}

pub(super) fn build(name: &str, conf: &Value) -> Result<Arc<dyn Middleware>> {
    Ok(Arc::new(Block {
        checkers: parse_cidrs(name, conf)?,
        conf: conf.clone(),
    }))
}
