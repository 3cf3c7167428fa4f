//! Query-string directives for the upstream request.

use super::{check_two_args, resolve_variable, Processor, Registry};
use crate::context::Context;
use std::sync::Arc;

fn encode_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

pub(super) fn register(r: &mut Registry) {
    r.register(
        "addquery",
        vec![
            "string: the key of the query argument",
            "string: the value of the query argument, a variable if starting with '$', '@' or '#'",
        ],
        |name, args| {
            check_two_args(name, args)?;
            let key = encode_component(&args[0]);
            let value = args[1].clone();
            Ok(Arc::new(move |ctx: &mut Context| {
                let resolved = resolve_variable(ctx, &value);
                if resolved.is_empty() {
                    return;
                }
                let pair = format!("{}={}", key, encode_component(&resolved));
                let up = ctx.upstream_request_mut();
                if up.raw_query.is_empty() {
                    up.raw_query = pair;
                } else {
                    let q = format!("{}&{}", up.raw_query, pair);
                    up.raw_query = q;
                }
            }) as Processor)
        },
    );
}
