//! Header directives for the upstream request and the client response.

use super::{check_one_arg, check_two_args, resolve_variable, Processor, Registry};
use crate::context::Context;
use crate::error::{GatewayError, Result};
use http::header::{HeaderName, HeaderValue};
use std::sync::Arc;

fn parse_header_name(name: &str, key: &str) -> Result<HeaderName> {
    key.parse::<HeaderName>().map_err(|_| GatewayError::Directive {
        name: name.to_string(),
        reason: format!("invalid header name '{}'", key),
    })
}

fn build_request_header(
    name: &str,
    args: &[String],
    apply: fn(&mut http::HeaderMap, &HeaderName, HeaderValue),
) -> Result<Processor> {
    check_two_args(name, args)?;
    let key = parse_header_name(name, &args[0])?;
    let value = args[1].clone();
    Ok(Arc::new(move |ctx| {
        let resolved = resolve_variable(ctx, &value);
        if resolved.is_empty() {
            return;
        }
        if let Ok(v) = HeaderValue::from_str(&resolved) {
            apply(&mut ctx.upstream_request_mut().headers, &key, v);
        }
    }))
}

fn build_response_header(
    name: &str,
    args: &[String],
    apply: fn(&mut http::HeaderMap, &HeaderName, HeaderValue),
) -> Result<Processor> {
    check_two_args(name, args)?;
    let key = parse_header_name(name, &args[0])?;
    let value = args[1].clone();
    Ok(Arc::new(move |ctx| {
        let resolved = resolve_variable(ctx, &value);
        if resolved.is_empty() {
            return;
        }
        let key = key.clone();
        ctx.on_response_header(move |ctx| {
            if let Ok(v) = HeaderValue::from_str(&resolved) {
                apply(ctx.client_response.header_mut(), &key, v);
            }
        });
    }))
}

fn set_header(headers: &mut http::HeaderMap, key: &HeaderName, value: HeaderValue) {
    headers.insert(key.clone(), value);
}

fn add_header(headers: &mut http::HeaderMap, key: &HeaderName, value: HeaderValue) {
    headers.append(key.clone(), value);
}

pub(super) fn register(r: &mut Registry) {
    const KEY: &str = "string: the key of the header argument";
    const VALUE: &str =
        "string: the value of the header argument, a variable if starting with '$', '@' or '#'";

    // Request headers
    r.register("setheader", vec![KEY, VALUE], |name, args| {
        build_request_header(name, args, set_header)
    });

    r.register("addheader", vec![KEY, VALUE], |name, args| {
        build_request_header(name, args, add_header)
    });

    r.register("delheader", vec![KEY], |name, args| {
        check_one_arg(name, args)?;
        let key = parse_header_name(name, &args[0])?;
        Ok(Arc::new(move |ctx: &mut Context| {
            ctx.upstream_request_mut().headers.remove(&key);
        }) as Processor)
    });

    // Response headers
    r.register("setrespheader", vec![KEY, VALUE], |name, args| {
        build_response_header(name, args, set_header)
    });

    r.register("addrespheader", vec![KEY, VALUE], |name, args| {
        build_response_header(name, args, add_header)
    });

    r.register(
        "delrespheader",
        vec!["string: the key of the response header argument, '*' suffix matches by prefix"],
        |name, args| {
            check_one_arg(name, args)?;
            let key = args[0].clone();
            if let Some(prefix) = key.strip_suffix('*') {
                let prefix = prefix.to_ascii_lowercase();
                return Ok(Arc::new(move |ctx: &mut Context| {
                    let prefix = prefix.clone();
                    ctx.on_response_header(move |ctx| {
                        let headers = ctx.client_response.header_mut();
                        let doomed: Vec<HeaderName> = headers
                            .keys()
                            .filter(|k| k.as_str().starts_with(prefix.as_str()))
                            .cloned()
                            .collect();
                        for k in doomed {
                            headers.remove(k);
                        }
                    });
                }) as Processor);
            }

            let key = parse_header_name(name, &key)?;
            Ok(Arc::new(move |ctx: &mut Context| {
                let key = key.clone();
                ctx.on_response_header(move |ctx| {
                    ctx.client_response.header_mut().remove(&key);
                });
            }) as Processor)
        },
    );
}
