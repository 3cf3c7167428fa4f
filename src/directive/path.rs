//! Path directives for the upstream request.

use super::{check_one_arg, check_two_args, Processor, Registry};
use crate::context::Context;
use crate::error::GatewayError;
use regex::Regex;
use std::sync::Arc;

/// Trim a trailing '/' so prefixes join without doubling separators.
fn fix(s: &str) -> &str {
    s.strip_suffix('/').unwrap_or(s)
}

pub(super) fn register(r: &mut Registry) {
    r.register(
        "setpath",
        vec!["string: the new path of the request"],
        |name, args| {
            check_one_arg(name, args)?;
            let path = args[0].clone();
            Ok(Arc::new(move |ctx: &mut Context| {
                ctx.upstream_request_mut().path = path.clone();
            }) as Processor)
        },
    );

    r.register(
        "addprefix",
        vec!["string: the prefix added to the path of the request"],
        |name, args| {
            check_one_arg(name, args)?;
            let prefix = fix(&args[0]).to_string();
            Ok(Arc::new(move |ctx: &mut Context| {
                let up = ctx.upstream_request_mut();
                let path = format!("{}{}", prefix, up.path);
                up.path = path;
            }) as Processor)
        },
    );

    r.register(
        "addsuffix",
        vec!["string: the suffix added to the path of the request"],
        |name, args| {
            check_one_arg(name, args)?;
            let suffix = fix(&args[0]).to_string();
            Ok(Arc::new(move |ctx: &mut Context| {
                let up = ctx.upstream_request_mut();
                let path = format!("{}{}", up.path, suffix);
                up.path = path;
            }) as Processor)
        },
    );

    r.register(
        "delprefix",
        vec!["string: the prefix removed from the path of the request"],
        |name, args| {
            check_one_arg(name, args)?;
            let prefix = fix(&args[0]).to_string();
            Ok(Arc::new(move |ctx: &mut Context| {
                let up = ctx.upstream_request_mut();
                if let Some(rest) = up.path.strip_prefix(prefix.as_str()).map(str::to_string) {
                    up.path = rest;
                }
            }) as Processor)
        },
    );

    r.register(
        "delsuffix",
        vec!["string: the suffix removed from the path of the request"],
        |name, args| {
            check_one_arg(name, args)?;
            let suffix = fix(&args[0]).to_string();
            Ok(Arc::new(move |ctx: &mut Context| {
                let up = ctx.upstream_request_mut();
                if let Some(rest) = up.path.strip_suffix(suffix.as_str()).map(str::to_string) {
                    up.path = rest;
                }
            }) as Processor)
        },
    );

    r.register(
        "replaceprefix",
        vec![
            "string: the replaced original prefix of the path of the request",
            "string: the new prefix of the path of the request",
        ],
        |name, args| {
            check_two_args(name, args)?;
            let old = fix(&args[0]).to_string();
            let new = fix(&args[1]).to_string();
            Ok(Arc::new(move |ctx: &mut Context| {
                let up = ctx.upstream_request_mut();
                let rest = up
                    .path
                    .strip_prefix(old.as_str())
                    .unwrap_or(&up.path)
                    .to_string();
                up.path = format!("{}{}", new, rest);
            }) as Processor)
        },
    );

    r.register(
        "rewrite",
        vec![
            "string: the regular expression matched against the path of the request",
            "string: the replacement of the path of the request",
        ],
        |name, args| {
            check_two_args(name, args)?;
            let re = Regex::new(&args[0]).map_err(|e| GatewayError::Directive {
                name: name.to_string(),
                reason: format!("invalid regex '{}': {}", args[0], e),
            })?;
            let replacement = args[1].clone();
            Ok(Arc::new(move |ctx: &mut Context| {
                let up = ctx.upstream_request_mut();
                let path = re.replace_all(&up.path, replacement.as_str()).into_owned();
                up.path = path;
            }) as Processor)
        },
    );
}

#[cfg(test)]
mod tests {
    use super::super::Registry;
    use crate::context::Context;

    fn ctx(path: &str) -> Context {
        let mut c = Context::new();
        c.client_request.method = http::Method::GET;
        c.client_request.uri = path.parse().unwrap();
        c
    }

    fn apply(directive: &str, args: &[&str], path: &str) -> String {
        let r = Registry::with_builtins();
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let p = r.build(directive, &args).unwrap();
        let mut c = ctx(path);
        p(&mut c);
        c.upstream_request.unwrap().path
    }

    #[test]
    fn test_setpath() {
        assert_eq!(apply("setpath", &["/new"], "/old"), "/new");
    }

    #[test]
    fn test_addprefix() {
        assert_eq!(apply("addprefix", &["/api"], "/users"), "/api/users");
        assert_eq!(apply("addprefix", &["/api/"], "/users"), "/api/users");
    }

    #[test]
    fn test_addsuffix() {
        assert_eq!(apply("addsuffix", &["/v1"], "/users"), "/users/v1");
    }

    #[test]
    fn test_delprefix() {
        assert_eq!(apply("delprefix", &["/api"], "/api/users"), "/users");
        assert_eq!(apply("delprefix", &["/api"], "/other"), "/other");
    }

    #[test]
    fn test_delsuffix() {
        assert_eq!(apply("delsuffix", &["/tail"], "/users/tail"), "/users");
        assert_eq!(apply("delsuffix", &["/tail"], "/users"), "/users");
    }

    #[test]
    fn test_replaceprefix() {
        assert_eq!(
            apply("replaceprefix", &["/v1", "/v2"], "/v1/users"),
            "/v2/users"
        );
        assert_eq!(
            apply("replaceprefix", &["/v1", "/v2"], "/other"),
            "/v2/other"
        );
    }

    #[test]
    fn test_rewrite() {
        assert_eq!(
            apply("rewrite", &["^/users/([0-9]+)$", "/u/$1"], "/users/42"),
            "/u/42"
        );
    }

    #[test]
    fn test_rewrite_bad_regex_is_build_error() {
        let r = Registry::with_builtins();
        let err = match r.build("rewrite", &["(unclosed".to_string(), "/x".to_string()]) {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(err.to_string().contains("invalid regex"));
    }
}
