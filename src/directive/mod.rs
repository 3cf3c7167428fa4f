//! Processor directives — named request/response mutators
//!
//! A directive is a name plus an argument-description list and a builder
//! turning `(name, args...)` into a [`Processor`]. Processors run at
//! forward time and mutate the context, typically the upstream request.
//!
//! Values may reference variables: `@name` reads a request header (with
//! cookie indirection through `X-Cookie` for the key `cookie`), `#name`
//! reads a query parameter, and `$name` tries the context kvs, then the
//! query, then the header, returning the first non-empty value.

mod header;
mod path;
mod query;

use crate::context::Context;
use crate::error::{GatewayError, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// A compiled directive, applied to the request context.
pub type Processor = Arc<dyn Fn(&mut Context) + Send + Sync>;

/// An ordered set of processors, applied in order.
pub fn run_processors(processors: &[Processor], ctx: &mut Context) {
    for p in processors {
        p(ctx);
    }
}

type Builder = Box<dyn Fn(&str, &[String]) -> Result<Processor> + Send + Sync>;

struct Directive {
    arg_descs: Vec<&'static str>,
    build: Builder,
}

/// Registry of directive builders, keyed by directive name.
pub struct Registry {
    directives: HashMap<&'static str, Directive>,
}

impl Registry {
    fn empty() -> Self {
        Self {
            directives: HashMap::new(),
        }
    }

    /// The registry with all built-in directives registered.
    pub fn with_builtins() -> Self {
        let mut r = Self::empty();
        header::register(&mut r);
        path::register(&mut r);
        query::register(&mut r);
        r
    }

    pub fn register(
        &mut self,
        name: &'static str,
        arg_descs: Vec<&'static str>,
        build: impl Fn(&str, &[String]) -> Result<Processor> + Send + Sync + 'static,
    ) {
        self.directives.insert(
            name,
            Directive {
                arg_descs,
                build: Box::new(build),
            },
        );
    }

    /// Build the directive named `name` with the arguments.
    pub fn build(&self, name: &str, args: &[String]) -> Result<Processor> {
        match self.directives.get(name) {
            Some(d) => (d.build)(name, args),
            None => Err(GatewayError::Directive {
                name: name.to_string(),
                reason: "no such directive".to_string(),
            }),
        }
    }

    /// Directive names with their argument descriptions.
    pub fn describe(&self) -> HashMap<&'static str, &[&'static str]> {
        self.directives
            .iter()
            .map(|(name, d)| (*name, d.arg_descs.as_slice()))
            .collect()
    }
}

pub(crate) fn check_one_arg(name: &str, args: &[String]) -> Result<()> {
    if args.len() == 1 {
        Ok(())
    } else {
        Err(GatewayError::Directive {
            name: name.to_string(),
            reason: format!("expect 1 argument, got {}", args.len()),
        })
    }
}

pub(crate) fn check_two_args(name: &str, args: &[String]) -> Result<()> {
    if args.len() == 2 {
        Ok(())
    } else {
        Err(GatewayError::Directive {
            name: name.to_string(),
            reason: format!("expect 2 arguments, got {}", args.len()),
        })
    }
}

/// The value of the request header, with cookie indirection: for the key
/// `cookie`, the header `X-Cookie` names which cookie to read.
fn header_value(ctx: &Context, key: &str) -> String {
    if key.eq_ignore_ascii_case("cookie") {
        let name = ctx
            .client_request
            .headers
            .get("x-cookie")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !name.is_empty() {
            return ctx.cookie(&name).to_string();
        }
        return ctx.cookie(key).to_string();
    }

    ctx.client_request
        .headers
        .get(key)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

/// Resolve a directive value that may be a variable reference.
///
/// Returns the literal value unchanged when it carries no variable prefix.
pub fn resolve_variable(ctx: &Context, value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some('@') => header_value(ctx, chars.as_str()),

        Some('#') => ctx.query(chars.as_str()).to_string(),

        Some('$') => {
            let name = chars.as_str();
            if let Some(v) = ctx.kvs.get(name) {
                return v.clone();
            }
            let v = ctx.query(name);
            if !v.is_empty() {
                return v.to_string();
            }
            header_value(ctx, name)
        }

        _ => value.to_string(),
    }
}
