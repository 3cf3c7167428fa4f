//! Per-request context — scratch state threaded through the middleware chain
//!
//! A context carries the collected client request, the wrapping response
//! writer, the lazily-derived upstream request, the upstream response and
//! any status error, plus the three ordered callback lists middlewares can
//! register (`on_forward`, `on_response_header`, `on_response_body`).
//! Contexts are pooled: `ContextPool::acquire` hands one out, `release`
//! resets it in place (callback vectors keep their capacity) and returns it.

use crate::error::StatusError;
use crate::responder::Responder;
use bytes::{Bytes, BytesMut};
use http::header::HOST;
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use std::sync::OnceLock;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Default capacity reserved for the kvs map and callback vectors.
pub const DEFAULT_CAP: usize = 4;

/// A callback registered on the context, run exactly once at its phase.
pub type Callback = Box<dyn FnOnce(&mut Context) + Send + Sync>;

/// The inbound request, with its body already collected.
#[derive(Debug, Default)]
pub struct ClientRequest {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Host the client addressed, from the Host header or the URI authority.
    pub host: String,
    /// Whether the request arrived over TLS.
    pub tls: bool,
}

impl ClientRequest {
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn raw_query(&self) -> &str {
        self.uri.query().unwrap_or("")
    }

    /// The original request-target (path plus query), as received.
    pub fn request_uri(&self) -> String {
        match self.uri.query() {
            Some(q) => format!("{}?{}", self.uri.path(), q),
            None => self.uri.path().to_string(),
        }
    }

    pub(crate) fn host_from_parts(headers: &HeaderMap, uri: &Uri) -> String {
        headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| uri.authority().map(|a| a.to_string()))
            .unwrap_or_default()
    }
}

/// The request derived from the client request and forwarded upstream.
///
/// `host` is the Host header override: empty means the endpoint fills it
/// with its own address. `scheme` is set by the forwarder from the
/// upstream's scheme override.
#[derive(Debug, Default)]
pub struct UpstreamRequest {
    pub method: Method,
    pub scheme: String,
    pub host: String,
    pub path: String,
    pub raw_query: String,
    pub headers: HeaderMap,
}

/// Wraps the client response: status, headers and the body being staged,
/// tracking whether the header was written and how many body bytes passed.
#[derive(Debug)]
pub struct ResponseWriter {
    status: StatusCode,
    headers: HeaderMap,
    body: BytesMut,
    wrote_header: bool,
    written: u64,
}

impl Default for ResponseWriter {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: BytesMut::new(),
            wrote_header: false,
            written: 0,
        }
    }
}

impl ResponseWriter {
    pub fn header_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Write the status line. Only the first call takes effect.
    pub fn write_header(&mut self, status: StatusCode) {
        if !self.wrote_header {
            self.status = status;
            self.wrote_header = true;
        }
    }

    /// Append body bytes, writing a 200 header first if none was written.
    pub fn write(&mut self, data: &[u8]) {
        if !self.wrote_header {
            self.write_header(StatusCode::OK);
        }
        self.body.extend_from_slice(data);
        self.written += data.len() as u64;
    }

    pub fn wrote_header(&self) -> bool {
        self.wrote_header
    }

    pub fn status_code(&self) -> StatusCode {
        self.status
    }

    /// Number of body bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// The staged body. Response-body callbacks may rewrite it in place.
    pub fn body_mut(&mut self) -> &mut BytesMut {
        &mut self.body
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Take the staged response out, leaving the writer reset.
    pub fn take_parts(&mut self) -> (StatusCode, HeaderMap, Bytes) {
        let status = self.status;
        let headers = std::mem::take(&mut self.headers);
        let body = self.body.split().freeze();
        self.reset();
        (status, headers, body)
    }

    fn reset(&mut self) {
        self.status = StatusCode::OK;
        self.headers.clear();
        self.body.clear();
        self.wrote_header = false;
        self.written = 0;
    }
}

/// Per-request context. One per concurrent request, acquired from the pool.
pub struct Context {
    pub route_id: String,
    pub upstream_id: String,
    pub endpoint_id: String,

    pub client_addr: SocketAddr,
    pub server_addr: SocketAddr,

    pub client_request: ClientRequest,
    pub client_response: ResponseWriter,

    pub upstream_request: Option<UpstreamRequest>,
    pub upstream_response: Option<reqwest::Response>,

    /// Deadline for the upstream round-trip, set by the matched route.
    pub forward_timeout: Option<Duration>,

    pub responder: Option<Arc<dyn Responder>>,

    pub aborted: bool,
    pub error: Option<StatusError>,

    /// Interim key-value cache, readable by processor directives as `$name`.
    pub kvs: HashMap<String, String>,

    queries: OnceLock<HashMap<String, Vec<String>>>,
    cookies: OnceLock<Vec<(String, String)>>,

    on_forward: Vec<Callback>,
    on_response_header: Vec<Callback>,
    on_response_body: Vec<Callback>,
}

fn unspecified_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    pub fn new() -> Self {
        Self {
            route_id: String::new(),
            upstream_id: String::new(),
            endpoint_id: String::new(),
            client_addr: unspecified_addr(),
            server_addr: unspecified_addr(),
            client_request: ClientRequest::default(),
            client_response: ResponseWriter::default(),
            upstream_request: None,
            upstream_response: None,
            forward_timeout: None,
            responder: None,
            aborted: false,
            error: None,
            kvs: HashMap::with_capacity(DEFAULT_CAP),
            queries: OnceLock::new(),
            cookies: OnceLock::new(),
            on_forward: Vec::with_capacity(DEFAULT_CAP),
            on_response_header: Vec::with_capacity(DEFAULT_CAP),
            on_response_body: Vec::with_capacity(DEFAULT_CAP),
        }
    }

    /// Reset to the initial state, preserving allocation capacity.
    pub fn reset(&mut self) {
        self.route_id.clear();
        self.upstream_id.clear();
        self.endpoint_id.clear();
        self.client_addr = unspecified_addr();
        self.server_addr = unspecified_addr();
        self.client_request = ClientRequest::default();
        self.client_response.reset();
        self.upstream_request = None;
        self.upstream_response = None;
        self.forward_timeout = None;
        self.responder = None;
        self.aborted = false;
        self.error = None;
        self.kvs.clear();
        self.queries = OnceLock::new();
        self.cookies = OnceLock::new();
        self.on_forward.clear();
        self.on_response_header.clear();
        self.on_response_body.clear();
    }

    /// Set the error and abort the request processing.
    pub fn abort(&mut self, err: StatusError) {
        self.aborted = true;
        self.error = Some(err);
    }

    pub fn client_ip(&self) -> IpAddr {
        self.client_addr.ip()
    }

    pub fn server_ip(&self) -> IpAddr {
        self.server_addr.ip()
    }

    /// The request id from the `X-Request-Id` header, or "".
    pub fn request_id(&self) -> &str {
        self.client_request
            .headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    }

    // ---------------------------------------------------------------- //
    // Lazy caches

    /// Parsed query string. Parsed once per request.
    pub fn queries(&self) -> &HashMap<String, Vec<String>> {
        self.queries
            .get_or_init(|| parse_query(self.client_request.raw_query()))
    }

    /// First value of the query parameter, or "".
    pub fn query(&self, name: &str) -> &str {
        self.queries()
            .get(name)
            .and_then(|vs| vs.first())
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Parsed `Cookie` header pairs. Parsed once per request.
    pub fn cookies(&self) -> &[(String, String)] {
        self.cookies.get_or_init(|| {
            self.client_request
                .headers
                .get(http::header::COOKIE)
                .and_then(|v| v.to_str().ok())
                .map(parse_cookies)
                .unwrap_or_default()
        })
    }

    /// The cookie value by name, or "".
    pub fn cookie(&self, name: &str) -> &str {
        self.cookies()
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .unwrap_or("")
    }

    // ---------------------------------------------------------------- //
    // Upstream request derivation

    /// The request forwarded to the upstream server, derived from the
    /// client request on first use. Hop-by-hop headers are dropped.
    pub fn upstream_request_mut(&mut self) -> &mut UpstreamRequest {
        if self.upstream_request.is_none() {
            let cr = &self.client_request;
            let mut headers = HeaderMap::with_capacity(cr.headers.len());
            for (k, v) in cr.headers.iter() {
                if !crate::responder::is_hop_by_hop(k.as_str()) {
                    headers.append(k.clone(), v.clone());
                }
            }
            self.upstream_request = Some(UpstreamRequest {
                method: cr.method.clone(),
                scheme: String::new(),
                host: cr.host.clone(),
                path: cr.path().to_string(),
                raw_query: cr.raw_query().to_string(),
                headers,
            });
        }
        self.upstream_request.as_mut().unwrap()
    }

    // ---------------------------------------------------------------- //
    // Callbacks

    /// Register a callback run just before the upstream dispatch.
    pub fn on_forward(&mut self, cb: impl FnOnce(&mut Context) + Send + Sync + 'static) {
        self.on_forward.push(Box::new(cb));
    }

    /// Register a callback run after the response status and headers are
    /// staged and before any body byte is written.
    pub fn on_response_header(&mut self, cb: impl FnOnce(&mut Context) + Send + Sync + 'static) {
        self.on_response_header.push(Box::new(cb));
    }

    /// Register a callback run after the response body copy completes.
    pub fn on_response_body(&mut self, cb: impl FnOnce(&mut Context) + Send + Sync + 'static) {
        self.on_response_body.push(Box::new(cb));
    }

    pub(crate) fn run_on_forward(&mut self) {
        let cbs = std::mem::take(&mut self.on_forward);
        self.run_callbacks(cbs, |c| &mut c.on_forward);
    }

    pub(crate) fn run_on_response_header(&mut self) {
        let cbs = std::mem::take(&mut self.on_response_header);
        self.run_callbacks(cbs, |c| &mut c.on_response_header);
    }

    pub(crate) fn run_on_response_body(&mut self) {
        let cbs = std::mem::take(&mut self.on_response_body);
        self.run_callbacks(cbs, |c| &mut c.on_response_body);
    }

    /// Runs the drained callbacks in insertion order, then puts the (now
    /// empty) vector back so its capacity survives the pool round-trip.
    /// Callbacks registered for the same phase while it runs are dropped,
    /// like appends during iteration over a snapshot.
    fn run_callbacks(
        &mut self,
        mut cbs: Vec<Callback>,
        slot: impl Fn(&mut Context) -> &mut Vec<Callback>,
    ) {
        for cb in cbs.drain(..) {
            cb(self);
        }
        let current = slot(self);
        if current.is_empty() {
            *current = cbs;
        }
    }

    #[cfg(test)]
    pub(crate) fn callback_capacities(&self) -> (usize, usize, usize) {
        (
            self.on_forward.capacity(),
            self.on_response_header.capacity(),
            self.on_response_body.capacity(),
        )
    }
}

fn parse_query(raw: &str) -> HashMap<String, Vec<String>> {
    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for pair in raw.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (k, v) = match pair.split_once('=') {
            Some((k, v)) => (k, v),
            None => (pair, ""),
        };
        out.entry(percent_decode(k))
            .or_default()
            .push(percent_decode(v));
    }
    out
}

fn parse_cookies(raw: &str) -> Vec<(String, String)> {
    raw.split(';')
        .filter_map(|part| {
            let part = part.trim();
            part.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes.get(i + 1..i + 3);
                match hex.and_then(|h| u8::from_str_radix(std::str::from_utf8(h).ok()?, 16).ok()) {
                    Some(b) => {
                        out.push(b);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Pool of request contexts, safe for concurrent acquire/release.
pub struct ContextPool {
    free: Mutex<Vec<Box<Context>>>,
}

impl Default for ContextPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextPool {
    pub fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn acquire(&self) -> Box<Context> {
        self.free
            .lock()
            .expect("context pool poisoned")
            .pop()
            .unwrap_or_else(|| Box::new(Context::new()))
    }

    pub fn release(&self, mut ctx: Box<Context>) {
        ctx.reset();
        self.free.lock().expect("context pool poisoned").push(ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn test_context() -> Context {
        let mut ctx = Context::new();
        ctx.client_request.method = Method::GET;
        ctx.client_request.uri = "/a/b?x=1&y=2&y=3".parse().unwrap();
        ctx.client_request.host = "example.com".into();
        ctx
    }

    #[test]
    fn test_query_parsing() {
        let ctx = test_context();
        assert_eq!(ctx.query("x"), "1");
        assert_eq!(ctx.query("y"), "2");
        assert_eq!(ctx.queries().get("y").unwrap().len(), 2);
        assert_eq!(ctx.query("missing"), "");
    }

    #[test]
    fn test_query_percent_decoding() {
        let mut ctx = Context::new();
        ctx.client_request.uri = "/p?name=hello%20world&b=a+b".parse().unwrap();
        assert_eq!(ctx.query("name"), "hello world");
        assert_eq!(ctx.query("b"), "a b");
    }

    #[test]
    fn test_cookie_parsing() {
        let mut ctx = Context::new();
        ctx.client_request
            .headers
            .insert(http::header::COOKIE, "a=1; b=2".parse().unwrap());
        assert_eq!(ctx.cookie("a"), "1");
        assert_eq!(ctx.cookie("b"), "2");
        assert_eq!(ctx.cookie("c"), "");
    }

    #[test]
    fn test_abort_sets_error() {
        let mut ctx = Context::new();
        assert!(!ctx.aborted);
        ctx.abort(StatusError::forbidden());
        assert!(ctx.aborted);
        assert_eq!(ctx.error.as_ref().unwrap().code, StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_upstream_request_derivation() {
        let mut ctx = test_context();
        ctx.client_request
            .headers
            .insert("x-custom", "v".parse().unwrap());
        ctx.client_request
            .headers
            .insert(http::header::CONNECTION, "keep-alive".parse().unwrap());

        let up = ctx.upstream_request_mut();
        assert_eq!(up.path, "/a/b");
        assert_eq!(up.raw_query, "x=1&y=2&y=3");
        assert_eq!(up.host, "example.com");
        assert!(up.headers.contains_key("x-custom"));
        assert!(!up.headers.contains_key("connection"));
    }

    #[test]
    fn test_callbacks_run_in_insertion_order() {
        let mut ctx = Context::new();
        ctx.on_forward(|c| {
            c.kvs.insert("order".into(), "1".into());
        });
        ctx.on_forward(|c| {
            let v = c.kvs.get("order").cloned().unwrap_or_default();
            c.kvs.insert("order".into(), format!("{}2", v));
        });
        ctx.run_on_forward();
        assert_eq!(ctx.kvs.get("order").unwrap(), "12");
    }

    #[test]
    fn test_callbacks_run_once() {
        let mut ctx = Context::new();
        ctx.on_response_header(|c| {
            let n: u32 = c.kvs.get("n").map(|s| s.parse().unwrap()).unwrap_or(0);
            c.kvs.insert("n".into(), (n + 1).to_string());
        });
        ctx.run_on_response_header();
        ctx.run_on_response_header();
        assert_eq!(ctx.kvs.get("n").unwrap(), "1");
    }

    #[test]
    fn test_response_writer_first_header_wins() {
        let mut w = ResponseWriter::default();
        assert!(!w.wrote_header());
        w.write_header(StatusCode::FORBIDDEN);
        w.write_header(StatusCode::OK);
        assert_eq!(w.status_code(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_response_writer_counts_bytes() {
        let mut w = ResponseWriter::default();
        w.write(b"hello");
        w.write(b" world");
        assert_eq!(w.written(), 11);
        assert_eq!(w.status_code(), StatusCode::OK);
        assert!(w.wrote_header());
    }

    #[test]
    fn test_pool_reset_preserves_capacity() {
        let pool = ContextPool::new();
        let mut ctx = pool.acquire();
        ctx.on_forward(|_| {});
        ctx.on_response_header(|_| {});
        ctx.on_response_body(|_| {});
        ctx.run_on_forward();
        ctx.run_on_response_header();
        ctx.run_on_response_body();
        ctx.route_id = "r1".into();
        pool.release(ctx);

        let ctx = pool.acquire();
        assert!(ctx.route_id.is_empty());
        assert!(!ctx.aborted);
        let (a, b, c) = ctx.callback_capacities();
        assert!(a >= DEFAULT_CAP && b >= DEFAULT_CAP && c >= DEFAULT_CAP);
    }

    #[test]
    fn test_pool_reuses_contexts() {
        let pool = ContextPool::new();
        let mut ctx = pool.acquire();
        ctx.kvs.insert("k".into(), "v".into());
        pool.release(ctx);
        let ctx = pool.acquire();
        assert!(ctx.kvs.is_empty());
    }
}
