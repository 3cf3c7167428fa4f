//! Endpoint — a single backend target performing one network attempt

use crate::context::Context;
use http::header::HOST;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

/// The process-wide upstream HTTP client: pooled connections, 3 s dial
/// timeout, 3-minute idle, and no redirect following (3xx relays as-is).
pub fn shared_client() -> reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT
        .get_or_init(|| {
            reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(3))
                .pool_idle_timeout(Duration::from_secs(180))
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .expect("failed to build the upstream http client")
        })
        .clone()
}

/// A concrete backend target, identified as "host:port".
#[derive(Debug)]
pub struct Endpoint {
    id: String,
    weight: u32,
    online: AtomicBool,
    active: AtomicUsize,
}

impl Endpoint {
    pub fn new(host: &str, port: u16, weight: u32) -> Self {
        let id = if port > 0 {
            format!("{}:{}", host, port)
        } else {
            host.to_string()
        };
        Self {
            id,
            weight: weight.max(1),
            online: AtomicBool::new(true),
            active: AtomicUsize::new(0),
        }
    }

    /// "host:port", also the address dialed.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Relaxed);
    }

    /// In-flight request count, used by the leastconn policy.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn inc_active(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_active(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Perform one HTTP round-trip for the context's upstream request.
    pub async fn serve(
        &self,
        ctx: &mut Context,
        client: &reqwest::Client,
    ) -> std::result::Result<reqwest::Response, reqwest::Error> {
        ctx.endpoint_id.clear();
        ctx.endpoint_id.push_str(&self.id);

        let body = ctx.client_request.body.clone();
        let up = ctx.upstream_request_mut();

        let scheme = if up.scheme.is_empty() { "http" } else { &up.scheme };
        let mut url = format!("{}://{}{}", scheme, self.id, up.path);
        if !up.raw_query.is_empty() {
            url.push('?');
            url.push_str(&up.raw_query);
        }

        let mut req = client
            .request(up.method.clone(), &url)
            .headers(up.headers.clone())
            .body(body);

        // An empty host means the endpoint fills in its own address, which
        // reqwest derives from the URL already.
        if !up.host.is_empty() {
            req = req.header(HOST, up.host.clone());
        }

        self.active.fetch_add(1, Ordering::Relaxed);
        let result = req.send().await;
        self.active.fetch_sub(1, Ordering::Relaxed);
        result
    }
}
