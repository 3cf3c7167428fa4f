//! Active health checks — HTTP or TCP probes flipping endpoint online flags
//!
//! The checker owns its per-endpoint consecutive-failure counters; only the
//! boolean online flips are published to the discovery. An endpoint goes
//! offline on the N-th consecutive failure and back online on the first
//! success.

use super::discovery::StaticDiscovery;
use crate::config::{HealthCheckConfig, HealthCheckRequest};
use std::sync::Arc;
use std::time::Duration;

pub(super) struct HealthChecker {
    cfg: HealthCheckConfig,
    discovery: Arc<StaticDiscovery>,
    failures: Vec<u32>,
    client: reqwest::Client,
}

impl HealthChecker {
    pub(super) fn new(cfg: HealthCheckConfig, discovery: Arc<StaticDiscovery>) -> Self {
        let failures = vec![0; discovery.len()];
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_default();
        Self {
            cfg,
            discovery,
            failures,
            client,
        }
    }

    pub(super) async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.cfg.interval.max(Duration::from_millis(100)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.check_all().await;
        }
    }

    async fn check_all(&mut self) {
        let endpoints: Vec<_> = self.discovery.endpoints().to_vec();
        for (i, ep) in endpoints.iter().enumerate() {
            let ok = self.probe(ep.id()).await;
            let was_online = ep.is_online();

            if ok {
                self.failures[i] = 0;
                if !was_online {
                    self.discovery.set_online(ep.id(), true);
                    tracing::info!(endpoint = ep.id(), "endpoint back online");
                }
            } else {
                self.failures[i] = self.failures[i].saturating_add(1);
                if was_online && self.failures[i] >= self.cfg.failure.max(1) {
                    self.discovery.set_online(ep.id(), false);
                    tracing::warn!(
                        endpoint = ep.id(),
                        failures = self.failures[i],
                        "endpoint offline"
                    );
                }
            }
        }
    }

    async fn probe(&self, addr: &str) -> bool {
        let default_request = HealthCheckRequest::default();
        let req = self.cfg.request.as_ref().unwrap_or(&default_request);

        if req.scheme == "tcp" {
            return tokio::time::timeout(self.cfg.timeout, tokio::net::TcpStream::connect(addr))
                .await
                .map(|r| r.is_ok())
                .unwrap_or(false);
        }

        let scheme = if req.scheme.is_empty() { "http" } else { &req.scheme };
        let path = if req.path.is_empty() { "/" } else { &req.path };
        let url = format!("{}://{}{}", scheme, addr, path);
        let method = req
            .method
            .parse::<http::Method>()
            .unwrap_or(http::Method::GET);

        let mut builder = self.client.request(method, &url);
        if !req.host.is_empty() {
            builder = builder.header(http::header::HOST, req.host.clone());
        }
        for (k, v) in &req.headers {
            builder = builder.header(k.as_str(), v.as_str());
        }

        match builder.send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}
