//! Static discovery — the endpoint set backing an upstream
//!
//! Endpoints are held in a stable order (weight descending, then host,
//! then port) so `discover()` returns a deterministic online snapshot.
//! When a health check is configured, `start()` launches the checker task
//! which flips the per-endpoint online flags through `set_online`.

use super::endpoint::Endpoint;
use super::health_check::HealthChecker;
use crate::config::{HealthCheckConfig, StaticDiscoveryConfig};
use crate::error::{GatewayError, Result};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

pub struct StaticDiscovery {
    endpoints: Vec<Arc<Endpoint>>,
    health: Option<HealthCheckConfig>,
    checker: Mutex<Option<JoinHandle<()>>>,
}

impl StaticDiscovery {
    pub fn new(cfg: &StaticDiscoveryConfig) -> Result<Self> {
        let mut servers = cfg.servers.clone();
        for s in &servers {
            if s.host.is_empty() {
                return Err(GatewayError::Config(
                    "discovery server host must not be empty".into(),
                ));
            }
        }

        servers.sort_by(|a, b| {
            b.weight
                .cmp(&a.weight)
                .then_with(|| a.host.cmp(&b.host))
                .then_with(|| a.port.cmp(&b.port))
        });

        let endpoints = servers
            .iter()
            .map(|s| Arc::new(Endpoint::new(&s.host, s.port, s.weight)))
            .collect();

        let health = match &cfg.health_check {
            Some(hc) if !hc.disable => Some(hc.clone()),
            _ => None,
        };

        Ok(Self {
            endpoints,
            health,
            checker: Mutex::new(None),
        })
    }

    /// All endpoints, online or not, in stable order.
    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    pub fn get(&self, id: &str) -> Option<Arc<Endpoint>> {
        self.endpoints.iter().find(|ep| ep.id() == id).cloned()
    }

    pub fn set_online(&self, id: &str, online: bool) {
        if let Some(ep) = self.endpoints.iter().find(|ep| ep.id() == id) {
            ep.set_online(online);
        }
    }

    /// The online endpoints, in the same stable order.
    pub fn discover(&self) -> Vec<Arc<Endpoint>> {
        self.endpoints
            .iter()
            .filter(|ep| ep.is_online())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn health_check(&self) -> Option<&HealthCheckConfig> {
        self.health.as_ref()
    }

    /// Start the health checker, if one is configured. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let Some(cfg) = self.health.clone() else {
            return;
        };
        let mut slot = self.checker.lock().expect("discovery lock poisoned");
        if slot.is_some() {
            return;
        }
        let checker = HealthChecker::new(cfg, self.clone());
        *slot = Some(tokio::spawn(checker.run()));
    }

    /// Stop the health checker, if running.
    pub fn stop(&self) {
        if let Some(handle) = self.checker.lock().expect("discovery lock poisoned").take() {
            handle.abort();
        }
    }
}

impl Drop for StaticDiscovery {
    fn drop(&mut self) {
        if let Some(handle) = self.checker.get_mut().expect("discovery lock poisoned").take() {
            handle.abort();
        }
    }
}
