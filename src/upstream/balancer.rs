//! Load-balancing policies over an upstream's online endpoints

use super::endpoint::Endpoint;
use crate::error::{GatewayError, Result};
use rand::Rng;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A balancing policy, with the aliases the wire format accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    RoundRobin,
    WeightRoundRobin,
    Random,
    WeightRandom,
    LeastConn,
    SourceIpHash,
}

impl Policy {
    pub fn parse(s: &str) -> Result<Policy> {
        match s {
            "" | "roundrobin" | "rr" => Ok(Policy::RoundRobin),
            "weight_roundrobin" | "wrr" => Ok(Policy::WeightRoundRobin),
            "random" | "r" => Ok(Policy::Random),
            "weight_random" | "wr" => Ok(Policy::WeightRandom),
            "leastconn" | "lc" => Ok(Policy::LeastConn),
            "sourceip_hash" | "sh" | "iphash" | "hash_sourceip" | "hash(sourceip)" => {
                Ok(Policy::SourceIpHash)
            }
            other => Err(GatewayError::Config(format!(
                "unknown balancer policy '{}'",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Policy::RoundRobin => "roundrobin",
            Policy::WeightRoundRobin => "weight_roundrobin",
            Policy::Random => "random",
            Policy::WeightRandom => "weight_random",
            Policy::LeastConn => "leastconn",
            Policy::SourceIpHash => "sourceip_hash",
        }
    }
}

/// Selects one online endpoint per dispatch attempt.
pub struct Balancer {
    policy: Policy,
    counter: AtomicUsize,
}

impl Balancer {
    pub fn new(policy: Policy) -> Self {
        Self {
            policy,
            counter: AtomicUsize::new(0),
        }
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// Select an endpoint. `exclude` names the endpoint of the previous
    /// failed attempt; it is skipped when another candidate exists.
    pub fn select(
        &self,
        endpoints: &[Arc<Endpoint>],
        client_ip: IpAddr,
        exclude: Option<&str>,
    ) -> Option<Arc<Endpoint>> {
        if endpoints.is_empty() {
            return None;
        }

        let filtered: Vec<&Arc<Endpoint>> = match exclude {
            Some(id) if endpoints.len() > 1 => {
                endpoints.iter().filter(|ep| ep.id() != id).collect()
            }
            _ => endpoints.iter().collect(),
        };
        if filtered.is_empty() {
            return None;
        }

        let chosen = match self.policy {
            Policy::RoundRobin => {
                let idx = self.counter.fetch_add(1, Ordering::Relaxed) % filtered.len();
                filtered[idx]
            }

            Policy::WeightRoundRobin => {
                let total: u64 = filtered.iter().map(|ep| ep.weight() as u64).sum();
                let turn = (self.counter.fetch_add(1, Ordering::Relaxed) as u64) % total;
                pick_by_weight(&filtered, turn)
            }

            Policy::Random => {
                let idx = rand::thread_rng().gen_range(0..filtered.len());
                filtered[idx]
            }

            Policy::WeightRandom => {
                let total: u64 = filtered.iter().map(|ep| ep.weight() as u64).sum();
                let turn = rand::thread_rng().gen_range(0..total);
                pick_by_weight(&filtered, turn)
            }

            Policy::LeastConn => filtered
                .iter()
                .min_by_key(|ep| ep.active())
                .copied()
                .expect("filtered is non-empty"),

            Policy::SourceIpHash => {
                let mut hasher = DefaultHasher::new();
                client_ip.hash(&mut hasher);
                let idx = (hasher.finish() as usize) % filtered.len();
                filtered[idx]
            }
        };

        Some(chosen.clone())
    }
}

fn pick_by_weight<'a>(endpoints: &[&'a Arc<Endpoint>], turn: u64) -> &'a Arc<Endpoint> {
    let mut cumulative = 0u64;
    for ep in endpoints {
        cumulative += ep.weight() as u64;
        if turn < cumulative {
            return ep;
        }
    }
    endpoints[endpoints.len() - 1]
}
