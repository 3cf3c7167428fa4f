//! Boot configuration — the static settings the process starts with
//!
//! Everything here is fixed for the process lifetime: listen addresses,
//! TLS files, log level and the provider directories. It can come from an
//! optional TOML file, with CLI flags taking precedence. The dynamic
//! configuration (routes, upstreams, groups) never lives here.

use super::duration;
use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootConfig {
    /// The address used by the gateway, e.g. ":80" or "0.0.0.0:8080".
    pub gateway_addr: String,
    /// The address used by the manager; empty disables it.
    pub manager_addr: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
    pub tls: TlsFiles,
    pub provider: ProviderSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsFiles {
    pub cert_file: String,
    pub key_file: String,
}

impl TlsFiles {
    pub fn configured(&self) -> bool {
        !self.cert_file.is_empty() && !self.key_file.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    /// Directory of the local files storing the routes.
    pub routes_dir: String,
    /// Directory of the local files storing the upstreams.
    pub upstreams_dir: String,
    /// Directory of the local files storing the middleware groups.
    pub middleware_groups_dir: String,
    /// Interval to check and reload the configurations.
    #[serde(with = "duration")]
    pub interval: Duration,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            routes_dir: "routes".into(),
            upstreams_dir: "upstreams".into(),
            middleware_groups_dir: "middlewaregroups".into(),
            interval: Duration::from_secs(60),
        }
    }
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            gateway_addr: ":80".into(),
            manager_addr: String::new(),
            log_level: "info".into(),
            tls: TlsFiles::default(),
            provider: ProviderSettings::default(),
        }
    }
}

impl BootConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        toml::from_str(&content)
            .map_err(|e| GatewayError::Config(format!("failed to parse {}: {}", path.display(), e)))
    }

    /// Resolve the gateway listen address; a bare ":80" binds all interfaces.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        parse_listen_addr(&self.gateway_addr)
    }

    /// Resolve the manager listen address, or None when disabled.
    pub fn manager_listen_addr(&self) -> Result<Option<SocketAddr>> {
        if self.manager_addr.is_empty() {
            return Ok(None);
        }
        parse_listen_addr(&self.manager_addr).map(Some)
    }
}

fn parse_listen_addr(addr: &str) -> Result<SocketAddr> {
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    };
    full.parse()
        .map_err(|e| GatewayError::Config(format!("invalid listen address '{}': {}", addr, e)))
}
