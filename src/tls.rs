//! TLS termination — rustls acceptor built from PEM files, hot-reloadable
//!
//! The acceptor is swapped atomically when a certs-reload signal arrives,
//! so new handshakes pick up renewed certificates without a restart.

use crate::config::boot::TlsFiles;
use crate::error::{GatewayError, Result};
use arc_swap::ArcSwap;
use rustls::ServerConfig;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Build a TLS acceptor from certificate and key files.
pub fn build_tls_acceptor(files: &TlsFiles) -> Result<TlsAcceptor> {
    let config = build_server_config(files)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn build_server_config(files: &TlsFiles) -> Result<ServerConfig> {
    let cert_file = std::fs::File::open(&files.cert_file).map_err(|e| {
        GatewayError::Tls(format!(
            "failed to open the certificate file {}: {}",
            files.cert_file, e
        ))
    })?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs: Vec<_> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| GatewayError::Tls(format!("failed to parse the certificate: {}", e)))?;
    if certs.is_empty() {
        return Err(GatewayError::Tls(format!(
            "no certificates found in {}",
            files.cert_file
        )));
    }

    let key_file = std::fs::File::open(&files.key_file).map_err(|e| {
        GatewayError::Tls(format!(
            "failed to open the key file {}: {}",
            files.key_file, e
        ))
    })?;
    let mut key_reader = BufReader::new(key_file);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| GatewayError::Tls(format!("failed to parse the private key: {}", e)))?
        .ok_or_else(|| {
            GatewayError::Tls(format!("no private key found in {}", files.key_file))
        })?;

    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| GatewayError::Tls(format!("TLS configuration error: {}", e)))
}

/// The live acceptor plus the file paths to rebuild it from.
pub struct TlsState {
    files: TlsFiles,
    acceptor: ArcSwap<TlsAcceptor>,
}

impl TlsState {
    pub fn new(files: TlsFiles) -> Result<Self> {
        let acceptor = build_tls_acceptor(&files)?;
        Ok(Self {
            files,
            acceptor: ArcSwap::from_pointee(acceptor),
        })
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        self.acceptor.load().as_ref().clone()
    }

    /// Rebuild the acceptor from the files and swap it in.
    pub fn reload(&self) -> Result<()> {
        let acceptor = build_tls_acceptor(&self.files)?;
        self.acceptor.store(Arc::new(acceptor));
        tracing::info!(
            cert = %self.files.cert_file,
            key = %self.files.key_file,
            "reloaded the TLS certificates"
        );
        Ok(())
    }
}
