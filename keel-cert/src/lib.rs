//! TLS certificate management with hot reload and ACME fallback.
//!
//! [`Manager`] supplies a certificate on every TLS handshake. The
//! handshake read path is lock-free: the currently loaded certificate
//! lives in an atomically swappable slot and is only ever replaced by the
//! single background watcher task. When the manual certificate file is
//! missing, unreadable, or close to expiry, the manager can fall back to
//! an [`AcmeProvider`] supplied by the caller. The ACME protocol itself
//! lives behind that trait; this crate only decides when to delegate.

mod manager;

use std::sync::Arc;
use std::time::Duration;

use rustls::sign::CertifiedKey;
use serde::Deserialize;
use thiserror::Error;

pub use manager::{Manager, Resolver};

/// ACME fallback configuration. The fields mirror what an ACME provider
/// implementation needs; `keel-cert` itself only reads `enabled`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AcmeConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub email: String,
    /// Domains the provider may answer for; empty means no restriction.
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub cache_dir: String,
}

impl AcmeConfig {
    /// Cache directory, defaulting to `./certs-cache` when unset.
    pub fn cache_dir(&self) -> &str {
        if self.cache_dir.is_empty() {
            "./certs-cache"
        } else {
            &self.cache_dir
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// PEM certificate chain path. Empty disables the manual certificate.
    #[serde(default)]
    pub cert_file: String,
    /// PEM private key path.
    #[serde(default)]
    pub key_file: String,
    #[serde(default)]
    pub acme: AcmeConfig,
    /// Remaining-lifetime threshold below which the manager switches to
    /// ACME (manual mode only).
    #[serde(default = "default_fallback_threshold_days")]
    pub fallback_threshold_days: u32,
    /// Filesystem polling period of the background watcher.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cert_file: String::new(),
            key_file: String::new(),
            acme: AcmeConfig::default(),
            fallback_threshold_days: default_fallback_threshold_days(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl Config {
    pub(crate) fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

fn default_fallback_threshold_days() -> u32 {
    30
}

fn default_poll_interval_secs() -> u64 {
    60
}

/// Certificate source used when the manual certificate is unavailable.
/// Implementations wrap an ACME client (issuance, renewal, caching); the
/// manager only decides *when* to delegate.
pub trait AcmeProvider: Send + Sync + 'static {
    /// Resolve a certificate for the handshake's SNI, if the provider has
    /// (or can obtain) one.
    fn resolve(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>>;

    /// Wrap an HTTP router so HTTP-01 challenge requests are intercepted
    /// before reaching the application.
    fn wrap_http(&self, fallback: axum::Router) -> axum::Router;
}

#[derive(Debug, Error)]
pub enum CertError {
    #[error("no certificate available for {server_name}")]
    NoCertificate { server_name: String },

    #[error("failed to load certificate from {path}: {source}")]
    Load {
        path: String,
        #[source]
        source: anyhow::Error,
    },
}
