use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use arc_swap::ArcSwapOption;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{AcmeProvider, CertError, Config};

/// A loaded manual certificate together with the leaf expiry extracted at
/// load time, so the watcher can inspect it without re-parsing.
struct LoadedCert {
    key: Arc<CertifiedKey>,
    not_after: OffsetDateTime,
}

/// Certificate manager. Cheap to share behind an `Arc`; the handshake
/// path performs only atomic loads.
pub struct Manager {
    cfg: Config,
    current: ArcSwapOption<LoadedCert>,
    use_acme: AtomicBool,
    acme: Option<Arc<dyn AcmeProvider>>,
    watcher_started: AtomicBool,
}

impl Manager {
    /// Create a manager and attempt the initial manual-certificate load.
    ///
    /// A failed initial load is not fatal: with ACME enabled the manager
    /// starts in fallback mode, without it every handshake fails until
    /// the watcher manages a reload.
    pub fn new(cfg: Config, acme: Option<Arc<dyn AcmeProvider>>) -> Self {
        let manager = Self {
            cfg,
            current: ArcSwapOption::empty(),
            use_acme: AtomicBool::new(false),
            acme,
            watcher_started: AtomicBool::new(false),
        };

        if !manager.cfg.cert_file.is_empty() {
            if let Err(err) = manager.reload_from_disk() {
                warn!(error = %err, "Failed to load manual certificate on startup");
                if manager.acme_enabled() {
                    info!("Falling back to ACME immediately");
                    manager.use_acme.store(true, Ordering::SeqCst);
                }
            }
        } else if manager.acme_enabled() {
            manager.use_acme.store(true, Ordering::SeqCst);
        }

        manager
    }

    fn acme_enabled(&self) -> bool {
        self.cfg.acme.enabled && self.acme.is_some()
    }

    /// Start the background file watcher. Idempotent; the watcher stops
    /// when `shutdown` is cancelled. Without configured file paths there
    /// is nothing to watch.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) {
        if self.watcher_started.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.cfg.cert_file.is_empty() || self.cfg.key_file.is_empty() {
            return;
        }

        let manager = self.clone();
        tokio::spawn(async move {
            let poll = manager.cfg.poll_interval();
            let mut last_mod = std::fs::metadata(&manager.cfg.cert_file)
                .ok()
                .and_then(|m| m.modified().ok());
            let start = tokio::time::Instant::now() + poll;
            let mut ticker = tokio::time::interval_at(start, poll);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Certificate watcher stopped");
                        return;
                    }
                    _ = ticker.tick() => manager.watch_tick(&mut last_mod),
                }
            }
        });
    }

    /// Handshake hot path. No locks, no syscalls in the manual case.
    pub fn get_certificate(
        &self,
        server_name: Option<&str>,
    ) -> Result<Arc<CertifiedKey>, CertError> {
        if self.use_acme.load(Ordering::Relaxed) {
            match &self.acme {
                Some(acme) => {
                    if let Some(key) = acme.resolve(server_name) {
                        return Ok(key);
                    }
                    return Err(no_certificate(server_name));
                }
                None => {
                    warn!("ACME fallback requested but no provider is initialized, using manual certificate");
                }
            }
        }

        if let Some(loaded) = self.current.load_full() {
            return Ok(loaded.key.clone());
        }

        // Manual certificate unavailable; last resort is ACME even when
        // the fallback flag is not set.
        if let Some(acme) = &self.acme {
            if let Some(key) = acme.resolve(server_name) {
                return Ok(key);
            }
        }
        Err(no_certificate(server_name))
    }

    /// Wrap an HTTP router with the provider's challenge interception, or
    /// return it unchanged when ACME is not initialized.
    pub fn http_challenge_router(&self, fallback: axum::Router) -> axum::Router {
        match &self.acme {
            Some(acme) => acme.wrap_http(fallback),
            None => fallback,
        }
    }

    /// Whether the manager is currently delegating to ACME.
    pub fn using_acme(&self) -> bool {
        self.use_acme.load(Ordering::Relaxed)
    }

    /// One watcher iteration. `last_mod` is the certificate file mtime at
    /// the last observation (watcher start or successful reload); the
    /// recovery path compares against it to avoid re-reading a file that
    /// keeps failing to load.
    fn watch_tick(&self, last_mod: &mut Option<SystemTime>) {
        let metadata = match std::fs::metadata(&self.cfg.cert_file) {
            Ok(m) => m,
            Err(err) => {
                if self.acme_enabled() && !self.use_acme.load(Ordering::SeqCst) {
                    warn!(error = %err, "Certificate file missing, switching to ACME");
                    self.use_acme.store(true, Ordering::SeqCst);
                }
                return;
            }
        };
        let modified = metadata.modified().ok();

        let in_recovery = self.use_acme.load(Ordering::SeqCst);
        if in_recovery || modified != *last_mod {
            // In recovery mode an unchanged mtime means the previous load
            // of this exact file already failed; retrying would hot-loop.
            if in_recovery && modified == *last_mod {
                return;
            }

            match self.reload_from_disk() {
                Err(err) => error!(error = %err, "Failed to reload certificate"),
                Ok(()) => {
                    *last_mod = modified;
                    if self.use_acme.load(Ordering::SeqCst) {
                        info!("Certificate restored, switching back to manual mode");
                        self.use_acme.store(false, Ordering::SeqCst);
                    }
                }
            }
        }

        if !self.use_acme.load(Ordering::SeqCst) {
            self.check_expiry();
        }
    }

    /// Load the PEM pair from disk, parse the leaf expiry, and atomically
    /// replace the slot.
    fn reload_from_disk(&self) -> Result<(), CertError> {
        let cert_pem = std::fs::read(&self.cfg.cert_file).map_err(|err| CertError::Load {
            path: self.cfg.cert_file.clone(),
            source: err.into(),
        })?;
        let key_pem = std::fs::read(&self.cfg.key_file).map_err(|err| CertError::Load {
            path: self.cfg.key_file.clone(),
            source: err.into(),
        })?;

        let (certified, not_after) = certified_from_pem(&cert_pem, &key_pem, &self.cfg.cert_file)?;
        self.current.store(Some(Arc::new(LoadedCert {
            key: Arc::new(certified),
            not_after,
        })));

        info!(
            file = %self.cfg.cert_file,
            expires = %not_after,
            "Certificate loaded from file"
        );
        Ok(())
    }

    /// Manual mode only: flip to ACME when the leaf is inside the
    /// fallback threshold.
    fn check_expiry(&self) {
        let Some(loaded) = self.current.load_full() else {
            return;
        };

        let time_left = loaded.not_after - OffsetDateTime::now_utc();
        let threshold = time::Duration::days(i64::from(self.cfg.fallback_threshold_days));

        if time_left < threshold && self.acme_enabled() && !self.use_acme.load(Ordering::SeqCst) {
            warn!(
                time_left_hours = time_left.whole_hours(),
                threshold_days = self.cfg.fallback_threshold_days,
                "Manual certificate is expiring soon, switching to ACME fallback"
            );
            self.use_acme.store(true, Ordering::SeqCst);
        }
    }
}

fn no_certificate(server_name: Option<&str>) -> CertError {
    CertError::NoCertificate {
        server_name: server_name.unwrap_or("<unknown>").to_string(),
    }
}

/// Build a rustls `CertifiedKey` from PEM bytes and return it with the
/// leaf's `NotAfter`.
fn certified_from_pem(
    cert_pem: &[u8],
    key_pem: &[u8],
    path: &str,
) -> Result<(CertifiedKey, OffsetDateTime), CertError> {
    let load_err = |source: anyhow::Error| CertError::Load {
        path: path.to_string(),
        source,
    };

    let chain = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| load_err(err.into()))?;
    if chain.is_empty() {
        return Err(load_err(anyhow::anyhow!("no certificate found in {path}")));
    }

    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|err| load_err(err.into()))?
        .ok_or_else(|| load_err(anyhow::anyhow!("no private key found")))?;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|err| load_err(anyhow::anyhow!(err)))?;

    let (_, leaf) = x509_parser::parse_x509_certificate(chain[0].as_ref())
        .map_err(|err| load_err(anyhow::anyhow!("failed to parse leaf certificate: {err}")))?;
    let not_after = OffsetDateTime::from_unix_timestamp(leaf.validity().not_after.timestamp())
        .map_err(|err| load_err(anyhow::anyhow!("invalid NotAfter timestamp: {err}")))?;

    Ok((CertifiedKey::new(chain, signing_key), not_after))
}

/// rustls `ResolvesServerCert` adapter over a shared [`Manager`].
pub struct Resolver {
    manager: Arc<Manager>,
}

impl Resolver {
    pub fn new(manager: Arc<Manager>) -> Self {
        Self { manager }
    }
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for Resolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        match self.manager.get_certificate(client_hello.server_name()) {
            Ok(key) => Some(key),
            Err(err) => {
                warn!(error = %err, "TLS handshake failed to resolve a certificate");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn write_cert(dir: &Path, valid_for: time::Duration) -> (String, String) {
        let mut params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        params.not_before = OffsetDateTime::now_utc() - time::Duration::hours(1);
        params.not_after = OffsetDateTime::now_utc() + valid_for;
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key_pair).unwrap();

        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, cert.pem()).unwrap();
        std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();
        (
            cert_path.to_string_lossy().into_owned(),
            key_path.to_string_lossy().into_owned(),
        )
    }

    fn manual_config(cert_file: String, key_file: String) -> Config {
        Config {
            cert_file,
            key_file,
            ..Config::default()
        }
    }

    struct StaticProvider {
        key: Arc<CertifiedKey>,
    }

    impl StaticProvider {
        fn from_dir(dir: &Path) -> Arc<Self> {
            // Own subdirectory so the provider's PEM pair never collides
            // with the manual certificate under test.
            let dir = dir.join("acme-static");
            std::fs::create_dir_all(&dir).unwrap();
            let (cert_file, key_file) = write_cert(&dir, time::Duration::hours(1));
            let cert_pem = std::fs::read(cert_file).unwrap();
            let key_pem = std::fs::read(key_file).unwrap();
            let (certified, _) = certified_from_pem(&cert_pem, &key_pem, "static").unwrap();
            Arc::new(Self {
                key: Arc::new(certified),
            })
        }
    }

    impl AcmeProvider for StaticProvider {
        fn resolve(&self, _server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
            Some(self.key.clone())
        }

        fn wrap_http(&self, fallback: axum::Router) -> axum::Router {
            fallback
        }
    }

    #[test]
    fn manual_certificate_happy_path() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_file, key_file) = write_cert(dir.path(), time::Duration::hours(1));
        let manager = Manager::new(manual_config(cert_file, key_file), None);

        assert!(!manager.using_acme());
        let key = manager.get_certificate(Some("example.com")).unwrap();
        assert!(!key.cert.is_empty());
    }

    #[test]
    fn missing_certificate_without_acme_fails_per_handshake() {
        let manager = Manager::new(Config::default(), None);
        let err = manager.get_certificate(Some("example.com")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "no certificate available for example.com"
        );
    }

    #[test]
    fn unreadable_certificate_with_acme_starts_in_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let provider = StaticProvider::from_dir(dir.path());
        let cfg = Config {
            cert_file: dir.path().join("missing.pem").to_string_lossy().into_owned(),
            key_file: dir.path().join("missing-key.pem").to_string_lossy().into_owned(),
            acme: crate::AcmeConfig {
                enabled: true,
                ..Default::default()
            },
            ..Config::default()
        };

        let manager = Manager::new(cfg, Some(provider));
        assert!(manager.using_acme());
        assert!(manager.get_certificate(Some("example.com")).is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reads_during_reloads_see_whole_certificates() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_file, key_file) = write_cert(dir.path(), time::Duration::hours(1));
        let manager = Arc::new(Manager::new(manual_config(cert_file, key_file), None));

        let stop = Arc::new(AtomicBool::new(false));
        let mut readers = Vec::new();
        for _ in 0..100 {
            let manager = manager.clone();
            let stop = stop.clone();
            readers.push(tokio::spawn(async move {
                while !stop.load(Ordering::Relaxed) {
                    let key = manager
                        .get_certificate(Some("example.com"))
                        .expect("reader observed a missing certificate");
                    assert!(!key.cert.is_empty());
                    tokio::task::yield_now().await;
                }
            }));
        }

        for _ in 0..50 {
            write_cert(dir.path(), time::Duration::hours(1));
            manager
                .reload_from_disk()
                .expect("reload failed under read load");
        }

        stop.store(true, Ordering::Relaxed);
        for reader in readers {
            reader.await.unwrap();
        }
    }

    #[test]
    fn watcher_flips_to_acme_when_file_disappears() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_file, key_file) = write_cert(dir.path(), time::Duration::hours(1));
        let provider = StaticProvider::from_dir(dir.path());
        let mut cfg = manual_config(cert_file.clone(), key_file);
        cfg.acme.enabled = true;

        let manager = Manager::new(cfg, Some(provider));
        assert!(!manager.using_acme());

        std::fs::remove_file(&cert_file).unwrap();
        let mut last_mod = None;
        manager.watch_tick(&mut last_mod);
        assert!(manager.using_acme());
    }

    #[test]
    fn recovery_skips_unchanged_mtime_and_reloads_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let provider = StaticProvider::from_dir(dir.path());

        // Start with garbage on disk: initial load fails, fallback engages.
        let cert_file = dir.path().join("cert.pem");
        let key_file = dir.path().join("key.pem");
        std::fs::write(&cert_file, "not a certificate").unwrap();
        std::fs::write(&key_file, "not a key").unwrap();

        let mut cfg = manual_config(
            cert_file.to_string_lossy().into_owned(),
            key_file.to_string_lossy().into_owned(),
        );
        cfg.acme.enabled = true;
        let manager = Manager::new(cfg, Some(provider));
        assert!(manager.using_acme());

        // Replace the garbage with a valid pair, but feed the tick the
        // file's current mtime: recovery must skip, not retry.
        write_cert(dir.path(), time::Duration::hours(1));
        let current_mtime = std::fs::metadata(&cert_file).unwrap().modified().unwrap();
        let mut last_mod = Some(current_mtime);
        manager.watch_tick(&mut last_mod);
        assert!(manager.using_acme(), "unchanged mtime must not trigger a reload");

        // With an older observation the tick reloads and restores manual mode.
        let mut last_mod = Some(current_mtime - std::time::Duration::from_secs(3600));
        manager.watch_tick(&mut last_mod);
        assert!(!manager.using_acme());
        assert_eq!(last_mod, Some(current_mtime));
    }

    #[test]
    fn near_expiry_flips_to_acme_in_manual_mode() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_file, key_file) = write_cert(dir.path(), time::Duration::days(5));
        let provider = StaticProvider::from_dir(dir.path());
        let mut cfg = manual_config(cert_file.clone(), key_file);
        cfg.acme.enabled = true;
        cfg.fallback_threshold_days = 30;

        let manager = Manager::new(cfg, Some(provider));
        assert!(!manager.using_acme());

        let mut last_mod = std::fs::metadata(&cert_file)
            .unwrap()
            .modified()
            .ok();
        manager.watch_tick(&mut last_mod);
        assert!(manager.using_acme(), "5 days left is under the 30 day threshold");
    }

    #[test]
    fn far_expiry_stays_manual() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_file, key_file) = write_cert(dir.path(), time::Duration::days(90));
        let provider = StaticProvider::from_dir(dir.path());
        let mut cfg = manual_config(cert_file.clone(), key_file);
        cfg.acme.enabled = true;

        let manager = Manager::new(cfg, Some(provider));
        let mut last_mod = std::fs::metadata(&cert_file)
            .unwrap()
            .modified()
            .ok();
        manager.watch_tick(&mut last_mod);
        assert!(!manager.using_acme());
    }
}
