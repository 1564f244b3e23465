//! Certificate manager for the TLS front
//! Issues and caches per-host certificates, resolved at handshake time via
//! SNI and gated by the host-allow policy.

use anyhow::{Context, Result};
use dashmap::DashMap;
use rcgen::generate_simple_self_signed;
use rustls::crypto::ring::sign::any_supported_type;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::fmt;
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Decides whether a certificate may be served for a hostname. Hosts that
/// fail the policy are denied at the TLS handshake.
pub type HostPolicy = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Certificate manager: per-host issuance, an in-memory cache, an on-disk PEM
/// cache surviving restarts, and the HTTP-01 challenge store served by the
/// plain-HTTP listener.
pub struct CertificateManager {
    certs_dir: PathBuf,
    issued: DashMap<String, Arc<CertifiedKey>>,
    acme_challenges: DashMap<String, String>,
    is_host_allowed: HostPolicy,
}

impl CertificateManager {
    pub fn new<P: AsRef<Path>>(certs_dir: P, is_host_allowed: HostPolicy) -> Result<Self> {
        let certs_dir = certs_dir.as_ref().to_path_buf();
        fs::create_dir_all(&certs_dir)
            .with_context(|| format!("creating certificate directory {}", certs_dir.display()))?;

        Ok(Self {
            certs_dir,
            issued: DashMap::new(),
            acme_challenges: DashMap::new(),
            is_host_allowed,
        })
    }

    /// TLS configuration resolving certificates per hostname at handshake
    /// time. Hosts failing the allow policy get no certificate, which denies
    /// the handshake.
    pub fn server_config(self: &Arc<Self>) -> Arc<ServerConfig> {
        let resolver = Arc::new(HostCertResolver {
            manager: Arc::clone(self),
        });
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(resolver);
        Arc::new(config)
    }

    fn certified_key_for(&self, host: &str) -> Option<Arc<CertifiedKey>> {
        if !(self.is_host_allowed)(host) {
            debug!(host, "certificate denied by host policy");
            return None;
        }

        if let Some(key) = self.issued.get(host) {
            return Some(Arc::clone(key.value()));
        }

        let key = match self.load_cached(host) {
            Ok(Some(key)) => key,
            Ok(None) => match self.issue(host) {
                Ok(key) => key,
                Err(err) => {
                    warn!(host, %err, "certificate issuance failed");
                    return None;
                }
            },
            Err(err) => {
                warn!(host, %err, "cached certificate unusable, reissuing");
                match self.issue(host) {
                    Ok(key) => key,
                    Err(err) => {
                        warn!(host, %err, "certificate issuance failed");
                        return None;
                    }
                }
            }
        };

        let key = Arc::new(key);
        self.issued.insert(host.to_string(), Arc::clone(&key));
        Some(key)
    }

    /// Load a previously issued certificate from the PEM cache.
    fn load_cached(&self, host: &str) -> Result<Option<CertifiedKey>> {
        let (cert_path, key_path) = self.paths_for(host);
        if !cert_path.exists() || !key_path.exists() {
            return Ok(None);
        }

        let mut reader = BufReader::new(fs::File::open(&cert_path)?);
        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut reader).collect::<std::io::Result<_>>()?;

        let mut reader = BufReader::new(fs::File::open(&key_path)?);
        let key = rustls_pemfile::private_key(&mut reader)?
            .with_context(|| format!("no private key in {}", key_path.display()))?;

        let signing_key = any_supported_type(&key).context("cached private key is unusable")?;
        Ok(Some(CertifiedKey::new(certs, signing_key)))
    }

    /// Issue a certificate for the host and persist it for restarts.
    fn issue(&self, host: &str) -> Result<CertifiedKey> {
        info!(host, "issuing certificate");

        let cert = generate_simple_self_signed(vec![host.to_string()])?;

        let cert_der = CertificateDer::from(cert.serialize_der()?);
        let key_der =
            PrivateKeyDer::from(PrivatePkcs8KeyDer::from(cert.serialize_private_key_der()));
        let signing_key = any_supported_type(&key_der).context("generated key is unusable")?;

        let (cert_path, key_path) = self.paths_for(host);
        fs::write(&cert_path, cert.serialize_pem()?)?;
        fs::write(&key_path, cert.serialize_private_key_pem())?;

        Ok(CertifiedKey::new(vec![cert_der], signing_key))
    }

    fn paths_for(&self, host: &str) -> (PathBuf, PathBuf) {
        let stem = Self::sanitize_host(host);
        (
            self.certs_dir.join(format!("{}.crt", stem)),
            self.certs_dir.join(format!("{}.key", stem)),
        )
    }

    /// Sanitize a hostname for use as a filename.
    fn sanitize_host(host: &str) -> String {
        host.replace('*', "wildcard").replace('/', "_")
    }

    /// Store an HTTP-01 challenge token.
    pub fn store_acme_challenge(&self, token: &str, key_authorization: &str) {
        self.acme_challenges
            .insert(token.to_string(), key_authorization.to_string());
    }

    /// Look up the key authorization for a challenge token.
    pub fn acme_challenge(&self, token: &str) -> Option<String> {
        self.acme_challenges.get(token).map(|v| v.value().clone())
    }

    pub fn remove_acme_challenge(&self, token: &str) {
        self.acme_challenges.remove(token);
    }

    pub fn certs_dir(&self) -> &Path {
        &self.certs_dir
    }
}

/// SNI-keyed resolver backing the acceptor; consults the host policy on
/// every handshake.
struct HostCertResolver {
    manager: Arc<CertificateManager>,
}

impl fmt::Debug for HostCertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostCertResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for HostCertResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        let host = client_hello.server_name()?.to_string();
        self.manager.certified_key_for(&host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn allow_example_com() -> HostPolicy {
        Arc::new(|host: &str| host.ends_with("example.com"))
    }

    #[test]
    fn test_issuance_gated_by_policy() {
        let dir = tempdir().unwrap();
        let manager = CertificateManager::new(dir.path(), allow_example_com()).unwrap();

        assert!(manager.certified_key_for("t.example.com").is_some());
        assert!(manager.certified_key_for("evil.org").is_none());

        assert!(dir.path().join("t.example.com.crt").exists());
        assert!(dir.path().join("t.example.com.key").exists());
        assert!(!dir.path().join("evil.org.crt").exists());
    }

    #[test]
    fn test_issued_certificate_is_cached_and_reloaded() {
        let dir = tempdir().unwrap();

        let manager = CertificateManager::new(dir.path(), allow_example_com()).unwrap();
        let first = manager.certified_key_for("t.example.com").unwrap();
        let second = manager.certified_key_for("t.example.com").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        // A fresh manager over the same directory picks up the PEM cache
        // instead of issuing again.
        let reloaded = CertificateManager::new(dir.path(), allow_example_com()).unwrap();
        assert!(reloaded.certified_key_for("t.example.com").is_some());
    }

    #[test]
    fn test_sanitize_host() {
        assert_eq!(
            CertificateManager::sanitize_host("*.example.com"),
            "wildcard.example.com"
        );
        assert_eq!(CertificateManager::sanitize_host("a.com"), "a.com");
    }

    #[test]
    fn test_acme_challenge_storage() {
        let dir = tempdir().unwrap();
        let manager = CertificateManager::new(dir.path(), allow_example_com()).unwrap();

        manager.store_acme_challenge("token123", "key-auth-value");
        assert_eq!(
            manager.acme_challenge("token123"),
            Some("key-auth-value".to_string())
        );

        manager.remove_acme_challenge("token123");
        assert!(manager.acme_challenge("token123").is_none());
    }
}
