//! TLS certificate management for the TCP acceptor.
//!
//! On first run, generates a local CA and server certificate so the server
//! can accept TLS connections out of the box; operators can drop in their own
//! PEM files instead. Produces the `rustls::ServerConfig` the acceptor wraps
//! sockets with.

use std::{
    io::BufReader,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use {
    anyhow::{Context, Result},
    rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose, SanType},
    rustls::ServerConfig,
    time::OffsetDateTime,
    tracing::info,
};

pub mod error;

pub use error::Error as TlsError;

/// The DNS name written into generated server certificates.
pub const SERVER_CERT_NAME: &str = "roost.localhost";

/// Trait for TLS certificate management, allowing alternative implementations.
pub trait CertStore: Send + Sync {
    /// Returns (ca_cert_path, server_cert_path, server_key_path).
    /// Generates certificates if they don't exist or are near expiry.
    fn ensure_certs(&self) -> Result<(PathBuf, PathBuf, PathBuf)>;

    /// Build a `rustls::ServerConfig` from the given cert and key PEM files.
    fn build_rustls_config(&self, cert: &Path, key: &Path) -> Result<Arc<ServerConfig>>;
}

/// Default file-system-backed certificate store.
pub struct FsCertStore {
    cert_dir: PathBuf,
}

impl FsCertStore {
    pub fn new() -> Result<Self> {
        Ok(Self {
            cert_dir: cert_dir()?,
        })
    }

    pub fn with_dir(dir: PathBuf) -> Self {
        Self { cert_dir: dir }
    }
}

/// Returns the certificate storage directory (`~/.config/roost/certs/`).
pub fn cert_dir() -> Result<PathBuf> {
    let dir = roost_config::config_dir()
        .unwrap_or_else(|| PathBuf::from(".roost"))
        .join("certs");
    std::fs::create_dir_all(&dir).context("failed to create certs directory")?;
    Ok(dir)
}

impl CertStore for FsCertStore {
    fn ensure_certs(&self) -> Result<(PathBuf, PathBuf, PathBuf)> {
        let ca_cert_path = self.cert_dir.join("ca.pem");
        let ca_key_path = self.cert_dir.join("ca-key.pem");
        let server_cert_path = self.cert_dir.join("server.pem");
        let server_key_path = self.cert_dir.join("server-key.pem");

        let need_regen = !ca_cert_path.exists()
            || !server_cert_path.exists()
            || !server_key_path.exists()
            || is_near_expiry(&server_cert_path, 30);

        if need_regen {
            info!("generating TLS certificates");
            let (ca_cert_pem, ca_key_pem, server_cert_pem, server_key_pem) = generate_all()?;
            std::fs::write(&ca_cert_path, &ca_cert_pem)?;
            std::fs::write(&ca_key_path, &ca_key_pem)?;
            std::fs::write(&server_cert_path, &server_cert_pem)?;
            std::fs::write(&server_key_path, &server_key_pem)?;
            info!(dir = %self.cert_dir.display(), "certificates written");
        }

        Ok((ca_cert_path, server_cert_path, server_key_path))
    }

    fn build_rustls_config(&self, cert: &Path, key: &Path) -> Result<Arc<ServerConfig>> {
        load_rustls_config(cert, key)
    }
}

/// Check if a PEM cert file is due for regeneration: within `days` of the
/// 1-year validity window by file age (proxy for expiry), or unreadable.
fn is_near_expiry(path: &Path, days: u64) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return true;
    };
    let Ok(modified) = meta.modified() else {
        return true;
    };
    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or_default();
    age > time::Duration::days(365 - days as i64).unsigned_abs()
}

/// Generate CA + server certificates. Returns (ca_cert, ca_key, server_cert, server_key) PEM strings.
fn generate_all() -> Result<(String, String, String, String)> {
    let now = OffsetDateTime::now_utc();

    // --- CA ---
    let ca_key = KeyPair::generate()?;
    let mut ca_params = CertificateParams::new(Vec::<String>::new())?;
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "Roost Local CA");
    ca_params
        .distinguished_name
        .push(DnType::OrganizationName, "Roost");
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    // 10-year validity from today.
    ca_params.not_before = now;
    ca_params.not_after = now + time::Duration::days(365 * 10);
    let ca_cert = ca_params.self_signed(&ca_key)?;

    // --- Server cert signed by CA ---
    let server_key = KeyPair::generate()?;
    let mut server_params = CertificateParams::new(vec![SERVER_CERT_NAME.to_string()])?;
    server_params
        .distinguished_name
        .push(DnType::CommonName, SERVER_CERT_NAME);
    server_params.subject_alt_names = vec![
        SanType::DnsName(SERVER_CERT_NAME.try_into()?),
        SanType::DnsName("localhost".try_into()?),
        SanType::IpAddress(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)),
        SanType::IpAddress(std::net::IpAddr::V6(std::net::Ipv6Addr::LOCALHOST)),
    ];
    // 1-year validity from today.
    server_params.not_before = now;
    server_params.not_after = now + time::Duration::days(365);
    let server_cert = server_params.signed_by(&server_key, &ca_cert, &ca_key)?;

    Ok((
        ca_cert.pem(),
        ca_key.serialize_pem(),
        server_cert.pem(),
        server_key.serialize_pem(),
    ))
}

/// Load cert + key PEM files into a `rustls::ServerConfig`.
///
/// No ALPN: the protocol on top is raw framed TCP, not HTTP.
pub fn load_rustls_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>> {
    // Ensure a crypto provider is installed (ring via feature flag).
    let _ = rustls::crypto::ring::default_provider().install_default();
    let cert_file = std::fs::File::open(cert_path).context("open server cert")?;
    let key_file = std::fs::File::open(key_path).context("open server key")?;

    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("parse certs")?;

    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .context("parse private key")?
        .context("no private key found")?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("build rustls ServerConfig")?;
    Ok(Arc::new(config))
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_all_produces_valid_pems() {
        let (ca_cert, ca_key, server_cert, server_key) = generate_all().unwrap();
        assert!(ca_cert.contains("BEGIN CERTIFICATE"));
        assert!(ca_key.contains("BEGIN PRIVATE KEY"));
        assert!(server_cert.contains("BEGIN CERTIFICATE"));
        assert!(server_key.contains("BEGIN PRIVATE KEY"));
    }

    #[test]
    fn certs_persist_to_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsCertStore::with_dir(tmp.path().to_path_buf());
        let (ca, cert, key) = store.ensure_certs().unwrap();
        assert!(ca.exists());
        assert!(cert.exists());
        assert!(key.exists());
    }

    #[test]
    fn certs_not_regenerated_if_fresh() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsCertStore::with_dir(tmp.path().to_path_buf());
        let (_, cert1, _) = store.ensure_certs().unwrap();
        let mtime1 = std::fs::metadata(&cert1).unwrap().modified().unwrap();

        // Second call should not regenerate.
        let (_, cert2, _) = store.ensure_certs().unwrap();
        let mtime2 = std::fs::metadata(&cert2).unwrap().modified().unwrap();
        assert_eq!(mtime1, mtime2);
    }

    #[test]
    fn load_rustls_config_from_generated_certs() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsCertStore::with_dir(tmp.path().to_path_buf());
        let (_ca, cert, key) = store.ensure_certs().unwrap();
        assert!(store.build_rustls_config(&cert, &key).is_ok());
    }

    #[test]
    fn near_expiry_for_missing_file() {
        assert!(is_near_expiry(Path::new("/nonexistent/file.pem"), 30));
    }

    #[test]
    fn load_fails_on_garbage_pem() {
        let tmp = tempfile::tempdir().unwrap();
        let cert = tmp.path().join("cert.pem");
        let key = tmp.path().join("key.pem");
        std::fs::write(&cert, "not a pem").unwrap();
        std::fs::write(&key, "not a pem").unwrap();
        assert!(load_rustls_config(&cert, &key).is_err());
    }
}
