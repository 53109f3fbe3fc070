//! TLS material for both proxy legs.
//!
//! The client-facing leg terminates TLS with a configured certificate pair,
//! falling back to a freshly generated self-signed certificate when the pair
//! cannot be loaded. The server-facing leg dials out with certificate
//! verification disabled: the proxy cannot present the backend's identity, so
//! verifying the backend's certificate chain buys nothing here.

use std::fs;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};

use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
    KeyUsagePurpose, PKCS_ECDSA_P384_SHA384,
};
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::{self, ClientConfig, ServerConfig};
use tokio_rustls::TlsConnector;
use tracing::{info, warn};

pub const DEFAULT_CERTIFICATE: &str = "xmppeeker.crt";
pub const DEFAULT_CERTIFICATE_KEY: &str = "xmppeeker.key";
pub const DEFAULT_CERTIFICATE_PATH: &str = "certs";

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: io::Error,
    },
    #[error("no certificate found in {0}")]
    NoCertificate(PathBuf),
    #[error("invalid pem: {0}")]
    Pem(#[source] io::Error),
    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),
    #[error("failed to save generated certificate: {0}")]
    Save(#[source] io::Error),
    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

/// Install the ring crypto provider (must happen once, before any TLS use).
pub fn init_crypto_provider() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Loads the configured certificate pair, or generates, saves, and uses a
/// self-signed one when loading fails.
pub fn load_or_generate_server_config(
    root: &Path,
    cert_path: &Path,
    key_path: &Path,
) -> Result<Arc<ServerConfig>, TlsError> {
    match load_keypair(cert_path, key_path) {
        Ok((certs, key)) => build_server_config(certs, key),
        Err(err) => {
            warn!(
                reason = %err,
                certificate = %cert_path.display(),
                key = %key_path.display(),
                "failed to load x509 key pair, generating a self-signed certificate"
            );
            let (cert_pem, key_pem) = generate_self_signed()?;
            save_generated(root, &cert_pem, &key_pem)?;
            let (certs, key) = parse_pem(cert_pem.as_bytes(), key_pem.as_bytes())
                .map_err(TlsError::Pem)?;
            build_server_config(certs, key)
        }
    }
}

/// Builds a client-leg TLS configuration from in-memory PEM text.
pub fn server_config_from_pem(
    cert_pem: &str,
    key_pem: &str,
) -> Result<Arc<ServerConfig>, TlsError> {
    let (certs, key) =
        parse_pem(cert_pem.as_bytes(), key_pem.as_bytes()).map_err(TlsError::Pem)?;
    build_server_config(certs, key)
}

fn build_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>, TlsError> {
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

fn load_keypair(
    cert_path: &Path,
    key_path: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TlsError> {
    let cert_pem = fs::read(cert_path).map_err(|source| TlsError::Read {
        path: cert_path.to_path_buf(),
        source,
    })?;
    let key_pem = fs::read(key_path).map_err(|source| TlsError::Read {
        path: key_path.to_path_buf(),
        source,
    })?;
    let (certs, key) = parse_pem(&cert_pem, &key_pem).map_err(TlsError::Pem)?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificate(cert_path.to_path_buf()));
    }
    Ok((certs, key))
}

fn parse_pem(
    cert_pem: &[u8],
    key_pem: &[u8],
) -> io::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_pem))
        .collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_pem))?
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no private key in pem"))?;
    Ok((certs, key))
}

/// Generates a self-signed ECDSA certificate for the proxy's client leg,
/// valid from one day in the past to ten years out.
pub fn generate_self_signed() -> Result<(String, String), TlsError> {
    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::OrganizationName, "XMPPeeker");

    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name;
    params.not_before = OffsetDateTime::now_utc() - Duration::days(1);
    params.not_after = OffsetDateTime::now_utc() + Duration::days(10 * 365);
    params.key_usages = vec![
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P384_SHA384)?;
    let cert = params.self_signed(&key_pair)?;
    Ok((cert.pem(), key_pair.serialize_pem()))
}

fn save_generated(root: &Path, cert_pem: &str, key_pem: &str) -> Result<(), TlsError> {
    let cert_dir = root.join(DEFAULT_CERTIFICATE_PATH);
    fs::create_dir_all(&cert_dir).map_err(TlsError::Save)?;

    let cert_file = cert_dir.join(DEFAULT_CERTIFICATE);
    fs::write(&cert_file, cert_pem).map_err(TlsError::Save)?;

    let key_file = cert_dir.join(DEFAULT_CERTIFICATE_KEY);
    fs::write(&key_file, key_pem).map_err(TlsError::Save)?;
    restrict_key_permissions(&key_file).map_err(TlsError::Save)?;

    info!(
        certificate = %cert_file.display(),
        key = %key_file.display(),
        "generated a self-signed certificate for use"
    );
    Ok(())
}

#[cfg(unix)]
fn restrict_key_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_key_permissions(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// TLS certificate verifier that accepts any backend certificate. The backend
/// connection is made on the user's explicit instruction and the proxy is
/// itself a man in the middle, so there is no identity to verify against.
#[derive(Debug)]
struct AcceptAnyServerCert(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Connector for the server leg's STARTTLS upgrade, with verification off.
pub fn insecure_connector() -> TlsConnector {
    let provider = rustls::crypto::ring::default_provider();
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(Arc::new(provider))))
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_certificate_round_trips_through_pem() {
        init_crypto_provider();
        let (cert_pem, key_pem) = generate_self_signed().unwrap();
        assert!(cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(key_pem.contains("PRIVATE KEY"));

        let (certs, key) = parse_pem(cert_pem.as_bytes(), key_pem.as_bytes()).unwrap();
        assert_eq!(certs.len(), 1);
        assert!(build_server_config(certs, key).is_ok());
    }

    #[test]
    fn fallback_generates_and_saves_keypair() {
        init_crypto_provider();
        let dir = tempfile::tempdir().unwrap();
        let missing_cert = dir.path().join("absent.crt");
        let missing_key = dir.path().join("absent.key");

        let config = load_or_generate_server_config(dir.path(), &missing_cert, &missing_key);
        assert!(config.is_ok());

        let cert_file = dir.path().join(DEFAULT_CERTIFICATE_PATH).join(DEFAULT_CERTIFICATE);
        let key_file = dir
            .path()
            .join(DEFAULT_CERTIFICATE_PATH)
            .join(DEFAULT_CERTIFICATE_KEY);
        assert!(cert_file.exists());
        assert!(key_file.exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&key_file).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        // The saved pair must load cleanly on the next start.
        assert!(load_or_generate_server_config(dir.path(), &cert_file, &key_file).is_ok());
    }

    #[test]
    fn insecure_connector_builds() {
        init_crypto_provider();
        let _connector = insecure_connector();
    }
}
