//! Device identity and trust-on-first-use certificate handling.
//!
//! The receiver presents a self-signed certificate. Senders do not validate
//! it against any chain: the certificate is captured during the handshake,
//! its short fingerprint is shown on both devices, and the human comparing
//! the two is the trust anchor. A sender that already knows the fingerprint
//! can pin it, in which case any other certificate fails the handshake.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::{DigitallySignedStruct, SignatureScheme};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use lanvault_common::{Error, Result};

/// Bytes of the SHA-256 digest kept in a fingerprint.
pub const FINGERPRINT_BYTES: usize = 8;

const CERT_FILENAME: &str = "cert.pem";
const KEY_FILENAME: &str = "key.pem";

/// Short human-comparable fingerprint of a DER certificate.
///
/// Standard base64 of the first FINGERPRINT_BYTES of its SHA-256.
pub fn fingerprint(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    STANDARD.encode(&digest[..FINGERPRINT_BYTES])
}

/// Text shown to the operator for out-of-band comparison.
pub fn display_string(fingerprint: &str) -> String {
    format!(
        "Certificate Fingerprint: {}\nPlease verify this matches on both devices",
        fingerprint
    )
}

/// The ring provider used for every TLS config in this crate.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn tls_error(context: &str, e: impl fmt::Display) -> Error {
    Error::Tls(format!("{}: {}", context, e))
}

/// Loaded certificate and key.
pub struct Identity {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub cert_der: CertificateDer<'static>,
    key_der: PrivateKeyDer<'static>,
}

impl Identity {
    pub fn fingerprint(&self) -> String {
        fingerprint(self.cert_der.as_ref())
    }

    /// Server config presenting this identity, HTTP/1.1 only.
    pub fn server_config(&self) -> Result<rustls::ServerConfig> {
        let mut config = rustls::ServerConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| tls_error("Protocol versions", e))?
            .with_no_client_auth()
            .with_single_cert(vec![self.cert_der.clone()], self.key_der.clone_key())
            .map_err(|e| tls_error("Invalid certificate or key", e))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(config)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("cert_path", &self.cert_path)
            .field("key_path", &self.key_path)
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// Location of the device's TLS identity.
#[derive(Debug, Clone)]
pub struct TrustStore {
    dir: PathBuf,
    hostnames: Vec<String>,
}

impl TrustStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            hostnames: Vec::new(),
        }
    }

    /// Additional names or addresses to include when a certificate is generated.
    pub fn with_hostnames(mut self, hostnames: Vec<String>) -> Self {
        self.hostnames = hostnames;
        self
    }

    pub fn cert_path(&self) -> PathBuf {
        self.dir.join(CERT_FILENAME)
    }

    pub fn key_path(&self) -> PathBuf {
        self.dir.join(KEY_FILENAME)
    }

    /// Load the identity, generating one on first use.
    ///
    /// # Postconditions
    /// - The same certificate is returned on every call once it exists
    ///
    /// # Errors
    /// - `Tls` if generation fails or the stored files cannot be parsed
    pub fn ensure_identity(&self) -> Result<Identity> {
        let cert_path = self.cert_path();
        let key_path = self.key_path();

        if !(cert_path.exists() && key_path.exists()) {
            self.generate()?;
        }

        let cert_der = CertificateDer::from_pem_file(&cert_path)
            .map_err(|e| tls_error("Cannot read certificate", e))?;
        let key_der = PrivateKeyDer::from_pem_file(&key_path)
            .map_err(|e| tls_error("Cannot read private key", e))?;

        Ok(Identity {
            cert_path,
            key_path,
            cert_der,
            key_der,
        })
    }

    fn generate(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;

        let mut names = vec!["localhost".to_string(), "127.0.0.1".to_string()];
        for name in &self.hostnames {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }

        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(names)
                .map_err(|e| tls_error("Certificate generation failed", e))?;

        write_private(&self.key_path(), key_pair.serialize_pem().as_bytes())?;
        std::fs::write(self.cert_path(), cert.pem())?;

        info!(
            fingerprint = %fingerprint(cert.der().as_ref()),
            "Generated self-signed certificate"
        );
        Ok(())
    }
}

#[cfg(unix)]
fn write_private(path: &Path, data: &[u8]) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(data)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private(path: &Path, data: &[u8]) -> Result<()> {
    std::fs::write(path, data)?;
    Ok(())
}

/// Certificate captured from the most recent handshake.
#[derive(Debug, Clone, Default)]
pub struct CapturedCertificate {
    inner: Arc<Mutex<Option<CertificateDer<'static>>>>,
}

impl CapturedCertificate {
    fn store(&self, cert: CertificateDer<'static>) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = Some(cert);
    }

    pub fn der(&self) -> Option<CertificateDer<'static>> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn fingerprint(&self) -> Option<String> {
        self.der().map(|der| fingerprint(der.as_ref()))
    }
}

/// Client-side verifier that accepts the peer certificate without chain
/// validation and records it.
///
/// Handshake signatures are still checked against the presented key, so
/// the peer must hold the private key of the certificate it shows.
#[derive(Debug)]
pub struct TofuVerifier {
    provider: Arc<CryptoProvider>,
    captured: CapturedCertificate,
    expected: Option<String>,
}

impl TofuVerifier {
    pub fn new(
        provider: Arc<CryptoProvider>,
        captured: CapturedCertificate,
        expected: Option<String>,
    ) -> Self {
        Self {
            provider,
            captured,
            expected: expected.map(|fp| fp.trim().to_string()),
        }
    }
}

impl ServerCertVerifier for TofuVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        self.captured.store(end_entity.clone().into_owned());

        if let Some(expected) = &self.expected {
            let actual = fingerprint(end_entity.as_ref());
            if &actual != expected {
                warn!(%expected, %actual, "Peer certificate fingerprint mismatch");
                return Err(rustls::Error::General(
                    "server certificate fingerprint mismatch".to_string(),
                ));
            }
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
