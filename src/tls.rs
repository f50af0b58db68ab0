//! TLS identity and rustls configuration for tlsrelay.
//!
//! This module provides:
//! - Ephemeral self-signed identity generation (RSA-2048, five year validity)
//! - SHA-256 fingerprint computation for logging
//! - rustls configuration builders for the server and client legs
//!
//! The identity is generated once per server process and never written to
//! disk. The client does not verify it; see [`build_client_config_insecure`].

use rcgen::{CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, SerialNumber};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, ServerConfig};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;
use time::{Date, Month, OffsetDateTime};

/// RSA modulus size of the generated key.
pub const RSA_KEY_BITS: usize = 2048;

/// Validity window of the generated certificate, in calendar years.
pub const IDENTITY_VALIDITY_YEARS: i32 = 5;

/// Serial number of every generated certificate.
pub const IDENTITY_SERIAL: u64 = 123_123;

/// Subject common name of every generated certificate.
pub const IDENTITY_COMMON_NAME: &str = "New Name";

/// Subject organization of every generated certificate.
pub const IDENTITY_ORGANIZATION: &str = "New Org.";

/// Error type for TLS operations.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("private key generation failed: {0}")]
    KeyGeneration(String),

    #[error("certificate generation failed: {0}")]
    CertificateGeneration(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),
}

/// Result type for TLS operations.
pub type TlsResult<T> = std::result::Result<T, TlsError>;

/// Self-signed certificate and private key presented by the server.
#[derive(Clone)]
pub struct TlsIdentity {
    /// Certificate in PEM format.
    pub cert_pem: String,
    /// PKCS#8 private key in PEM format.
    pub key_pem: String,
    /// Certificate in DER format.
    pub cert_der: Vec<u8>,
    /// PKCS#8 private key in DER format.
    pub key_der: Vec<u8>,
    /// Start of the validity window.
    pub not_before: OffsetDateTime,
    /// End of the validity window.
    pub not_after: OffsetDateTime,
    /// SHA-256 fingerprint of the certificate (colon-separated hex).
    pub fingerprint: String,
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field("fingerprint", &self.fingerprint)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Generates an ephemeral RSA-2048 self-signed identity.
///
/// The certificate is valid from now (whole seconds) until exactly
/// [`IDENTITY_VALIDITY_YEARS`] calendar years later. Serial number and
/// subject are fixed.
pub fn generate_self_signed_identity() -> TlsResult<TlsIdentity> {
    let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), RSA_KEY_BITS)
        .map_err(|e| TlsError::KeyGeneration(e.to_string()))?;

    let key_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| TlsError::KeyGeneration(e.to_string()))?;
    let key_der = private_key
        .to_pkcs8_der()
        .map_err(|e| TlsError::KeyGeneration(e.to_string()))?
        .as_bytes()
        .to_vec();

    let key_pair = KeyPair::from_pem_and_sign_algo(key_pem.as_str(), &rcgen::PKCS_RSA_SHA256)
        .map_err(|e| TlsError::KeyGeneration(e.to_string()))?;

    let not_before = now_whole_seconds()?;
    let not_after = years_after(not_before, IDENTITY_VALIDITY_YEARS)?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, IDENTITY_COMMON_NAME);
    dn.push(DnType::OrganizationName, IDENTITY_ORGANIZATION);
    params.distinguished_name = dn;
    params.serial_number = Some(SerialNumber::from(IDENTITY_SERIAL));
    params.not_before = not_before;
    params.not_after = not_after;
    params.is_ca = IsCa::ExplicitNoCa;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| TlsError::CertificateGeneration(e.to_string()))?;

    let cert_der = cert.der().to_vec();
    let fingerprint = compute_fingerprint(&cert_der);

    Ok(TlsIdentity {
        cert_pem: cert.pem(),
        key_pem: key_pem.as_str().to_owned(),
        cert_der,
        key_der,
        not_before,
        not_after,
        fingerprint,
    })
}

/// Current UTC time truncated to whole seconds, the resolution of X.509 validity.
fn now_whole_seconds() -> TlsResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(OffsetDateTime::now_utc().unix_timestamp())
        .map_err(|e| TlsError::CertificateGeneration(e.to_string()))
}

/// Adds whole calendar years. Feb 29 without a leap day in the target year becomes Mar 1.
fn years_after(start: OffsetDateTime, years: i32) -> TlsResult<OffsetDateTime> {
    let year = start.year() + years;
    match start.replace_year(year) {
        Ok(end) => Ok(end),
        Err(_) => {
            let date = Date::from_calendar_date(year, Month::March, 1)
                .map_err(|e| TlsError::CertificateGeneration(e.to_string()))?;
            Ok(start.replace_date(date))
        }
    }
}

/// Computes the SHA-256 fingerprint of a DER-encoded certificate.
///
/// Returns the fingerprint in colon-separated lowercase hex format.
pub fn compute_fingerprint(cert_der: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cert_der);
    let hash = hasher.finalize();
    format_fingerprint(&hash.into())
}

/// Formats a fingerprint as colon-separated lowercase hex.
pub fn format_fingerprint(bytes: &[u8; 32]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Builds the server TLS configuration presenting `identity`.
pub fn build_server_config(identity: &TlsIdentity) -> TlsResult<ServerConfig> {
    let certs = vec![CertificateDer::from(identity.cert_der.clone())];
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(identity.key_der.clone()));

    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TlsError::TlsConfig(e.to_string()))
}

/// Builds a client TLS configuration that accepts any server certificate.
///
/// Handshake signatures are still checked, so the session is encrypted to
/// whoever holds the presented key, but that key is not authenticated.
pub fn build_client_config_insecure() -> TlsResult<ClientConfig> {
    tracing::warn!(
        "TLS certificate verification is disabled; the tunnel is encrypted but the server is not authenticated"
    );

    Ok(ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
        .with_no_client_auth())
}

/// Certificate verifier that accepts any server certificate.
#[derive(Debug)]
struct InsecureVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
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
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
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
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
