//! TLS configuration utilities for client-facing listeners and backend links

use crate::error::{Result, SpqrError};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Loaded TLS material
pub struct TlsConfig {
    /// Certificate chain in DER format
    pub cert_chain: Vec<CertificateDer<'static>>,
    /// Private key in DER format (stored as bytes for cloning)
    private_key_bytes: Vec<u8>,
}

impl TlsConfig {
    /// Get the private key
    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::try_from(self.private_key_bytes.clone())
            .expect("private key bytes were validated at TlsConfig construction")
    }

    /// Load TLS config from PEM files
    pub fn from_pem_files(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
        let cert_pem = fs::read(cert_path.as_ref())
            .map_err(|e| SpqrError::Internal(format!("failed to read cert: {}", e)))?;
        let key_pem = fs::read(key_path.as_ref())
            .map_err(|e| SpqrError::Internal(format!("failed to read key: {}", e)))?;

        let cert_chain = Self::parse_pem_certs(&cert_pem)?;
        let private_key = Self::parse_pem_key(&key_pem)?;

        let private_key_bytes = match &private_key {
            PrivateKeyDer::Pkcs1(key) => key.secret_pkcs1_der().to_vec(),
            PrivateKeyDer::Sec1(key) => key.secret_sec1_der().to_vec(),
            PrivateKeyDer::Pkcs8(key) => key.secret_pkcs8_der().to_vec(),
            _ => return Err(SpqrError::Internal("unsupported key format".into())),
        };

        Ok(Self {
            cert_chain,
            private_key_bytes,
        })
    }

    /// Parse PEM-encoded certificates
    fn parse_pem_certs(pem_data: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
        let mut reader = std::io::BufReader::new(pem_data);
        let certs = rustls_pemfile::certs(&mut reader)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| SpqrError::Internal(format!("failed to parse certificates: {}", e)))?;
        Ok(certs)
    }

    /// Parse PEM-encoded private key
    fn parse_pem_key(pem_data: &[u8]) -> Result<PrivateKeyDer<'static>> {
        let mut reader = std::io::BufReader::new(pem_data);

        let key = rustls_pemfile::private_key(&mut reader)
            .map_err(|e| SpqrError::Internal(format!("failed to parse private key: {}", e)))?
            .ok_or_else(|| SpqrError::Internal("no private key found".into()))?;

        Ok(key)
    }
}

impl Clone for TlsConfig {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            private_key_bytes: self.private_key_bytes.clone(),
        }
    }
}

/// Create a rustls server config for accepting TLS connections
pub fn create_server_tls_config(config: &TlsConfig) -> Result<rustls::ServerConfig> {
    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(config.cert_chain.clone(), config.private_key())
        .map_err(|e| SpqrError::Internal(format!("failed to create server config: {}", e)))?;

    Ok(server_config)
}

/// Create a rustls client config for backend TLS upgrades.
///
/// Shards commonly run with self-signed certificates, so peer
/// verification is skipped; the upgrade protects the link, not identity.
pub fn create_client_tls_config() -> rustls::ClientConfig {
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoCertificateVerification))
        .with_no_client_auth()
}

/// Certificate verifier that accepts any certificate
#[derive(Debug)]
struct NoCertificateVerification;

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
