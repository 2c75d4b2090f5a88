//! Ephemeral certificate authority for the intercepting proxy.
//!
//! A fresh P-256 key and self-signed CA certificate are generated on every
//! process start and never persisted. The browser is configured to tolerate
//! the untrusted authority; that is acceptable only because the proxy
//! listener lives on loopback inside the sandbox.

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, PKCS_ECDSA_P256_SHA256,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use time::{Duration, OffsetDateTime};
use tracing::debug;

use crate::error::ProxyError;

/// Validity window on either side of "now". The skew back in time keeps the
/// certificate valid on appliances whose clock has not synced yet.
const VALIDITY_WINDOW: Duration = Duration::days(30);

/// A freshly generated CA certificate and private key, DER-encoded.
pub struct EphemeralCa {
    cert: CertificateDer<'static>,
    key: PrivateKeyDer<'static>,
}

impl EphemeralCa {
    /// Generates a new P-256 self-signed CA.
    ///
    /// Properties: CA=true with path length zero; key usages
    /// certSign/digitalSignature/keyEncipherment; extended usages
    /// serverAuth/clientAuth; valid from 30 days ago to 30 days ahead.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Certificate`] if key or certificate generation
    /// fails.
    pub fn generate() -> Result<Self, ProxyError> {
        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;

        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params
            .distinguished_name
            .push(DnType::OrganizationName, "webkiosk");
        params
            .distinguished_name
            .push(DnType::OrganizationalUnitName, "egress");
        params.distinguished_name.push(DnType::CommonName, "proxy");

        let now = OffsetDateTime::now_utc();
        params.not_before = now - VALIDITY_WINDOW;
        params.not_after = now + VALIDITY_WINDOW;

        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let cert = params.self_signed(&key_pair)?;
        debug!("Generated ephemeral proxy CA");

        Ok(Self {
            cert: cert.der().clone(),
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der())),
        })
    }

    /// Builds a rustls server configuration terminating TLS 1.3 with this CA.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::TlsConfig`] if rustls rejects the certificate
    /// or key.
    pub fn server_config(&self) -> Result<ServerConfig, ProxyError> {
        let provider = std::sync::Arc::new(rustls::crypto::ring::default_provider());
        let mut config = ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_no_client_auth()
            .with_single_cert(vec![self.cert.clone()], self.key.clone_key())?;

        // The proxy speaks HTTP/1.1 only; CONNECT tunnels rely on it.
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(config)
    }
}

impl std::fmt::Debug for EphemeralCa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralCa")
            .field("cert_der_len", &self.cert.len())
            .finish_non_exhaustive()
    }
}
