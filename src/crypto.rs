//! # Certificate Infrastructure
//!
//! TLS material for mutually-authenticated transports:
//!
//! - Self-signed X.509 device certificates carrying an Ed25519 key
//! - rustls client/server configurations with fingerprint-binding verifiers
//! - Extraction of the device fingerprint from a peer certificate
//!
//! ## Identity Binding
//!
//! Certificates are not chained to a CA. A certificate is valid for a device
//! when the fingerprint of its embedded public key equals the expected
//! [`DeviceId`] and the account's certificate store accepts the chain. On
//! the client side the expected fingerprint travels in the SNI (hex, split
//! into two DNS labels); on the server side any structurally valid Ed25519
//! client certificate passing the store's trust policy is admitted and the
//! fingerprint is checked after the handshake against the negotiating peer.
//!
//! ## SECURITY WARNING
//!
//! The `dangerous()` APIs are used intentionally - verification binds
//! identity to the key fingerprint, not to CA-signed chains.

use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::identity::{DeviceCertificate, DeviceId, DeviceKeypair};
use crate::protocols::CertificateStore;

/// Lazily-initialized crypto provider for rustls.
/// Uses ring as the underlying cryptographic implementation.
static CRYPTO_PROVIDER: std::sync::LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    std::sync::LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// ALPN protocol identifier. All dhtlink transports use this to prevent
/// accidental cross-protocol connections.
pub const ALPN: &[u8] = b"dhtlink";

pub fn generate_device_certificate(
    keypair: &DeviceKeypair,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let secret_key = keypair.secret_key_bytes();

    const ED25519_OID: [u8; 5] = [0x06, 0x03, 0x2b, 0x65, 0x70];
    const PKCS8_VERSION: [u8; 3] = [0x02, 0x01, 0x00];

    let mut pkcs8 = Vec::with_capacity(48);
    pkcs8.extend_from_slice(&[0x30, 0x2e]);
    pkcs8.extend_from_slice(&PKCS8_VERSION);
    pkcs8.extend_from_slice(&[0x30, 0x05]);
    pkcs8.extend_from_slice(&ED25519_OID);
    pkcs8.extend_from_slice(&[0x04, 0x22, 0x04, 0x20]);
    pkcs8.extend_from_slice(&secret_key);

    let pkcs8_der = PrivatePkcs8KeyDer::from(pkcs8.clone());
    let key_pair = rcgen::KeyPair::try_from(&pkcs8_der)
        .context("failed to create Ed25519 key pair for certificate")?;

    let mut params = rcgen::CertificateParams::new(vec!["dhtlink".to_string()])
        .context("failed to create certificate params")?;

    params.distinguished_name.push(
        rcgen::DnType::CommonName,
        rcgen::DnValue::Utf8String(keypair.device_id().to_hex()),
    );

    let cert = params
        .self_signed(&key_pair)
        .context("failed to generate self-signed Ed25519 certificate")?;

    let key = PrivateKeyDer::Pkcs8(pkcs8.into());
    let cert_der = CertificateDer::from(cert.der().to_vec());

    Ok((vec![cert_der], key))
}

pub fn extract_public_key_from_cert(cert_der: &[u8]) -> Option<[u8; 32]> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;

    let spki = cert.public_key();
    let key_bytes = &spki.subject_public_key.data;

    if key_bytes.len() == 32 {
        let mut key = [0u8; 32];
        key.copy_from_slice(key_bytes);
        Some(key)
    } else {
        None
    }
}

/// Fingerprint of the key inside a DER certificate, if it carries a
/// 32-byte Ed25519 key.
pub fn extract_device_id_from_cert(cert_der: &[u8]) -> Option<DeviceId> {
    extract_public_key_from_cert(cert_der).map(|pk| DeviceId::from_public_key(&pk))
}

impl DeviceCertificate {
    /// Parse an untrusted DER certificate into a device certificate record.
    /// Rejects certificates without an extractable Ed25519 key.
    pub fn from_der(der: Vec<u8>) -> Result<Self> {
        let device_id =
            extract_device_id_from_cert(&der).context("certificate carries no Ed25519 key")?;
        Ok(Self::from_parts(der, device_id, None))
    }
}

/// Encode the expected peer fingerprint as an SNI host name.
/// 64 hex chars exceed the 63-byte DNS label limit, so split in two labels.
pub(crate) fn device_id_to_sni(device_id: &DeviceId) -> String {
    let hex = device_id.to_hex();
    format!("{}.{}", &hex[..32], &hex[32..])
}

pub(crate) fn parse_device_id_from_sni(sni: &str) -> Option<DeviceId> {
    let hex_str: String = sni.split('.').collect();
    DeviceId::from_hex(&hex_str)
}

pub fn create_client_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    store: Arc<dyn CertificateStore>,
) -> Result<rustls::ClientConfig> {
    let verifier = FingerprintServerVerifier { store };

    let mut client_crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(certs, key)
        .context("failed to create client TLS config with client auth")?;
    client_crypto.alpn_protocols = vec![ALPN.to_vec()];

    Ok(client_crypto)
}

pub fn create_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    store: Arc<dyn CertificateStore>,
) -> Result<rustls::ServerConfig> {
    let client_cert_verifier = Arc::new(FingerprintClientVerifier { store });
    let mut server_crypto = rustls::ServerConfig::builder()
        .with_client_cert_verifier(client_cert_verifier)
        .with_single_cert(certs, key)
        .context("failed to create server TLS config")?;
    server_crypto.alpn_protocols = vec![ALPN.to_vec()];

    Ok(server_crypto)
}

fn chain_to_records(
    end_entity: &CertificateDer<'_>,
    intermediates: &[CertificateDer<'_>],
) -> Result<Vec<DeviceCertificate>, rustls::Error> {
    let mut chain = Vec::with_capacity(1 + intermediates.len());
    for der in std::iter::once(end_entity).chain(intermediates.iter()) {
        let record = DeviceCertificate::from_der(der.as_ref().to_vec()).map_err(|_| {
            rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding)
        })?;
        chain.push(record);
    }
    Ok(chain)
}

#[derive(Debug)]
struct FingerprintClientVerifier {
    store: Arc<dyn CertificateStore>,
}

impl rustls::server::danger::ClientCertVerifier for FingerprintClientVerifier {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        let chain = chain_to_records(end_entity, intermediates)?;
        if !self.store.verify(&chain) {
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ));
        }

        Ok(rustls::server::danger::ClientCertVerified::assertion())
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
            &CRYPTO_PROVIDER.signature_verification_algorithms,
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
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

#[derive(Debug)]
struct FingerprintServerVerifier {
    store: Arc<dyn CertificateStore>,
}

impl rustls::client::danger::ServerCertVerifier for FingerprintServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        let expected_sni = match server_name {
            rustls::pki_types::ServerName::DnsName(name) => name.as_ref(),
            _ => {
                return Err(rustls::Error::InvalidCertificate(
                    rustls::CertificateError::ApplicationVerificationFailure,
                ));
            }
        };

        let expected_id = parse_device_id_from_sni(expected_sni).ok_or_else(|| {
            rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding)
        })?;

        let actual_id = extract_device_id_from_cert(end_entity.as_ref()).ok_or(
            rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding),
        )?;

        if actual_id != expected_id {
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::NotValidForName,
            ));
        }

        let chain = chain_to_records(end_entity, intermediates)?;
        if !self.store.verify(&chain) {
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ));
        }

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
            &CRYPTO_PROVIDER.signature_verification_algorithms,
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
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }
}
