//! Pinned-fingerprint TLS verification.
//!
//! Instead of chain validation, the server is trusted iff any certificate it
//! presents has a public key whose SHA-256 hash matches the pinned
//! fingerprint. This is the same trust model as
//! `curl --pinnedpubkey 'sha256//<fingerprint>'`.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, ServerName, UnixTime},
    DigitallySignedStruct, OtherError, SignatureScheme,
};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::{ClientError, ClientResult};

/// Parse a curl-style fingerprint into the raw SHA-256 hash it encodes.
///
/// The leading `sha256//` is optional.
pub fn decode_fingerprint(fingerprint: &str) -> ClientResult<[u8; 32]> {
    let b64 = fingerprint.strip_prefix("sha256//").unwrap_or(fingerprint);
    let raw = BASE64
        .decode(b64)
        .map_err(|e| ClientError::InvalidFingerprint(e.to_string()))?;
    raw.try_into()
        .map_err(|_| ClientError::InvalidFingerprint("not a SHA-256 hash".to_string()))
}

/// A rustls client config which trusts exactly the pinned public key.
pub fn pinned_tls_config(fingerprint: &str) -> ClientResult<rustls::ClientConfig> {
    let verifier = PinnedCertVerifier::new(decode_fingerprint(fingerprint)?);
    Ok(rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth())
}

/// Accepts any presented certificate whose public key hashes to the pin.
#[derive(Debug)]
pub struct PinnedCertVerifier {
    pin: [u8; 32],
}

impl PinnedCertVerifier {
    pub fn new(pin: [u8; 32]) -> Self {
        Self { pin }
    }

    /// Whether this certificate's SubjectPublicKeyInfo hashes to the pin.
    fn matches(&self, cert: &CertificateDer<'_>) -> bool {
        let Ok((_, parsed)) = X509Certificate::from_der(cert) else {
            return false;
        };
        let hash: [u8; 32] = Sha256::digest(parsed.tbs_certificate.subject_pki.raw).into();
        bool::from(hash.ct_eq(&self.pin))
    }
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if std::iter::once(end_entity)
            .chain(intermediates.iter())
            .any(|cert| self.matches(cert))
        {
            return Ok(ServerCertVerified::assertion());
        }
        Err(rustls::Error::Other(OtherError(Arc::new(
            ClientError::NoMatchingCertificate,
        ))))
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ED25519,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
        ]
    }
}
