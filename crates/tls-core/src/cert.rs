//! Self-signed certificate generation and fingerprinting.

use std::{net::IpAddr, path::Path, time::Duration};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rcgen::{
    CertificateParams, DnType, ExtendedKeyUsagePurpose, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use sha2::{Digest, Sha256};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::{archive, TlsError, TlsResult};

/// Subject Common Name used when the caller doesn't supply one.
pub const DEFAULT_SUBJECT: &str = "sstls";

/// How long generated certificates stay valid: roughly ten years.
pub const DEFAULT_LIFESPAN: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// A certificate and its private key, in both PEM and DER form.
#[derive(Debug)]
pub struct CertifiedPair {
    /// PEM-encoded leaf certificate.
    pub cert_pem: String,
    /// PEM-encoded PKCS#8 private key.
    pub key_pem: String,
    /// DER-encoded leaf certificate.
    pub cert_der: CertificateDer<'static>,
    /// DER-encoded private key.
    pub key_der: PrivateKeyDer<'static>,
}

impl CertifiedPair {
    /// Public-key fingerprint of the leaf certificate.
    pub fn fingerprint(&self) -> TlsResult<String> {
        pubkey_fingerprint(&self.cert_der)
    }
}

/// Get a certificate from `cert_file` or generate one if it doesn't exist.
///
/// A newly generated certificate is saved back to `cert_file` for next time;
/// with `cert_file` set to `None` a fresh certificate is generated on every
/// call and not stored. A missing cache file is not an error, a corrupt one
/// is.
pub fn get_certificate(
    subject: &str,
    dns_names: &[String],
    ip_addresses: &[IpAddr],
    lifespan: Duration,
    cert_file: Option<&Path>,
) -> TlsResult<CertifiedPair> {
    if let Some(path) = cert_file {
        match archive::load_cached_certificate(path) {
            Ok(pair) => return Ok(pair),
            Err(TlsError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
    }

    let pair = generate_self_signed(subject, dns_names, ip_addresses, lifespan)?;

    if let Some(path) = cert_file {
        archive::save_certificate(path, &pair.cert_pem, &pair.key_pem)?;
        tracing::debug!(path = %path.display(), "cached generated certificate");
    }

    Ok(pair)
}

/// Generate a bare-bones ECDSA P-256 self-signed certificate.
///
/// The certificate carries the given subject as its Common Name, the given
/// DNS and IP SANs (both may be empty), `DigitalSignature` key usage, and the
/// `ServerAuth` extended key usage.
pub fn generate_self_signed(
    subject: &str,
    dns_names: &[String],
    ip_addresses: &[IpAddr],
    lifespan: Duration,
) -> TlsResult<CertifiedPair> {
    let subject = if subject.is_empty() {
        DEFAULT_SUBJECT
    } else {
        subject
    };
    let lifespan = if lifespan.is_zero() {
        DEFAULT_LIFESPAN
    } else {
        lifespan
    };

    let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;

    let mut params = CertificateParams::new(dns_names.to_vec())?;
    params
        .distinguished_name
        .push(DnType::CommonName, subject);
    for ip in ip_addresses {
        params.subject_alt_names.push(SanType::IpAddress(*ip));
    }
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + lifespan;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let cert = params.self_signed(&key_pair)?;

    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();
    let cert_der = cert.der().clone();
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| TlsError::CertParse(e.to_string()))?;

    Ok(CertifiedPair {
        cert_pem,
        key_pem,
        cert_der,
        key_der,
    })
}

/// SHA-256 public-key fingerprint of a DER-encoded certificate.
///
/// The hash covers the DER-encoded SubjectPublicKeyInfo and is base64-encoded,
/// which is the format curl's `--pinnedpubkey sha256//` expects.
pub fn pubkey_fingerprint(cert_der: &[u8]) -> TlsResult<String> {
    let (_, parsed) = X509Certificate::from_der(cert_der)
        .map_err(|e| TlsError::CertParse(e.to_string()))?;
    let spki = parsed.tbs_certificate.subject_pki.raw;
    Ok(BASE64.encode(Sha256::digest(spki)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_base64_sha256() {
        let pair = generate_self_signed("test", &[], &[], DEFAULT_LIFESPAN).unwrap();
        let fp = pair.fingerprint().unwrap();
        let raw = BASE64.decode(&fp).unwrap();
        assert_eq!(raw.len(), 32, "fingerprint must decode to a SHA-256 hash");
    }

    #[test]
    fn fingerprint_is_stable_for_a_key() {
        let pair = generate_self_signed("test", &[], &[], DEFAULT_LIFESPAN).unwrap();
        let a = pair.fingerprint().unwrap();
        let b = pubkey_fingerprint(&pair.cert_der).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_certs_have_distinct_fingerprints() {
        let a = generate_self_signed("a", &[], &[], DEFAULT_LIFESPAN).unwrap();
        let b = generate_self_signed("b", &[], &[], DEFAULT_LIFESPAN).unwrap();
        assert_ne!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
    }

    #[test]
    fn sans_are_optional() {
        let ips = vec!["127.0.0.1".parse().unwrap()];
        let dns = vec!["shells.example.com".to_string()];
        generate_self_signed("test", &dns, &ips, DEFAULT_LIFESPAN).unwrap();
    }
}
